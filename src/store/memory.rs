//! # In-process store for tests and local development.
//!
//! [`MemoryStore`] implements the full [`Store`] contract hermetically:
//! per-stream entry logs, consumer-group cursors, a PEL with delivery
//! timestamps for idle-based reclaim, TTL keys expired lazily on read, and
//! the ordered/membership sets.
//!
//! ## Rules
//! - Entry ids are zero-padded per-stream sequence numbers: opaque,
//!   monotone, and lexicographically ordered
//! - A group delivers each entry to exactly one consumer; the entry stays
//!   in the PEL until acked, with idle time measured from last delivery
//! - `claim` honors the min-idle guard and bumps the delivery count
//! - Blocking reads park on a notifier; every append wakes all waiters

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::BrokerError;
use crate::store::{PendingEntry, Store, StreamMessage};

#[derive(Clone)]
struct Entry {
    seq: u64,
    id: String,
    fields: Vec<(String, String)>,
}

struct PelRecord {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct Group {
    /// Sequence number of the last entry handed out as "new".
    cursor: u64,
    /// Delivered-but-unacked entries, keyed by entry id (ordered).
    pel: BTreeMap<String, PelRecord>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<Entry>,
    groups: HashMap<String, Group>,
}

struct ValueRecord {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueRecord {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, ValueRecord>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
}

/// Hermetic [`Store`] backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_id(seq: u64) -> String {
        // Zero-padded so BTreeMap/string order equals append order.
        format!("{seq:020}-0")
    }

    /// Delivers up to `count` new messages from the first stream (in the
    /// given order) that has backlog for `group`.
    fn try_deliver(
        inner: &mut Inner,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Vec<StreamMessage> {
        for name in streams {
            let Some(stream) = inner.streams.get_mut(name) else {
                continue;
            };
            let Some(g) = stream.groups.get_mut(group) else {
                continue;
            };

            let mut out = Vec::new();
            let cursor = g.cursor;
            for entry in stream.entries.iter().filter(|e| e.seq > cursor) {
                if out.len() >= count {
                    break;
                }
                g.cursor = entry.seq;
                g.pel.insert(
                    entry.id.clone(),
                    PelRecord {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        delivery_count: 1,
                    },
                );
                out.push(StreamMessage {
                    stream: name.clone(),
                    id: entry.id.clone(),
                    fields: entry.fields.clone(),
                });
            }
            if !out.is_empty() {
                return out;
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let s = inner.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, BrokerError> {
        let id = {
            let mut inner = self.inner.lock().await;
            let s = inner.streams.entry(stream.to_string()).or_default();
            s.next_seq += 1;
            let seq = s.next_seq;
            let id = Self::entry_id(seq);
            s.entries.push(Entry {
                seq,
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let deadline = block.map(|d| Instant::now() + d);

        loop {
            // Register interest before checking, so an append racing the
            // check cannot be lost.
            let notified = self.appended.notified();

            {
                let mut inner = self.inner.lock().await;
                let out = Self::try_deliver(&mut inner, group, consumer, streams, count);
                if !out.is_empty() {
                    return Ok(out);
                }
            }

            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.streams.get_mut(stream) {
            if let Some(g) = s.groups.get_mut(group) {
                g.pel.remove(id);
            }
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let inner = self.inner.lock().await;
        let Some(s) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        Ok(g.pel
            .iter()
            .take(count)
            .map(|(id, rec)| PendingEntry {
                id: id.clone(),
                consumer: rec.consumer.clone(),
                idle: now.duration_since(rec.delivered_at),
                delivery_count: rec.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut inner = self.inner.lock().await;
        let Some(s) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let Some(rec) = g.pel.get_mut(id) else {
            // Already acked by its legitimate owner: transfer rejected.
            return Ok(Vec::new());
        };
        if rec.delivered_at.elapsed() < min_idle {
            return Ok(Vec::new());
        }

        let Some(entry) = s.entries.iter().find(|e| e.id == id) else {
            // Entry deleted from the log; drop the dangling PEL record.
            g.pel.remove(id);
            return Ok(Vec::new());
        };

        rec.consumer = consumer.to_string();
        rec.delivered_at = Instant::now();
        rec.delivery_count += 1;

        Ok(vec![StreamMessage {
            stream: stream.to_string(),
            id: entry.id.clone(),
            fields: entry.fields.clone(),
        }])
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let inner = self.inner.lock().await;
        let Some(s) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for entry in &s.entries {
            if start != "-" && entry.id.as_str() < start {
                continue;
            }
            if end != "+" && entry.id.as_str() > end {
                break;
            }
            out.push(StreamMessage {
                stream: stream.to_string(),
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
            if count > 0 && out.len() >= count {
                break;
            }
        }
        Ok(out)
    }

    async fn delete_entries(&self, stream: &str, ids: &[String]) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.streams.get_mut(stream) {
            s.entries.retain(|e| !ids.contains(&e.id));
        }
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.streams.remove(stream);
        Ok(())
    }

    async fn group_pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pel.len() as u64)
            .unwrap_or(0))
    }

    async fn kv_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            ValueRecord {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().await;
        match inner.kv.get(key) {
            Some(rec) if rec.live() => Ok(Some(rec.value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        Ok(())
    }

    async fn kv_exists(&self, key: &str) -> Result<bool, BrokerError> {
        Ok(self.kv_get(key).await?.is_some())
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock().await;
        let taken = inner.kv.get(key).map(ValueRecord::live).unwrap_or(false);
        if taken {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            ValueRecord {
                value: "1".to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError> {
        self.kv_delete(key).await
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(z) = inner.zsets.get_mut(key) {
            z.remove(member);
        }
        Ok(())
    }

    async fn zset_range_up_to(
        &self,
        key: &str,
        max_score: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let inner = self.inner.lock().await;
        let Some(z) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&i64, &String)> = z
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (s, m))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn zset_len(&self, key: &str) -> Result<u64, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if let Some(s) = inner.sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<u64, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn set_clear(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.sets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_each_entry_to_one_consumer() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        store.append("s", &[("task_id", "t1")]).await.unwrap();

        let streams = vec!["s".to_string()];
        let a = store.read_group("g", "c1", &streams, 1, None).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].field("task_id"), Some("t1"));

        // Same entry is never handed out as "new" again.
        let b = store.read_group("g", "c2", &streams, 1, None).await.unwrap();
        assert!(b.is_empty());
        assert_eq!(store.group_pending_count("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ack_clears_the_pel() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        store.append("s", &[("task_id", "t1")]).await.unwrap();

        let streams = vec!["s".to_string()];
        let got = store.read_group("g", "c1", &streams, 1, None).await.unwrap();
        store.ack("s", "g", &got[0].id).await.unwrap();
        assert_eq!(store.group_pending_count("s", "g").await.unwrap(), 0);
        assert!(store.pending("s", "g", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_min_idle() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        store.append("s", &[("task_id", "t1")]).await.unwrap();

        let streams = vec!["s".to_string()];
        let got = store.read_group("g", "c1", &streams, 1, None).await.unwrap();
        let id = got[0].id.clone();

        // Too fresh: guard rejects.
        let early = store
            .claim("s", "g", "c2", Duration::from_millis(80), &id)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let claimed = store
            .claim("s", "g", "c2", Duration::from_millis(80), &id)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pel = store.pending("s", "g", 10).await.unwrap();
        assert_eq!(pel[0].consumer, "c2");
        assert_eq!(pel[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn claim_after_ack_is_rejected() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        store.append("s", &[("task_id", "t1")]).await.unwrap();

        let streams = vec!["s".to_string()];
        let got = store.read_group("g", "c1", &streams, 1, None).await.unwrap();
        let id = got[0].id.clone();
        store.ack("s", "g", &id).await.unwrap();

        let claimed = store
            .claim("s", "g", "c2", Duration::ZERO, &id)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.create_group("s", "g").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group(
                        "g",
                        "c1",
                        &["s".to_string()],
                        1,
                        Some(Duration::from_secs(5)),
                    )
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.append("s", &[("task_id", "t1")]).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake")
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_lease("lock", Duration::from_millis(60))
            .await
            .unwrap());
        assert!(!store
            .acquire_lease("lock", Duration::from_millis(60))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store
            .acquire_lease("lock", Duration::from_millis(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn kv_ttl_expires_on_read() {
        let store = MemoryStore::new();
        store
            .kv_set("k", "v", Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(store.kv_exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.kv_exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn zset_range_is_score_ordered() {
        let store = MemoryStore::new();
        store.zset_add("z", "late", 300).await.unwrap();
        store.zset_add("z", "early", 100).await.unwrap();
        store.zset_add("z", "mid", 200).await.unwrap();

        let due = store.zset_range_up_to("z", 250).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "mid".to_string()]);
        assert_eq!(store.zset_len("z").await.unwrap(), 3);
    }
}
