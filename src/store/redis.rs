//! # Redis implementation of the store port.
//!
//! [`RedisStore`] maps the [`Store`] primitives 1:1 onto Redis commands:
//! streams and consumer groups (`XADD`/`XREADGROUP`/`XACK`/`XPENDING`/
//! `XCLAIM`/`XRANGE`/`XDEL`/`XINFO GROUPS`), plain keys with `PX` TTLs,
//! `SET NX PX` for the lease, sorted sets for the delayed index, and plain
//! sets for membership.
//!
//! Connections come from a `bb8` pool sized by
//! [`StoreConfig`](crate::config::StoreConfig).
//!
//! ## Rules
//! - Group creation tolerates `BUSYGROUP` (idempotent init)
//! - A blocked `XREADGROUP` returning nil is a timeout, not an error
//! - `XINFO GROUPS` on a missing stream reads as zero pending
//! - Transport errors surface as [`BrokerError::StoreUnavailable`]

use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::{bb8, RedisConnectionManager};
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamPendingCountReply, StreamRangeReply,
    StreamReadReply,
};
use redis::Value;

use crate::config::StoreConfig;
use crate::error::BrokerError;
use crate::store::{PendingEntry, Store, StreamMessage};

/// Pooled Redis-backed [`Store`].
pub struct RedisStore {
    pool: bb8::Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Connects to the store and verifies the connection with a ping.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, BrokerError> {
        let manager = RedisConnectionManager::new(cfg.url().as_str())?;
        let pool = bb8::Pool::builder()
            .max_size(cfg.pool_size)
            .min_idle(Some(cfg.min_idle_conns))
            .connection_timeout(cfg.dial_timeout)
            .build(manager)
            .await?;

        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<()>(&mut *conn).await?;
        drop(conn);

        Ok(Self { pool })
    }

    /// Wraps an existing pool (shared with other components).
    pub fn from_pool(pool: bb8::Pool<RedisConnectionManager>) -> Self {
        Self { pool }
    }

    fn field_string(v: &Value) -> Option<String> {
        match v {
            Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::SimpleString(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    fn message_from(stream: &str, entry: &StreamId) -> StreamMessage {
        StreamMessage {
            stream: stream.to_string(),
            id: entry.id.clone(),
            fields: entry
                .map
                .iter()
                .filter_map(|(k, v)| Self::field_string(v).map(|v| (k.clone(), v)))
                .collect(),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let res = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut *conn)
            .await;

        match res {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, BrokerError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }
        Ok(cmd.query_async::<String>(&mut *conn).await?)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("COUNT").arg(count).arg("STREAMS");
        for s in streams {
            cmd.arg(s);
        }
        for _ in streams {
            cmd.arg(">");
        }

        let reply: Option<StreamReadReply> = cmd.query_async(&mut *conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for key in &reply.keys {
            for entry in &key.ids {
                out.push(Self::message_from(&key.key, entry));
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut *conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
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
        let mut conn = self.pool.get().await?;
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(id)
            .query_async(&mut *conn)
            .await?;

        Ok(reply
            .ids
            .iter()
            .map(|entry| Self::message_from(stream, entry))
            .collect())
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg(start).arg(end);
        if count > 0 {
            cmd.arg("COUNT").arg(count);
        }
        let reply: StreamRangeReply = cmd.query_async(&mut *conn).await?;

        Ok(reply
            .ids
            .iter()
            .map(|entry| Self::message_from(stream, entry))
            .collect())
    }

    async fn delete_entries(&self, stream: &str, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id);
        }
        cmd.query_async::<i64>(&mut *conn).await?;
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("DEL")
            .arg(stream)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn group_pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let mut conn = self.pool.get().await?;
        let reply: Result<StreamInfoGroupsReply, _> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut *conn)
            .await;

        // A missing stream has no groups and therefore nothing pending.
        let Ok(reply) = reply else { return Ok(0) };
        Ok(reply
            .groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.pending as u64)
            .unwrap_or(0))
    }

    async fn kv_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut *conn).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.pool.get().await?;
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut *conn)
            .await?)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn kv_exists(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(n > 0)
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError> {
        self.kv_delete(key).await
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn zset_range_up_to(
        &self,
        key: &str,
        max_score: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.pool.get().await?;
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .query_async::<Vec<String>>(&mut *conn)
            .await?)
    }

    async fn zset_len(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = redis::cmd("ZCARD").arg(key).query_async(&mut *conn).await?;
        Ok(n as u64)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<i64>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.pool.get().await?;
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut *conn)
            .await?)
    }

    async fn set_len(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = redis::cmd("SCARD").arg(key).query_async(&mut *conn).await?;
        Ok(n as u64)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(n > 0)
    }

    async fn set_clear(&self, key: &str) -> Result<(), BrokerError> {
        self.kv_delete(key).await
    }
}
