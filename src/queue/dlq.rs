//! # Dead-letter queue.
//!
//! Quarantine for tasks that exhausted their retry budget (or were routed
//! here explicitly). Backed by a dedicated stream of entry records plus a
//! membership set for O(1) `contains`/`size`.
//!
//! ## Rules
//! - `add` settles the task record as `dead_letter` before the quarantine
//!   entry is appended; a rejected direct transition is forced only when
//!   coming from `failed`/`retrying`
//! - `retry` runs the full manual requeue: state reset, fresh submit, then
//!   entry removal
//! - Lookup by task id scans the stream (acceptable for small DLQs); a
//!   known `message_id` skips the scan

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::queue::TaskQueue;
use crate::store::{keys, Store};
use crate::task::{StateMachine, Task, TaskState};

/// Record embedded in each quarantine stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The quarantined task as it looked on arrival.
    pub task: Task,
    /// Why the task was quarantined.
    pub reason: String,
    /// When it was quarantined.
    pub added_at: DateTime<Utc>,
    /// The error of the last failed attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
    /// Stream entry id; cursor for deletion. Populated on read.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
}

/// Quarantine stream + membership set for exhausted tasks.
pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
}

impl DeadLetterQueue {
    /// Creates a handle over the store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Quarantines a task.
    ///
    /// Transitions the record to `dead_letter` (forcing the state when the
    /// table rejects the direct move), persists it through the queue so
    /// retention applies, appends the quarantine entry, and adds the id to
    /// the membership set.
    pub async fn add(
        &self,
        queue: &TaskQueue,
        task: &mut Task,
        reason: &str,
    ) -> Result<(), BrokerError> {
        if StateMachine::new(task).move_to_dlq().is_err() {
            task.state = TaskState::DeadLetter;
            task.updated_at = Utc::now();
            task.completed_at.get_or_insert_with(Utc::now);
        }
        queue.update(task).await?;

        let entry = DlqEntry {
            task: task.clone(),
            reason: reason.to_string(),
            added_at: Utc::now(),
            original_error: task.error.clone(),
            message_id: String::new(),
        };
        let data = serde_json::to_string(&entry)?;

        self.store
            .append(
                keys::DLQ_STREAM,
                &[
                    ("task_id", task.id.as_str()),
                    ("type", task.task_type.as_str()),
                    ("data", data.as_str()),
                ],
            )
            .await?;
        self.store.set_add(keys::DLQ_SET, &task.id).await?;

        info!(task_id = %task.id, reason, "task moved to dead-letter queue");
        Ok(())
    }

    /// Lists quarantine entries from `cursor` onward, capped at `limit`
    /// when nonzero. Unparseable entries are skipped.
    pub async fn list(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Vec<DlqEntry>, BrokerError> {
        let start = cursor.unwrap_or("-");
        let messages = self.store.range(keys::DLQ_STREAM, start, "+", limit).await?;

        let mut entries = Vec::with_capacity(messages.len());
        for msg in messages {
            let Some(data) = msg.field("data") else {
                continue;
            };
            match serde_json::from_str::<DlqEntry>(data) {
                Ok(mut entry) => {
                    entry.message_id = msg.id;
                    entries.push(entry);
                }
                Err(e) => {
                    warn!(message_id = %msg.id, error = %e, "unparseable DLQ entry; skipping");
                }
            }
        }
        Ok(entries)
    }

    /// Removes one quarantine entry and its membership mark.
    pub async fn remove(&self, task_id: &str, message_id: &str) -> Result<(), BrokerError> {
        if !message_id.is_empty() {
            self.store
                .delete_entries(keys::DLQ_STREAM, &[message_id.to_string()])
                .await?;
        }
        self.store.set_remove(keys::DLQ_SET, task_id).await
    }

    /// Replays one quarantined task into the live queue.
    ///
    /// Finds the entry (by scan when `message_id` is unknown), resets the
    /// contained task via requeue, submits it fresh, then deletes the
    /// quarantine entry.
    pub async fn retry(
        &self,
        queue: &TaskQueue,
        task_id: &str,
        message_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let entry = match message_id {
            Some(id) => self
                .store
                .range(keys::DLQ_STREAM, id, id, 1)
                .await?
                .into_iter()
                .next()
                .and_then(|msg| {
                    msg.field("data")
                        .and_then(|d| serde_json::from_str::<DlqEntry>(d).ok())
                        .map(|mut e| {
                            e.message_id = msg.id;
                            e
                        })
                }),
            None => self
                .list(0, None)
                .await?
                .into_iter()
                .find(|e| e.task.id == task_id),
        };

        let Some(mut entry) = entry else {
            return Err(BrokerError::TaskNotFound {
                id: task_id.to_string(),
            });
        };

        StateMachine::new(&mut entry.task).requeue()?;
        queue.submit(&entry.task).await?;
        self.remove(task_id, &entry.message_id).await?;

        info!(task_id, "dead-letter task replayed");
        Ok(())
    }

    /// Replays every quarantined task; returns the number of successes.
    pub async fn retry_all(&self, queue: &TaskQueue) -> Result<usize, BrokerError> {
        let entries = self.list(0, None).await?;
        let mut replayed = 0;
        for entry in entries {
            match self
                .retry(queue, &entry.task.id, Some(&entry.message_id))
                .await
            {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(task_id = %entry.task.id, error = %e, "dead-letter replay failed");
                }
            }
        }
        Ok(replayed)
    }

    /// Number of quarantined tasks.
    pub async fn size(&self) -> Result<u64, BrokerError> {
        self.store.set_len(keys::DLQ_SET).await
    }

    /// Membership check by task id.
    pub async fn contains(&self, task_id: &str) -> Result<bool, BrokerError> {
        self.store.set_contains(keys::DLQ_SET, task_id).await
    }

    /// Drops the quarantine stream and membership set.
    pub async fn clear(&self) -> Result<(), BrokerError> {
        self.store.delete_stream(keys::DLQ_STREAM).await?;
        self.store.set_clear(keys::DLQ_SET).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::events::Bus;
    use crate::store::MemoryStore;
    use crate::task::{Payload, Priority};
    use std::time::Duration;

    async fn fixture() -> (Arc<dyn Store>, TaskQueue, DeadLetterQueue) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = QueueConfig::default();
        cfg.block_timeout = Duration::from_millis(30);
        let queue = TaskQueue::new(store.clone(), &cfg, Bus::new(64))
            .await
            .unwrap();
        let dlq = DeadLetterQueue::new(store.clone());
        (store, queue, dlq)
    }

    fn failed_task() -> Task {
        let mut t = Task::new("echo", Payload::new(), Priority::Normal).with_max_retries(0);
        let mut sm = StateMachine::new(&mut t);
        sm.start("w1").unwrap();
        sm.fail("boom").unwrap();
        t
    }

    #[tokio::test]
    async fn add_settles_record_and_tracks_membership() {
        let (_store, queue, dlq) = fixture().await;
        let mut t = failed_task();
        dlq.add(&queue, &mut t, "max retries exceeded").await.unwrap();

        assert_eq!(t.state, TaskState::DeadLetter);
        assert_eq!(
            queue.get_task(&t.id).await.unwrap().state,
            TaskState::DeadLetter
        );
        assert!(dlq.contains(&t.id).await.unwrap());
        assert_eq!(dlq.size().await.unwrap(), 1);

        let entries = dlq.list(10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "max retries exceeded");
        assert_eq!(entries[0].original_error.as_deref(), Some("boom"));
        assert!(!entries[0].message_id.is_empty());
    }

    #[tokio::test]
    async fn retry_replays_into_the_queue() {
        let (_store, queue, dlq) = fixture().await;
        let mut t = failed_task();
        dlq.add(&queue, &mut t, "max retries exceeded").await.unwrap();

        dlq.retry(&queue, &t.id, None).await.unwrap();

        assert!(!dlq.contains(&t.id).await.unwrap());
        assert_eq!(dlq.size().await.unwrap(), 0);
        let (claimed, _) = queue.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, t.id);
        assert_eq!(claimed.state, TaskState::Pending);
        assert_eq!(claimed.attempts, 0);
        assert!(claimed.error.is_none());
    }

    #[tokio::test]
    async fn retry_all_counts_successes() {
        let (_store, queue, dlq) = fixture().await;
        let mut a = failed_task();
        let mut b = failed_task();
        dlq.add(&queue, &mut a, "max retries exceeded").await.unwrap();
        dlq.add(&queue, &mut b, "max retries exceeded").await.unwrap();

        assert_eq!(dlq.retry_all(&queue).await.unwrap(), 2);
        assert_eq!(dlq.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_missing_task_errors() {
        let (_store, queue, dlq) = fixture().await;
        assert!(matches!(
            dlq.retry(&queue, "task-nope", None).await,
            Err(BrokerError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let (_store, queue, dlq) = fixture().await;
        let mut t = failed_task();
        dlq.add(&queue, &mut t, "max retries exceeded").await.unwrap();

        dlq.clear().await.unwrap();
        assert_eq!(dlq.size().await.unwrap(), 0);
        assert!(dlq.list(10, None).await.unwrap().is_empty());
    }
}
