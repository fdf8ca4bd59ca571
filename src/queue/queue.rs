//! # The durable task queue over priority streams.
//!
//! [`TaskQueue`] owns the submit/claim/ack cycle. One stream per priority,
//! all four sharing a single consumer group; a worker is a named consumer
//! within that group.
//!
//! ## Data flow
//! ```text
//! submit(task)
//!   ├─► task:{id} = serialized record        (authoritative state)
//!   └─► XADD {prefix}:{priority} {task_id, type}   (lightweight ref)
//!
//! claim_next(worker)
//!   ├─► blocking group read over critical..low
//!   ├─► resolve task_id → record
//!   │     └─► missing/corrupt record: ack + discard (poison path)
//!   └─► (task, stream_message_id)
//!
//! ack(task, message_id)
//!   └─► XACK on the task's priority stream (clears PEL entry)
//! ```
//!
//! ## Rules
//! - The record is written before the stream entry; a failed append deletes
//!   the record so the caller can retry cleanly
//! - Which stream wins inside one blocking read is store-chosen; strict
//!   highest-first scanning is available via [`claim_once`](TaskQueue::claim_once)
//! - Settled records get the configured retention TTL on update
//! - The queue holds no state between calls; recovery is the worker pool's job

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::QueueConfig;
use crate::error::BrokerError;
use crate::events::{Bus, Event, EventKind};
use crate::store::{keys, Store};
use crate::task::{Priority, StateMachine, Task, CLAIM_ORDER};

/// Durable submit/claim/ack over the store's priority streams.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    bus: Bus,
    stream_prefix: String,
    consumer_group: String,
    max_queue_size: u64,
    block_timeout: Duration,
    claim_min_idle: Duration,
    retention_ttl: Option<Duration>,
}

impl TaskQueue {
    /// Creates the queue and the consumer group on every priority stream
    /// (idempotent).
    pub async fn new(
        store: Arc<dyn Store>,
        cfg: &QueueConfig,
        bus: Bus,
    ) -> Result<Self, BrokerError> {
        let queue = Self {
            store,
            bus,
            stream_prefix: cfg.stream_prefix.clone(),
            consumer_group: cfg.consumer_group.clone(),
            max_queue_size: cfg.max_queue_size,
            block_timeout: cfg.block_timeout,
            claim_min_idle: cfg.claim_min_idle,
            retention_ttl: cfg.retention_ttl(),
        };

        for priority in CLAIM_ORDER {
            queue
                .store
                .create_group(&queue.stream(priority), &queue.consumer_group)
                .await?;
        }
        Ok(queue)
    }

    /// Stream name of one priority level.
    pub fn stream(&self, priority: Priority) -> String {
        priority.stream_name(&self.stream_prefix)
    }

    /// All four streams in claim-scan order.
    fn streams(&self) -> Vec<String> {
        CLAIM_ORDER.iter().map(|p| self.stream(*p)).collect()
    }

    /// Persists the record and appends its reference to the priority stream.
    ///
    /// When `max_queue_size` is configured and the summed pending depth has
    /// reached it, submission fails with [`BrokerError::Backpressure`].
    /// A failed stream append deletes the freshly written record.
    pub async fn submit(&self, task: &Task) -> Result<(), BrokerError> {
        if self.max_queue_size > 0 {
            let depth: u64 = self.queue_depths().await?.values().sum();
            if depth >= self.max_queue_size {
                return Err(BrokerError::Backpressure {
                    depth,
                    limit: self.max_queue_size,
                });
            }
        }

        let key = keys::task_key(&task.id);
        self.store.kv_set(&key, &task.to_json()?, None).await?;

        let append = self
            .store
            .append(
                &self.stream(task.priority),
                &[("task_id", task.id.as_str()), ("type", task.task_type.as_str())],
            )
            .await;

        if let Err(e) = append {
            self.store.kv_delete(&key).await.ok();
            return Err(e);
        }

        self.bus.publish(
            Event::now(EventKind::TaskSubmitted)
                .with_task(&task.id)
                .with_task_type(&task.task_type)
                .with_priority(task.priority),
        );
        Ok(())
    }

    /// Blocks up to `block_timeout` for the next message across all
    /// priority streams and resolves it to its task record.
    ///
    /// Returns `Ok(None)` on timeout. A message whose record is missing or
    /// unparseable is acked and discarded, and the call reports "no task".
    pub async fn claim_next(
        &self,
        worker_id: &str,
    ) -> Result<Option<(Task, String)>, BrokerError> {
        let messages = self
            .store
            .read_group(
                &self.consumer_group,
                worker_id,
                &self.streams(),
                1,
                Some(self.block_timeout),
            )
            .await?;

        let Some(msg) = messages.into_iter().next() else {
            return Ok(None);
        };
        self.resolve_message(msg.stream.as_str(), &msg.id, msg.field("task_id"))
            .await
    }

    /// Non-blocking claim scanning streams strictly highest-priority first.
    pub async fn claim_once(&self, worker_id: &str) -> Result<Option<(Task, String)>, BrokerError> {
        for priority in CLAIM_ORDER {
            let stream = self.stream(priority);
            let messages = self
                .store
                .read_group(&self.consumer_group, worker_id, &[stream.clone()], 1, None)
                .await?;

            if let Some(msg) = messages.into_iter().next() {
                let resolved = self
                    .resolve_message(&stream, &msg.id, msg.field("task_id"))
                    .await?;
                if resolved.is_some() {
                    return Ok(resolved);
                }
                // Poison entry discarded; keep scanning this pass.
            }
        }
        Ok(None)
    }

    /// Resolves a claimed stream message to its task record, acking and
    /// discarding poison entries.
    async fn resolve_message(
        &self,
        stream: &str,
        message_id: &str,
        task_id: Option<&str>,
    ) -> Result<Option<(Task, String)>, BrokerError> {
        let Some(task_id) = task_id else {
            warn!(stream, message_id, "stream entry without task_id; discarding");
            self.store
                .ack(stream, &self.consumer_group, message_id)
                .await?;
            return Ok(None);
        };

        match self.get_task(task_id).await {
            Ok(task) => Ok(Some((task, message_id.to_string()))),
            Err(e) => {
                warn!(
                    stream,
                    message_id,
                    task_id,
                    error = e.as_label(),
                    "unresolvable stream entry; discarding"
                );
                self.store
                    .ack(stream, &self.consumer_group, message_id)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Acknowledges a delivered message on the task's priority stream,
    /// removing it from the pending entry list.
    pub async fn ack(&self, task: &Task, message_id: &str) -> Result<(), BrokerError> {
        self.store
            .ack(&self.stream(task.priority), &self.consumer_group, message_id)
            .await
    }

    /// Loads a task record by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Task, BrokerError> {
        let data = self
            .store
            .kv_get(&keys::task_key(task_id))
            .await?
            .ok_or_else(|| BrokerError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        Ok(Task::from_json(&data)?)
    }

    /// Serializes and overwrites the record.
    ///
    /// Settled records get the configured retention TTL; live records never
    /// expire.
    pub async fn update(&self, task: &Task) -> Result<(), BrokerError> {
        let ttl = if task.state.is_final() {
            self.retention_ttl
        } else {
            None
        };
        self.store
            .kv_set(&keys::task_key(&task.id), &task.to_json()?, ttl)
            .await
    }

    /// Removes a task record.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), BrokerError> {
        self.store.kv_delete(&keys::task_key(task_id)).await
    }

    /// Cancels a task that has not settled yet.
    ///
    /// The stream entry, if one exists, is not withdrawn: it is acked and
    /// discarded at claim time because the state machine rejects `start`
    /// on a cancelled record.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, BrokerError> {
        let mut task = self.get_task(task_id).await?;
        StateMachine::new(&mut task).cancel()?;
        self.update(&task).await?;
        Ok(task)
    }

    /// Manually requeues a `failed` or `dead_letter` task: full reset via
    /// the state machine, then a fresh submit.
    pub async fn requeue(&self, task_id: &str) -> Result<Task, BrokerError> {
        let mut task = self.get_task(task_id).await?;
        StateMachine::new(&mut task).requeue()?;
        self.submit(&task).await?;
        Ok(task)
    }

    /// Per-priority pending counts of the consumer group.
    pub async fn queue_depths(&self) -> Result<BTreeMap<Priority, u64>, BrokerError> {
        let mut depths = BTreeMap::new();
        for priority in CLAIM_ORDER {
            let count = self
                .store
                .group_pending_count(&self.stream(priority), &self.consumer_group)
                .await?;
            depths.insert(priority, count);
        }
        Ok(depths)
    }

    /// Enumerates sufficiently idle pending entries on every priority
    /// stream and transfers their ownership to `worker_id`.
    ///
    /// Each priority scans up to 100 entries per pass. A transfer racing a
    /// legitimate consumer that just finished is rejected by the store's
    /// min-idle guard; such entries are skipped silently.
    pub async fn reclaim_orphans(
        &self,
        worker_id: &str,
    ) -> Result<Vec<(Task, String)>, BrokerError> {
        let mut reclaimed = Vec::new();

        for priority in CLAIM_ORDER {
            let stream = self.stream(priority);
            let pending = self
                .store
                .pending(&stream, &self.consumer_group, 100)
                .await?;

            for entry in pending {
                if entry.idle < self.claim_min_idle {
                    continue;
                }

                let claimed = self
                    .store
                    .claim(
                        &stream,
                        &self.consumer_group,
                        worker_id,
                        self.claim_min_idle,
                        &entry.id,
                    )
                    .await?;

                let Some(msg) = claimed.into_iter().next() else {
                    continue;
                };
                let Some(task_id) = msg.field("task_id") else {
                    continue;
                };
                match self.get_task(task_id).await {
                    Ok(task) => reclaimed.push((task, msg.id)),
                    Err(e) => {
                        warn!(task_id, error = e.as_label(), "reclaimed entry without record");
                    }
                }
            }
        }

        Ok(reclaimed)
    }

    /// Drops one priority stream and recreates it empty with the consumer
    /// group at the beginning.
    pub async fn purge(&self, priority: Priority) -> Result<(), BrokerError> {
        let stream = self.stream(priority);
        self.store.delete_stream(&stream).await?;
        self.store.create_group(&stream, &self.consumer_group).await
    }

    /// Appends a bare reference entry for an already persisted task.
    ///
    /// Used by the scheduler after promoting a record it has just updated.
    pub(crate) async fn append_ref(&self, task: &Task) -> Result<String, BrokerError> {
        self.store
            .append(
                &self.stream(task.priority),
                &[("task_id", task.id.as_str()), ("type", task.task_type.as_str())],
            )
            .await
    }

    /// The event bus this queue publishes on.
    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Store handle shared with sibling components.
    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::{Payload, TaskState};

    async fn queue() -> TaskQueue {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = QueueConfig::default();
        cfg.block_timeout = Duration::from_millis(50);
        cfg.claim_min_idle = Duration::from_millis(80);
        TaskQueue::new(store, &cfg, Bus::new(64)).await.unwrap()
    }

    fn task(priority: Priority) -> Task {
        Task::new("echo", Payload::new(), priority)
    }

    #[tokio::test]
    async fn submit_then_claim_round_trip() {
        let q = queue().await;
        let t = task(Priority::High);
        q.submit(&t).await.unwrap();

        let (claimed, message_id) = q.claim_next("w1").await.unwrap().expect("task available");
        assert_eq!(claimed.id, t.id);
        assert_eq!(claimed.state, TaskState::Pending);

        q.ack(&claimed, &message_id).await.unwrap();
        let depths = q.queue_depths().await.unwrap();
        assert_eq!(depths.values().sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn claim_times_out_on_empty_queue() {
        let q = queue().await;
        assert!(q.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_once_prefers_critical() {
        let q = queue().await;
        let low = task(Priority::Low);
        let normal = task(Priority::Normal);
        let high = task(Priority::High);
        let critical = task(Priority::Critical);
        for t in [&low, &normal, &high, &critical] {
            q.submit(t).await.unwrap();
        }

        let (first, _) = q.claim_once("w1").await.unwrap().unwrap();
        assert_eq!(first.id, critical.id);
        let (second, _) = q.claim_once("w1").await.unwrap().unwrap();
        assert_eq!(second.id, high.id);
        let (third, _) = q.claim_once("w1").await.unwrap().unwrap();
        assert_eq!(third.id, normal.id);
        let (fourth, _) = q.claim_once("w1").await.unwrap().unwrap();
        assert_eq!(fourth.id, low.id);
    }

    #[tokio::test]
    async fn missing_record_is_acked_and_discarded() {
        let q = queue().await;
        let t = task(Priority::Normal);
        q.submit(&t).await.unwrap();
        q.delete_task(&t.id).await.unwrap();

        assert!(q.claim_next("w1").await.unwrap().is_none());
        // Poison entry left no pending state behind.
        assert_eq!(q.queue_depths().await.unwrap().values().sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_record_is_updated() {
        let q = queue().await;
        let t = task(Priority::Normal);
        q.submit(&t).await.unwrap();
        let cancelled = q.cancel(&t.id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn reclaim_returns_idle_claims_only() {
        let q = queue().await;
        let t = task(Priority::Normal);
        q.submit(&t).await.unwrap();

        let (_claimed, message_id) = q.claim_next("w1").await.unwrap().unwrap();

        // Fresh claim: nothing to reclaim yet.
        assert!(q.reclaim_orphans("w2").await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reclaimed = q.reclaim_orphans("w2").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0.id, t.id);
        assert_eq!(reclaimed[0].1, message_id);
    }

    #[tokio::test]
    async fn backpressure_rejects_when_full() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = QueueConfig::default();
        cfg.max_queue_size = 1;
        cfg.block_timeout = Duration::from_millis(20);
        let q = TaskQueue::new(store, &cfg, Bus::new(16)).await.unwrap();

        let t1 = task(Priority::Normal);
        q.submit(&t1).await.unwrap();
        // Depth counts delivered-but-unacked entries; claim to populate it.
        let _ = q.claim_next("w1").await.unwrap().unwrap();

        let t2 = task(Priority::Normal);
        match q.submit(&t2).await {
            Err(BrokerError::Backpressure { depth, limit }) => {
                assert_eq!(depth, 1);
                assert_eq!(limit, 1);
            }
            other => panic!("expected backpressure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn purge_resets_a_stream() {
        let q = queue().await;
        q.submit(&task(Priority::Low)).await.unwrap();
        q.purge(Priority::Low).await.unwrap();
        assert!(q.claim_next("w1").await.unwrap().is_none());
    }
}
