//! # Delayed-task scheduler.
//!
//! The [`Scheduler`] polls the delayed index (an ordered set scored by due
//! epoch seconds) and promotes due tasks into their priority streams.
//!
//! ## Promotion pass
//! ```text
//! tick (every poll_interval)
//!   ├─► acquire scheduler:lock (TTL 5s)  — skip the tick when held elsewhere
//!   ├─► read index entries with score <= now
//!   │     for each task id:
//!   │       ├─► record missing        → drop index entry
//!   │       ├─► state != scheduled    → drop index entry (cancelled/promoted)
//!   │       ├─► scheduled → pending, persist
//!   │       ├─► append {task_id, type} to the priority stream
//!   │       └─► drop index entry
//!   └─► release scheduler:lock
//! ```
//!
//! ## Rules
//! - Promotion steps are ordered, not transactional: a crash mid-pass
//!   leaves the task either still `scheduled` (next tick retries) or
//!   `pending` with a stale index entry removed by the state check
//! - The lease keeps concurrent promoters out; losing the race skips the
//!   tick, it is not an error
//! - Transient store errors are logged and the loop continues

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::BrokerError;
use crate::events::{Event, EventKind};
use crate::queue::TaskQueue;
use crate::store::keys;
use crate::task::{StateMachine, TaskState};

/// Default cadence of promotion passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// TTL of the promotion lease.
const LOCK_TTL: Duration = Duration::from_secs(5);

/// Cooperative loop promoting due delayed tasks into the queue.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
}

impl Scheduler {
    /// Creates a scheduler with the default poll interval.
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Parks a task in the delayed index.
    ///
    /// The task must already carry `state = scheduled` and a due time
    /// (see [`Task::with_scheduled_at`](crate::task::Task::with_scheduled_at)).
    /// The record is persisted first; a failed index insert deletes it so
    /// the caller can retry cleanly.
    pub async fn schedule(&self, task: &crate::task::Task) -> Result<(), BrokerError> {
        if task.state != TaskState::Scheduled {
            return Err(BrokerError::InvalidTransition {
                from: task.state,
                to: TaskState::Scheduled,
            });
        }
        let Some(due) = task.scheduled_at else {
            return Err(BrokerError::InvalidTaskData {
                reason: "scheduled task without scheduled_at".to_string(),
            });
        };

        self.queue.update(task).await?;
        let added = self
            .queue
            .store()
            .zset_add(keys::SCHEDULED_SET, &task.id, due.timestamp())
            .await;
        if let Err(e) = added {
            self.queue.delete_task(&task.id).await.ok();
            return Err(e);
        }
        Ok(())
    }

    /// Removes a task from the delayed index without touching its record.
    pub async fn unschedule(&self, task_id: &str) -> Result<(), BrokerError> {
        self.queue
            .store()
            .zset_remove(keys::SCHEDULED_SET, task_id)
            .await
    }

    /// Number of tasks parked in the delayed index.
    pub async fn scheduled_count(&self) -> Result<u64, BrokerError> {
        self.queue.store().zset_len(keys::SCHEDULED_SET).await
    }

    /// Runs one promotion pass under the store lease.
    ///
    /// Returns the number of tasks promoted; `0` includes the case where
    /// another promoter holds the lease.
    pub async fn tick(&self) -> Result<usize, BrokerError> {
        let store = self.queue.store();
        if !store.acquire_lease(keys::SCHEDULER_LOCK, LOCK_TTL).await? {
            return Ok(0);
        }

        let result = self.promote_due().await;
        store.release_lease(keys::SCHEDULER_LOCK).await.ok();
        result
    }

    async fn promote_due(&self) -> Result<usize, BrokerError> {
        let store = self.queue.store();
        let due = store
            .zset_range_up_to(keys::SCHEDULED_SET, Utc::now().timestamp())
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "promoting due scheduled tasks");

        let mut promoted = 0;
        for task_id in due {
            match self.promote(&task_id).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "failed to promote scheduled task");
                }
            }
        }
        Ok(promoted)
    }

    /// Promotes one index entry; false means the entry was stale and only
    /// cleaned up.
    async fn promote(&self, task_id: &str) -> Result<bool, BrokerError> {
        let store = self.queue.store();

        let mut task = match self.queue.get_task(task_id).await {
            Ok(task) => task,
            Err(BrokerError::TaskNotFound { .. }) => {
                store.zset_remove(keys::SCHEDULED_SET, task_id).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if task.state != TaskState::Scheduled {
            // Cancelled or already promoted by an earlier crashed pass.
            store.zset_remove(keys::SCHEDULED_SET, task_id).await?;
            return Ok(false);
        }

        StateMachine::new(&mut task).transition(TaskState::Pending)?;
        self.queue.update(&task).await?;
        self.queue.append_ref(&task).await?;
        store.zset_remove(keys::SCHEDULED_SET, task_id).await?;

        self.queue.bus().publish(
            Event::now(EventKind::TaskSubmitted)
                .with_task(&task.id)
                .with_task_type(&task.task_type)
                .with_priority(task.priority),
        );
        info!(
            task_id,
            task_type = %task.task_type,
            priority = %task.priority,
            "scheduled task promoted"
        );
        Ok(true)
    }

    /// Drives promotion passes until the token fires.
    pub async fn run(&self, token: CancellationToken) {
        info!(poll_interval = ?self.poll_interval, "scheduler started");
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}
