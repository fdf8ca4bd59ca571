//! # Logical events emitted at task and worker transitions.
//!
//! The [`EventKind`] enum covers three categories:
//! - **Task events**: submitted, started, completed, failed, retrying
//! - **Worker events**: joined, left, paused, resumed
//! - **System events**: queue depth snapshots
//!
//! The [`Event`] struct carries optional metadata: task id and type,
//! priority, worker id, error message, attempt count, backoff delay, and
//! per-priority depths.
//!
//! Delivery is best-effort: emission never blocks or fails the operation
//! that produced the event.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so consumers can order events delivered out-of-order
//! through async channels.
//!
//! ## Example
//! ```rust
//! use taskbroker::{Event, EventKind, Priority};
//!
//! let ev = Event::now(EventKind::TaskFailed)
//!     .with_task("task-42")
//!     .with_task_type("email.send")
//!     .with_priority(Priority::High)
//!     .with_error("boom")
//!     .with_attempt(3);
//!
//! assert_eq!(ev.kind, EventKind::TaskFailed);
//! assert_eq!(ev.task.as_deref(), Some("task-42"));
//! assert_eq!(ev.error.as_deref(), Some("boom"));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::task::Priority;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of broker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Task events ===
    /// Task accepted by submit (or promoted by the scheduler).
    TaskSubmitted,
    /// A worker claimed the task and began executing.
    TaskStarted,
    /// Execution finished successfully.
    TaskCompleted,
    /// Execution failed; the retry decision follows separately.
    TaskFailed,
    /// Task was re-queued for another attempt.
    TaskRetrying,

    // === Worker events ===
    /// A worker pool registered and began heartbeating.
    WorkerJoined,
    /// A worker pool deregistered.
    WorkerLeft,
    /// A worker was paused (locally or via the remote pause key).
    WorkerPaused,
    /// A paused worker resumed claiming.
    WorkerResumed,

    // === System events ===
    /// Periodic queue depth snapshot.
    QueueDepth,
}

/// Broker event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Task id, for task events.
    pub task: Option<String>,
    /// Task type, for task events.
    pub task_type: Option<String>,
    /// Task priority, for task events.
    pub priority: Option<Priority>,
    /// Worker id, for worker events and claims.
    pub worker: Option<String>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Backoff delay before the next attempt (if relevant).
    pub delay: Option<Duration>,
    /// Per-priority pending counts, for depth snapshots.
    pub depths: Option<BTreeMap<Priority, u64>>,
}

impl Event {
    /// Creates a new event of the given kind with the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            task: None,
            task_type: None,
            priority: None,
            worker: None,
            error: None,
            attempt: None,
            delay: None,
            depths: None,
        }
    }

    /// Attaches a task id.
    pub fn with_task(mut self, id: impl Into<String>) -> Self {
        self.task = Some(id.into());
        self
    }

    /// Attaches a task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Attaches a priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attaches a worker id.
    pub fn with_worker(mut self, id: impl Into<String>) -> Self {
        self.worker = Some(id.into());
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Attaches an attempt count.
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a backoff delay.
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Attaches per-priority depths.
    pub fn with_depths(mut self, depths: BTreeMap<Priority, u64>) -> Self {
        self.depths = Some(depths);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::now(EventKind::TaskSubmitted);
        let b = Event::now(EventKind::TaskStarted);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builders_attach_metadata() {
        let ev = Event::now(EventKind::TaskRetrying)
            .with_task("task-1")
            .with_worker("w1")
            .with_attempt(2)
            .with_delay(Duration::from_secs(4));
        assert_eq!(ev.task.as_deref(), Some("task-1"));
        assert_eq!(ev.worker.as_deref(), Some("w1"));
        assert_eq!(ev.attempt, Some(2));
        assert_eq!(ev.delay, Some(Duration::from_secs(4)));
    }
}
