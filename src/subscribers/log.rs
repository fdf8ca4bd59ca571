//! # Logging subscriber.
//!
//! [`LogWriter`] forwards broker events to `tracing` in a terse
//! human-readable form, one line per event.
//!
//! ## Output shape
//! ```text
//! task submitted  task=task-42 type=email.send priority=high
//! task failed     task=task-42 err="boom" attempt=1
//! task retrying   task=task-42 attempt=1 delay=2s
//! worker joined   worker=worker-9f3a
//! ```

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Subscriber that logs every event through `tracing`.
///
/// Useful as a default observer in worker binaries; replace with a custom
/// [`Subscribe`] implementation for metrics or alerting.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::TaskSubmitted => {
                info!(task = ?e.task, task_type = ?e.task_type, priority = ?e.priority, "task submitted");
            }
            EventKind::TaskStarted => {
                info!(task = ?e.task, worker = ?e.worker, attempt = ?e.attempt, "task started");
            }
            EventKind::TaskCompleted => {
                info!(task = ?e.task, attempt = ?e.attempt, "task completed");
            }
            EventKind::TaskFailed => {
                warn!(task = ?e.task, error = ?e.error, attempt = ?e.attempt, "task failed");
            }
            EventKind::TaskRetrying => {
                info!(task = ?e.task, attempt = ?e.attempt, delay = ?e.delay, "task retrying");
            }
            EventKind::WorkerJoined => {
                info!(worker = ?e.worker, "worker joined");
            }
            EventKind::WorkerLeft => {
                info!(worker = ?e.worker, "worker left");
            }
            EventKind::WorkerPaused => {
                info!(worker = ?e.worker, "worker paused");
            }
            EventKind::WorkerResumed => {
                info!(worker = ?e.worker, "worker resumed");
            }
            EventKind::QueueDepth => {
                debug!(depths = ?e.depths, "queue depth");
            }
        }
    }
}
