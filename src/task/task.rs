//! # The task record: the broker's central unit of work.
//!
//! A [`Task`] is created by a producer, serialized into the store under
//! `task:{id}`, referenced from a priority stream by `{task_id, type}`,
//! and mutated only through the [`StateMachine`](crate::task::StateMachine)
//! by whichever worker holds the current claim.
//!
//! ## Rules
//! - Identity is assigned at submit time and never changes
//! - `payload` and `result` are opaque JSON maps; the broker never
//!   interprets them
//! - `attempts <= max_retries + 1` over the whole lifecycle
//! - `metadata` is an opaque string map for producer bookkeeping

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{Priority, TaskState};

/// Opaque structured value carried by tasks: payloads and results.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Default retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-execution timeout for new tasks.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A unit of work flowing through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable opaque identifier, assigned at creation.
    pub id: String,
    /// Handler selector; matched against the executor registry.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque input passed verbatim to the handler.
    pub payload: Payload,
    /// Dispatch priority.
    pub priority: Priority,
    /// Lifecycle state; moved only via the state machine.
    pub state: TaskState,
    /// Executions started so far (incremented on each claim).
    pub attempts: u32,
    /// Retry budget: attempts beyond the first allowed before quarantine.
    pub max_retries: u32,
    /// Error message of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler output; present only when `state == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Last claimant, while a claim is or was held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp (UTC).
    pub updated_at: DateTime<Utc>,
    /// First moment of the current/last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Moment the record settled (completed/failed/cancelled/dead_letter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Due time for delayed submission; presence implies `Scheduled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Per-execution deadline.
    pub timeout: Duration,
    /// Opaque producer bookkeeping, never interpreted by the broker.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl Task {
    /// Creates a new pending task with default execution policy.
    ///
    /// Defaults: `max_retries = 3`, `timeout = 300s`, empty metadata.
    pub fn new(task_type: impl Into<String>, payload: Payload, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            task_type: task_type.into(),
            payload,
            priority,
            state: TaskState::Pending,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            result: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_at: None,
            timeout: DEFAULT_TIMEOUT,
            metadata: std::collections::BTreeMap::new(),
        }
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the task for delayed submission at `due`.
    ///
    /// The caller must route such tasks through
    /// [`Scheduler::schedule`](crate::queue::Scheduler::schedule) instead of
    /// plain submit.
    pub fn with_scheduled_at(mut self, due: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(due);
        self.state = TaskState::Scheduled;
        self
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True while another attempt is allowed.
    ///
    /// `max_retries` counts retries beyond the first attempt, so the
    /// lifetime budget is `max_retries + 1` attempts.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Puts the record back on the immediate path after a failed attempt
    /// or an orphan reclaim: state forced to `pending`, delayed-submission
    /// marker cleared, attempt counter preserved.
    ///
    /// This intentionally bypasses the transition table; it is the one
    /// sanctioned shortcut for re-appending a task that is about to be
    /// claimed again.
    pub(crate) fn reset_for_requeue(&mut self) {
        self.state = TaskState::Pending;
        self.scheduled_at = None;
        self.updated_at = Utc::now();
    }

    /// Serializes the record for storage.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a record from storage.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
