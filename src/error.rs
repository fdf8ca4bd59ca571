//! # Error types used by the broker and task execution.
//!
//! This module defines two main error enums:
//!
//! - [`BrokerError`] errors raised by queue, scheduler, DLQ, and store operations.
//! - [`ExecError`] outcomes of a single handler execution.
//!
//! Both types provide `as_label` helpers for logs/metrics.
//! [`ExecError`] additionally exposes `is_timeout()` and `is_canceled()`.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskState;

/// # Errors produced by broker operations.
///
/// These represent failures of the durable layer: illegal lifecycle moves,
/// unreadable records, missing tasks, and store transport faults.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Illegal state move; a programming error at the call site, never retried.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the task was in.
        from: TaskState,
        /// State the caller asked for.
        to: TaskState,
    },

    /// A persisted record could not be decoded.
    ///
    /// On the claim path the offending stream message is acked and dropped
    /// (poison-message quarantine); the incident is logged, not surfaced to
    /// the producer.
    #[error("invalid task data: {reason}")]
    InvalidTaskData {
        /// Decoder diagnostic.
        reason: String,
    },

    /// Lookup by task id missed.
    #[error("task '{id}' not found")]
    TaskNotFound {
        /// The missing task id.
        id: String,
    },

    /// The store rejected or could not serve the operation.
    ///
    /// Transient by nature; the caller decides whether to retry. Long
    /// outages are not hidden behind internal retries.
    #[error("store unavailable: {reason}")]
    StoreUnavailable {
        /// Transport/client diagnostic.
        reason: String,
    },

    /// Submission rejected: total queue depth reached the configured cap.
    #[error("queue at capacity: depth {depth} >= limit {limit}")]
    Backpressure {
        /// Sum of pending counts across priority streams.
        depth: u64,
        /// Configured `max_queue_size`.
        limit: u64,
    },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::InvalidTransition { .. } => "invalid_transition",
            BrokerError::InvalidTaskData { .. } => "invalid_task_data",
            BrokerError::TaskNotFound { .. } => "task_not_found",
            BrokerError::StoreUnavailable { .. } => "store_unavailable",
            BrokerError::Backpressure { .. } => "backpressure",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::InvalidTaskData {
            reason: e.to_string(),
        }
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::StoreUnavailable {
            reason: e.to_string(),
        }
    }
}

impl From<bb8_redis::bb8::RunError<redis::RedisError>> for BrokerError {
    fn from(e: bb8_redis::bb8::RunError<redis::RedisError>) -> Self {
        BrokerError::StoreUnavailable {
            reason: e.to_string(),
        }
    }
}

/// # Outcome of a single handler execution.
///
/// Produced by the [`Executor`](crate::worker::Executor) and fed into the
/// retry decision. Every variant is treated as a retryable failure; the
/// retry policy decides when a task moves to the dead-letter queue.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Execution exceeded the task's timeout.
    #[error("task execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Execution was canceled (pool shutdown or explicit cancellation).
    ///
    /// This is **not an error** in the traditional sense; the message stays
    /// in the pending list and will be reclaimed.
    #[error("task execution canceled")]
    Canceled,

    /// No handler registered for the task type.
    ///
    /// Retryable by default: the handler may be registered on another worker.
    #[error("handler not found for task type '{task_type}'")]
    HandlerNotFound { task_type: String },

    /// The handler panicked; the panic was captured and converted.
    #[error("handler panicked: {reason}")]
    Panicked { reason: String },

    /// The handler returned an error.
    #[error("{reason}")]
    Failed { reason: String },
}

impl ExecError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExecError::Timeout { .. } => "task_timeout",
            ExecError::Canceled => "task_canceled",
            ExecError::HandlerNotFound { .. } => "handler_not_found",
            ExecError::Panicked { .. } => "handler_panicked",
            ExecError::Failed { .. } => "task_failed",
        }
    }

    /// True when the outcome was a deadline hit.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }

    /// True when the outcome was cooperative cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExecError::Canceled)
    }

    /// Convenience constructor for handler failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecError::Failed {
            reason: reason.into(),
        }
    }
}
