//! # Task lifecycle states and the transition machine.
//!
//! [`TaskState`] enumerates the eight lifecycle states; [`StateMachine`]
//! is the only place allowed to move a task between them.
//!
//! ## Transition table
//! ```text
//! pending     ──► scheduled | running | cancelled
//! scheduled   ──► pending | running | cancelled
//! running     ──► completed | failed | retrying | cancelled
//! retrying    ──► running | failed | dead_letter | cancelled
//! failed      ──► retrying | dead_letter | pending
//! dead_letter ──► pending                  (manual requeue)
//! completed   ──► ∅                        (terminal)
//! cancelled   ──► ∅                        (terminal)
//! ```
//!
//! ## Rules
//! - Every successful transition stamps `updated_at`
//! - `running` stamps `started_at`; the four settled states stamp `completed_at`
//! - Moves outside the table fail with [`BrokerError::InvalidTransition`]
//! - Operations mutate the in-memory record only; the caller persists

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::task::task::{Payload, Task};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in a priority stream for a worker.
    Pending,
    /// Parked in the delayed index until its due time.
    Scheduled,
    /// Claimed and executing on a worker.
    Running,
    /// Finished successfully; `result` is set.
    Completed,
    /// Last attempt failed; `error` is set.
    Failed,
    /// Failed with retry budget left; about to be re-queued.
    Retrying,
    /// Withdrawn before completion.
    Cancelled,
    /// Quarantined after exhausting its retry budget.
    DeadLetter,
}

impl TaskState {
    /// Returns the stable snake_case name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Cancelled => "cancelled",
            TaskState::DeadLetter => "dead_letter",
        }
    }

    /// True for states that settle the record (`completed_at` is stamped).
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::DeadLetter
        )
    }

    /// True while a worker owns the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Retrying)
    }

    /// Allowed targets from this state.
    pub fn valid_targets(&self) -> &'static [TaskState] {
        match self {
            TaskState::Pending => &[
                TaskState::Scheduled,
                TaskState::Running,
                TaskState::Cancelled,
            ],
            TaskState::Scheduled => &[
                TaskState::Pending,
                TaskState::Running,
                TaskState::Cancelled,
            ],
            TaskState::Running => &[
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Retrying,
                TaskState::Cancelled,
            ],
            TaskState::Retrying => &[
                TaskState::Running,
                TaskState::Failed,
                TaskState::DeadLetter,
                TaskState::Cancelled,
            ],
            TaskState::Failed => &[
                TaskState::Retrying,
                TaskState::DeadLetter,
                TaskState::Pending,
            ],
            TaskState::DeadLetter => &[TaskState::Pending],
            TaskState::Completed | TaskState::Cancelled => &[],
        }
    }

    /// Total over every `(from, to)` pair: true only for table entries.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        self.valid_targets().contains(&target)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = std::convert::Infallible;

    /// Parses a state name; unknown names normalize to `Pending`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "scheduled" => TaskState::Scheduled,
            "running" => TaskState::Running,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "retrying" => TaskState::Retrying,
            "cancelled" => TaskState::Cancelled,
            "dead_letter" => TaskState::DeadLetter,
            _ => TaskState::Pending,
        })
    }
}

/// Validated mutator over one task record.
///
/// Borrows the record for the duration of the operation; the caller owns
/// persistence. Only the worker holding the current claim should drive
/// `start`/`complete`/`fail`/`retry` during its claim window.
pub struct StateMachine<'a> {
    task: &'a mut Task,
}

impl<'a> StateMachine<'a> {
    /// Wraps a task record.
    pub fn new(task: &'a mut Task) -> Self {
        Self { task }
    }

    /// Moves the task to `target`, stamping timestamps per the table rules.
    pub fn transition(&mut self, target: TaskState) -> Result<(), BrokerError> {
        if !self.task.state.can_transition_to(target) {
            return Err(BrokerError::InvalidTransition {
                from: self.task.state,
                to: target,
            });
        }

        let now = Utc::now();
        self.task.state = target;
        self.task.updated_at = now;

        match target {
            TaskState::Running => self.task.started_at = Some(now),
            t if t.is_final() => self.task.completed_at = Some(now),
            _ => {}
        }

        Ok(())
    }

    /// `pending|scheduled|retrying → running`; records the claimant and
    /// increments the attempt counter.
    pub fn start(&mut self, worker_id: &str) -> Result<(), BrokerError> {
        self.transition(TaskState::Running)?;
        self.task.worker_id = Some(worker_id.to_string());
        self.task.attempts += 1;
        Ok(())
    }

    /// `running → completed`; stores the result and clears the error.
    pub fn complete(&mut self, result: Payload) -> Result<(), BrokerError> {
        self.transition(TaskState::Completed)?;
        self.task.result = Some(result);
        self.task.error = None;
        Ok(())
    }

    /// `running → failed`; records the error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), BrokerError> {
        self.transition(TaskState::Failed)?;
        self.task.error = Some(error.into());
        Ok(())
    }

    /// Moves to `retrying` while budget remains, `dead_letter` otherwise.
    pub fn retry(&mut self) -> Result<(), BrokerError> {
        if self.task.can_retry() {
            self.transition(TaskState::Retrying)
        } else {
            self.transition(TaskState::DeadLetter)
        }
    }

    /// `pending|scheduled|running|retrying → cancelled`.
    pub fn cancel(&mut self) -> Result<(), BrokerError> {
        self.transition(TaskState::Cancelled)
    }

    /// `failed|retrying → dead_letter`.
    pub fn move_to_dlq(&mut self) -> Result<(), BrokerError> {
        self.transition(TaskState::DeadLetter)
    }

    /// Resets the record for a fresh lifecycle and moves it to `pending`.
    ///
    /// Clears claimant, attempt counter, error, and both execution
    /// timestamps. Used for manual requeue from `failed`/`dead_letter`.
    pub fn requeue(&mut self) -> Result<(), BrokerError> {
        self.task.worker_id = None;
        self.task.attempts = 0;
        self.task.error = None;
        self.task.started_at = None;
        self.task.completed_at = None;
        self.transition(TaskState::Pending)
    }
}
