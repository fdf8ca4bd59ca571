//! # Retry policy: exponential backoff with symmetric jitter.
//!
//! [`RetryPolicy`] decides whether a failed task gets another attempt and
//! how long to wait before it. It is parameterized by:
//! - [`RetryPolicy::max_attempts`] the total attempt budget;
//! - [`RetryPolicy::initial_backoff`] the first (and minimum) delay;
//! - [`RetryPolicy::max_backoff`] the delay cap;
//! - [`RetryPolicy::backoff_factor`] the multiplicative growth factor (`>= 1.0`);
//! - [`RetryPolicy::jitter_factor`] symmetric jitter amplitude in `[0, 1]`.
//!
//! Backoff is computed from the **just-failed** attempt number, not the
//! attempt about to run.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use taskbroker::RetryPolicy;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 3,
//!     initial_backoff: Duration::from_secs(1),
//!     max_backoff: Duration::from_secs(8),
//!     backoff_factor: 2.0,
//!     jitter_factor: 0.0,
//! };
//!
//! // 1s * 2^1 = 2s, 1s * 2^2 = 4s, then capped at 8s.
//! assert_eq!(policy.base_backoff(1), Duration::from_secs(2));
//! assert_eq!(policy.base_backoff(2), Duration::from_secs(4));
//! assert_eq!(policy.base_backoff(5), Duration::from_secs(8));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::task::Task;

/// Retry behavior for failed tasks.
///
/// ## Rules
/// - `backoff(n)` grows multiplicatively and is capped at `max_backoff`
/// - Jitter is applied symmetrically around the base delay
/// - The final delay never drops below `initial_backoff` (avoids near-zero
///   sleeps when jitter lands far negative)
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempt budget checked by [`should_retry`](Self::should_retry).
    pub max_attempts: u32,
    /// First delay; also the lower clamp for every delay.
    pub initial_backoff: Duration,
    /// Upper cap for the base delay.
    pub max_backoff: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub backoff_factor: f64,
    /// Jitter amplitude in `[0, 1]`: the delay is perturbed by
    /// `base * jitter_factor * U(-1, +1)`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    /// Returns a policy with:
    /// - `max_attempts = 3`;
    /// - `initial_backoff = 1s`;
    /// - `max_backoff = 5min`;
    /// - `backoff_factor = 2.0`;
    /// - `jitter_factor = 0.1`.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Computes the deterministic base delay for attempt `n`, ignoring jitter.
    ///
    /// `base(n) = min(initial_backoff * backoff_factor^n, max_backoff)`;
    /// `n = 0` returns `initial_backoff` unchanged.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_backoff;
        }

        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        if !base.is_finite() || base > self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(base)
    }

    /// Computes the jittered delay for attempt `n`.
    ///
    /// `delay = max(initial_backoff, base + base * jitter_factor * U(-1, +1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt).as_secs_f64();

        let jittered = if self.jitter_factor > 0.0 {
            let u: f64 = rand::rng().random_range(-1.0..=1.0);
            base + base * self.jitter_factor * u
        } else {
            base
        };

        let floor = self.initial_backoff.as_secs_f64();
        Duration::from_secs_f64(jittered.max(floor))
    }

    /// True while the task's attempt count is inside the budget.
    pub fn should_retry(&self, task: &Task) -> bool {
        task.attempts < self.max_attempts
    }

    /// Absolute time of the next attempt, from the just-failed attempt count.
    pub fn next_retry_at(&self, task: &Task) -> DateTime<Utc> {
        let delay = self.backoff(task.attempts);
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }
}
