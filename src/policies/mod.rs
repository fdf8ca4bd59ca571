//! Policies governing retry behavior:
//!  - [`RetryPolicy`] for attempt budgets and backoff delays.
//!
//! ## Overview
//! - [`retry`] — decide retry vs. quarantine and compute the next delay
//!   with capped multiplicative growth and symmetric jitter.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use taskbroker::RetryPolicy;
//!
//! // Backoff: 2s -> 4s -> 8s (capped by 8s), no jitter.
//! let policy = RetryPolicy {
//!     max_attempts: 4,
//!     initial_backoff: Duration::from_secs(1),
//!     max_backoff: Duration::from_secs(8),
//!     backoff_factor: 2.0,
//!     jitter_factor: 0.0,
//! };
//!
//! let delays: Vec<Duration> = (1..=3).map(|n| policy.backoff(n)).collect();
//! assert_eq!(delays, vec![
//!     Duration::from_secs(2),
//!     Duration::from_secs(4),
//!     Duration::from_secs(8),
//! ]);
//! ```

mod retry;

pub use retry::RetryPolicy;
