//! # Subscriber contract.
//!
//! A [`Subscribe`] implementation observes the broker's lifecycle events:
//! it declares which [`EventKind`]s it cares about and receives each
//! matching event exactly once per bus delivery.
//!
//! ## Rules
//! - Subscribers observe, they never steer: returning from `on_event` is
//!   the only effect the broker sees
//! - Delivery is best-effort; a subscriber that falls behind the bus loses
//!   the oldest events, never the publisher's time
//! - An empty interest list means "everything"
//!
//! ## Example
//! ```rust
//! use taskbroker::{Event, EventKind, Subscribe};
//!
//! /// Counts quarantine-relevant outcomes for an alerting dashboard.
//! struct FailureAlerts;
//!
//! #[async_trait::async_trait]
//! impl Subscribe for FailureAlerts {
//!     fn name(&self) -> &'static str {
//!         "failure-alerts"
//!     }
//!
//!     fn kinds(&self) -> &[EventKind] {
//!         &[EventKind::TaskFailed, EventKind::TaskRetrying]
//!     }
//!
//!     async fn on_event(&self, event: &Event) {
//!         // push to the alerting backend...
//!         let _ = (&event.task, &event.error);
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};

/// An observer of broker lifecycle events.
///
/// Driven by a dedicated pump fiber owned by the
/// [`SubscriberSet`](crate::subscribers::SubscriberSet); implementations
/// may do I/O but should stay cooperative (async waits, no blocking).
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Stable name used in logs when this subscriber lags or panics.
    fn name(&self) -> &'static str;

    /// Event kinds this subscriber wants delivered.
    ///
    /// The default empty slice subscribes to every kind.
    fn kinds(&self) -> &[EventKind] {
        &[]
    }

    /// Handles one event.
    async fn on_event(&self, event: &Event);
}
