//! Broker events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to the logical events emitted at task and worker
//! transitions.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `TaskQueue` (submitted), `WorkerPool` (started,
//!   completed, failed, retrying, joined, left, paused, resumed, depth
//!   snapshots), `Scheduler` (submitted on promotion).
//! - **Consumers**: the per-subscriber pumps owned by
//!   [`SubscriberSet`](crate::subscribers::SubscriberSet).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
