//! # Event subscribers.
//!
//! This module provides the [`Subscribe`] contract and the pump machinery
//! that delivers broker events to observers.
//!
//! ## Architecture
//! ```text
//! queue/pool/scheduler ── publish(Event) ──► Bus (broadcast)
//!                                             │
//!                             SubscriberSet::attach(&bus, observers)
//!                                             │
//!                          one receiver + pump fiber per observer
//!                                             │
//!                               kinds() filter ──► on_event()
//! ```
//!
//! Subscribers observe, they never steer: a lagging or panicking observer
//! loses its own events and nothing else.

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
