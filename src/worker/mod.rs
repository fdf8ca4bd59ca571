//! Worker-side machinery: execution, liveness, and the pool.
//!
//! ## Contents
//! - [`Handler`], [`HandlerFn`], [`Executor`] — type-keyed handler registry
//!   with deadline, cancellation, and panic capture
//! - [`Heartbeat`], [`WorkerInfo`], [`WorkerRegistry`] — TTL liveness keys
//!   and the live-worker enumeration used by admin surfaces
//! - [`WorkerPool`], [`PoolState`] — fetch → execute → settle fibers,
//!   orphan recovery, pause/resume, graceful shutdown

mod executor;
mod heartbeat;
mod pool;

pub use executor::{Executor, Handler, HandlerFn};
pub use heartbeat::{Heartbeat, WorkerInfo, WorkerRegistry};
pub use pool::{PoolState, WorkerPool};
