//! # taskbroker
//!
//! **Taskbroker** is a horizontally scalable task broker over a shared
//! durable log store.
//!
//! Producers submit typed work units; a fleet of worker processes consume
//! them through consumer groups, execute registered handlers, and report
//! results. Delivery is at-least-once, dispatch is priority-ordered across
//! four levels, failures retry with exponential backoff, and repeatedly
//! failing tasks are quarantined in a dead-letter queue. Tasks orphaned by
//! crashed workers are reclaimed automatically.
//!
//! ## Features
//!
//! | Area           | Description                                                      | Key types / traits                        |
//! |----------------|------------------------------------------------------------------|-------------------------------------------|
//! | **Queue**      | Durable submit/claim/ack over priority streams.                  | [`TaskQueue`]                             |
//! | **Scheduling** | Delayed tasks promoted from a time-ordered index.                | [`Scheduler`]                             |
//! | **Retries**    | Exponential backoff with jitter, DLQ on exhaustion.              | [`RetryPolicy`], [`DeadLetterQueue`]      |
//! | **Workers**    | Bounded-concurrency pools with heartbeats and orphan recovery.   | [`WorkerPool`], [`Handler`], [`Executor`] |
//! | **Liveness**   | TTL heartbeats, live-worker registry, remote pause.              | [`WorkerRegistry`], [`WorkerInfo`]        |
//! | **Events**     | Best-effort lifecycle events with non-blocking fan-out.          | [`Event`], [`Bus`], [`Subscribe`]         |
//! | **Storage**    | Store port with Redis and in-memory backends.                    | [`Store`], [`RedisStore`], [`MemoryStore`]|
//! | **Errors**     | Typed broker faults and execution outcomes.                      | [`BrokerError`], [`ExecError`]            |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use taskbroker::{
//!     Bus, Config, DeadLetterQueue, ExecError, Executor, Handler, Payload, Priority,
//!     RedisStore, Store, Task, TaskQueue, WorkerPool,
//! };
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, task: &Task, _ctx: CancellationToken) -> Result<Payload, ExecError> {
//!         let mut out = Payload::new();
//!         out.insert("echoed".into(), serde_json::Value::Object(task.payload.clone()));
//!         Ok(out)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::default();
//!     let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&cfg.store).await?);
//!     let bus = Bus::new(1024);
//!
//!     let queue = Arc::new(TaskQueue::new(store.clone(), &cfg.queue, bus.clone()).await?);
//!     let dlq = Arc::new(DeadLetterQueue::new(store.clone()));
//!
//!     let mut executor = Executor::new();
//!     executor.register("echo", Arc::new(Echo));
//!
//!     let pool = Arc::new(WorkerPool::new(
//!         &cfg, store, queue.clone(), dlq, Arc::new(executor), bus,
//!     ));
//!     pool.start().await;
//!
//!     let mut payload = Payload::new();
//!     payload.insert("m".into(), serde_json::Value::String("hi".into()));
//!     queue.submit(&Task::new("echo", payload, Priority::High)).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     pool.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ---

pub mod config;
pub mod error;
pub mod events;
pub mod policies;
pub mod queue;
pub mod store;
pub mod subscribers;
pub mod task;
pub mod worker;

// ---- Public re-exports ----

pub use config::{Config, QueueConfig, StoreConfig, WorkerConfig};
pub use error::{BrokerError, ExecError};
pub use events::{Bus, Event, EventKind};
pub use policies::RetryPolicy;
pub use queue::{DeadLetterQueue, DlqEntry, Scheduler, TaskQueue};
pub use store::{MemoryStore, PendingEntry, RedisStore, Store, StreamMessage};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use task::{Payload, Priority, StateMachine, Task, TaskState};
pub use worker::{Executor, Handler, HandlerFn, PoolState, WorkerInfo, WorkerPool, WorkerRegistry};
