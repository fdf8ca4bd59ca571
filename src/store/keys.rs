//! Persisted key layout.
//!
//! Every key the broker writes lives here so the on-store footprint can be
//! audited in one place:
//!
//! ```text
//! {prefix}:critical|high|normal|low   priority streams
//! task:{id}                           serialized Task record
//! tasks:scheduled                     delayed index (zset, score = due epoch secs)
//! tasks:dlq                           dead-letter stream
//! tasks:dlq:set                       dead-letter membership set
//! workers:active                      live worker id set
//! worker:{id}:heartbeat               liveness key with TTL
//! worker:{id}:info                    serialized worker record with TTL
//! worker:{id}:paused                  presence = paused
//! scheduler:lock                      promotion lease with short TTL
//! ```

/// Delayed index of scheduled tasks.
pub const SCHEDULED_SET: &str = "tasks:scheduled";

/// Dead-letter stream.
pub const DLQ_STREAM: &str = "tasks:dlq";

/// Dead-letter membership set.
pub const DLQ_SET: &str = "tasks:dlq:set";

/// Set of presumed-live worker ids.
pub const WORKERS_ACTIVE: &str = "workers:active";

/// Scheduler promotion lease.
pub const SCHEDULER_LOCK: &str = "scheduler:lock";

/// Storage key of a task record.
pub fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Liveness key of a worker; expiry past TTL implies death.
pub fn worker_heartbeat_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:heartbeat")
}

/// Serialized worker record key.
pub fn worker_info_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:info")
}

/// Remote pause flag of a worker; presence = paused.
pub fn worker_paused_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:paused")
}
