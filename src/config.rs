//! # Broker configuration.
//!
//! Plain structs with documented defaults, grouped the way the persisted
//! state is: [`StoreConfig`] for the shared log store connection,
//! [`QueueConfig`] for stream/delivery behavior, [`WorkerConfig`] for one
//! worker pool process.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use taskbroker::Config;
//!
//! let mut cfg = Config::default();
//! cfg.worker.concurrency = 4;
//! cfg.queue.block_timeout = Duration::from_secs(2);
//! cfg.store.addr = "redis.internal:6379".to_string();
//!
//! assert_eq!(cfg.worker.concurrency, 4);
//! ```

use std::time::Duration;

use crate::policies::RetryPolicy;

/// Connection settings for the shared log store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// `host:port` of the store.
    pub addr: String,
    /// Optional password.
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    /// Connection pool capacity.
    pub pool_size: u32,
    /// Idle connections kept warm.
    pub min_idle_conns: u32,
    /// Client-side retries for pool checkout.
    pub max_retries: u32,
    /// Connect timeout.
    pub dial_timeout: Duration,
    /// Read timeout hint.
    pub read_timeout: Duration,
    /// Write timeout hint.
    pub write_timeout: Duration,
}

impl Default for StoreConfig {
    /// Local store, pool of 100 with 10 warm connections, 5s dial timeout.
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
            pool_size: 100,
            min_idle_conns: 10,
            max_retries: 3,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
        }
    }
}

impl StoreConfig {
    /// Builds the connection URL for the client.
    pub fn url(&self) -> String {
        match &self.password {
            Some(p) => format!("redis://:{p}@{}/{}", self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

/// Stream layout and delivery behavior.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Prefix of the four priority streams (`{prefix}:critical` ...).
    pub stream_prefix: String,
    /// Consumer group shared by all workers.
    pub consumer_group: String,
    /// Submission cap across all priority streams (0 = unlimited).
    pub max_queue_size: u64,
    /// How long one claim call blocks waiting for a message.
    pub block_timeout: Duration,
    /// Minimum idle time before a pending entry may be reclaimed.
    pub claim_min_idle: Duration,
    /// Cadence of the orphan-reclaim loop.
    pub recovery_interval: Duration,
    /// Retry policy applied to failed executions.
    pub retry: RetryPolicy,
    /// Days to retain settled task records (0 = keep forever).
    pub task_retention_days: u32,
}

impl Default for QueueConfig {
    /// `tasks:*` streams, `workers` group, 5s block, 30s reclaim idle,
    /// 10s recovery cadence, default retry policy, 7-day retention.
    fn default() -> Self {
        Self {
            stream_prefix: "tasks".to_string(),
            consumer_group: "workers".to_string(),
            max_queue_size: 1_000_000,
            block_timeout: Duration::from_secs(5),
            claim_min_idle: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            task_retention_days: 7,
        }
    }
}

impl QueueConfig {
    /// Retention TTL for settled records; `None` when retention is off.
    pub fn retention_ttl(&self) -> Option<Duration> {
        if self.task_retention_days == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.task_retention_days) * 24 * 3600))
        }
    }
}

/// Settings of one worker pool process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Stable worker id; `None` generates a fresh opaque id at startup.
    pub id: Option<String>,
    /// Parallel worker fibers (concurrency gate capacity).
    pub concurrency: usize,
    /// Heartbeat refresh cadence.
    pub heartbeat_interval: Duration,
    /// Liveness TTL; should be at least 3x the interval.
    pub heartbeat_timeout: Duration,
    /// Grace period for in-flight executions on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    /// 10 fibers, 5s heartbeat with 15s TTL, 30s shutdown grace.
    fn default() -> Self {
        Self {
            id: None,
            concurrency: 10,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration bundle.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Log store connection.
    pub store: StoreConfig,
    /// Queue layout and delivery.
    pub queue: QueueConfig,
    /// Worker pool process.
    pub worker: WorkerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_credentials_when_present() {
        let mut cfg = StoreConfig::default();
        assert_eq!(cfg.url(), "redis://localhost:6379/0");
        cfg.password = Some("hunter2".to_string());
        cfg.db = 2;
        assert_eq!(cfg.url(), "redis://:hunter2@localhost:6379/2");
    }

    #[test]
    fn retention_ttl_converts_days() {
        let mut cfg = QueueConfig::default();
        assert_eq!(
            cfg.retention_ttl(),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        cfg.task_retention_days = 0;
        assert_eq!(cfg.retention_ttl(), None);
    }

    #[test]
    fn heartbeat_timeout_covers_three_intervals() {
        let cfg = WorkerConfig::default();
        assert!(cfg.heartbeat_timeout >= 3 * cfg.heartbeat_interval);
    }
}
