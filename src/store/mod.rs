//! # The durable log store seam.
//!
//! The broker is written against [`Store`] — an async port exposing exactly
//! the primitives the data model relies on: append-only streams with
//! consumer groups and a pending-entry list (PEL), plain keys with TTL, an
//! ordered set for the delayed index, membership sets, and a short-lived
//! exclusive lease.
//!
//! ## Implementations
//! - [`RedisStore`] — pooled Redis client; the production backend
//! - [`MemoryStore`] — in-process implementation for tests and local runs
//!
//! ## Rules
//! - `read_group` delivers a **new** message to exactly one consumer of the
//!   group; delivered-but-unacked messages stay in the PEL with owner and
//!   idle time
//! - `claim` transfers PEL ownership only when the entry's idle time meets
//!   the minimum; a transfer racing a just-finished consumer is rejected
//! - `acquire_lease` is compare-and-set with TTL: at most one holder
//! - All errors surface as [`BrokerError::StoreUnavailable`]; the store
//!   never retries internally

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

/// One entry read or claimed from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream the entry came from.
    pub stream: String,
    /// Opaque monotone entry id; required later to ack or delete.
    pub id: String,
    /// Field/value pairs carried by the entry.
    pub fields: Vec<(String, String)>,
}

impl StreamMessage {
    /// Returns the value of a named field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One delivered-but-unacked entry in a consumer group's PEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Stream entry id.
    pub id: String,
    /// Consumer currently owning the delivery.
    pub consumer: String,
    /// Time since the last delivery to its owner.
    pub idle: Duration,
    /// Number of deliveries so far (1 = never redelivered).
    pub delivery_count: u64,
}

/// Async port over the shared durable log store.
///
/// The broker holds it as `Arc<dyn Store>`; all queue, scheduler, DLQ, and
/// registry code is backend-agnostic.
#[async_trait]
pub trait Store: Send + Sync {
    // --- streams & consumer groups ---

    /// Creates `stream` and `group` if missing (idempotent), with the
    /// group's cursor at the beginning of the stream.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Appends an entry and returns its id.
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, BrokerError>;

    /// Reads up to `count` **new** messages for `consumer` within `group`,
    /// scanning `streams` in the given order.
    ///
    /// With `block` set, waits up to that long for a message on any stream;
    /// returns an empty vec on timeout. Which stream wins when several have
    /// backlog is backend-chosen.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Acknowledges a delivered entry, removing it from the group's PEL.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Enumerates up to `count` PEL entries of `group`, oldest first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Transfers ownership of a PEL entry to `consumer` if its idle time is
    /// at least `min_idle`. Returns the entry's message on success; empty
    /// when the guard rejects the transfer or the entry vanished.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Reads entries with ids in `[start, end]` (inclusive; `-`/`+` are the
    /// open bounds), up to `count` when nonzero.
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Deletes individual entries by id.
    async fn delete_entries(&self, stream: &str, ids: &[String]) -> Result<(), BrokerError>;

    /// Deletes the whole stream key.
    async fn delete_stream(&self, stream: &str) -> Result<(), BrokerError>;

    /// Returns the group's pending (delivered-but-unacked) count.
    async fn group_pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError>;

    // --- plain keys ---

    /// Writes a value, optionally with a TTL.
    async fn kv_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Reads a value; `None` when absent or expired.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Deletes a key (idempotent).
    async fn kv_delete(&self, key: &str) -> Result<(), BrokerError>;

    /// Existence check honoring TTL.
    async fn kv_exists(&self, key: &str) -> Result<bool, BrokerError>;

    // --- exclusive lease ---

    /// Compare-and-set acquisition of `key` with `ttl`. Returns true when
    /// this caller became the holder.
    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError>;

    /// Releases a lease early (best-effort; expiry also releases it).
    async fn release_lease(&self, key: &str) -> Result<(), BrokerError>;

    // --- ordered set (delayed index) ---

    /// Adds or updates `member` with `score`.
    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<(), BrokerError>;

    /// Removes `member` (idempotent).
    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Returns members with `score <= max_score`, lowest first.
    async fn zset_range_up_to(&self, key: &str, max_score: i64)
        -> Result<Vec<String>, BrokerError>;

    /// Cardinality of the ordered set.
    async fn zset_len(&self, key: &str) -> Result<u64, BrokerError>;

    // --- membership sets ---

    /// Adds `member` (idempotent).
    async fn set_add(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Removes `member` (idempotent).
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Lists all members.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError>;

    /// Cardinality of the set.
    async fn set_len(&self, key: &str) -> Result<u64, BrokerError>;

    /// Membership check.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BrokerError>;

    /// Drops the whole set key.
    async fn set_clear(&self, key: &str) -> Result<(), BrokerError>;
}
