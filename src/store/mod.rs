//! Shared Atomic Store
//!
//! Every piece of queue and rate-limit state lives in the store. Callers never
//! read a structure and write it back in a second round trip: each operation
//! on [`AtomicStore`] is a single transaction evaluated by the store itself.
//!
//! - [`RedisStore`] runs the transactions as server-side Lua scripts.
//! - [`MemoryStore`] runs them under one mutex. Used for tests and local development.

pub mod keys;
pub mod memory;
pub mod redis;

#[cfg(test)]
mod conformance;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store command failed: {0}")]
    Command(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Everything written when a job is accepted. Applied as one unit.
#[derive(Debug, Clone)]
pub struct JobWrite {
    pub job_key: String,
    pub payload: String,
    pub index_key: String,
    pub legacy_key: String,
    pub member: String,
    pub score: i64,
    pub status_key: String,
    /// Status hash fields, values already JSON encoded
    pub status_fields: Vec<(String, String)>,
    pub ttl: Duration,
}

/// Shallow merge of fields into a hash record.
#[derive(Debug, Clone)]
pub struct HashMerge {
    pub key: String,
    pub fields: Vec<(String, String)>,
    pub ttl: Duration,
    /// Field inspected before writing
    pub guard_field: String,
    /// If `guard_field` holds one of these values the merge is refused
    pub final_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Record does not exist (never created or expired)
    Missing,
    /// Record already reached a final value of the guard field
    Final,
}

/// Check-and-reserve request against one provider's counters.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub window_key: String,
    pub tokens_key: String,
    pub now_ms: i64,
    pub window_ms: i64,
    pub rpm_limit: u64,
    pub tpm_limit: u64,
    pub tokens: u64,
    pub request_id: String,
    pub safety_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Admitted { requests: u64, tokens: u64 },
    RequestLimit { requests: u64 },
    TokenLimit { tokens: u64 },
}

#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Persist payload, index entries and initial status in one transaction.
    async fn enqueue_job(&self, write: &JobWrite) -> StoreResult<()>;

    /// Atomically remove and return the highest-scored member of a sorted index,
    /// dropping the same member from the legacy list.
    async fn pop_max(&self, index_key: &str, legacy_key: &str) -> StoreResult<Option<String>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Zero-based rank of `member` in descending score order.
    async fn rank_desc(&self, index_key: &str, member: &str) -> StoreResult<Option<u64>>;

    async fn index_len(&self, index_key: &str) -> StoreResult<u64>;

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>>;

    async fn remove_from_index(&self, index_key: &str, members: &[String]) -> StoreResult<u64>;

    /// Drop every id in the legacy list that has no entry in the sorted index.
    /// Runs in one pass over the list.
    async fn reconcile_legacy(&self, legacy_key: &str, index_key: &str) -> StoreResult<u64>;

    async fn merge_hash(&self, merge: &HashMerge) -> StoreResult<MergeOutcome>;

    async fn read_hash(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Prune the request window, check both limits and reserve capacity.
    async fn reserve(&self, reservation: &Reservation) -> StoreResult<ReservationOutcome>;

    /// Prune the request window and return `(requests, tokens)` currently counted.
    async fn usage(
        &self,
        window_key: &str,
        tokens_key: &str,
        window_start_ms: i64,
    ) -> StoreResult<(u64, u64)>;

    /// Tell every dispatcher listening on `channel` that work is waiting.
    async fn publish(&self, channel: &str) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}
