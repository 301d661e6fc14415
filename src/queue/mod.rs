//! Job queue
//!
//! - `jobs` - job payloads and status records
//! - `priority` - priority queue, status merges, stats and cleanup
//! - `rate_limiter` - per-provider RPM/TPM admission control
//! - `workers` - dispatcher that runs jobs through the executor
//! - `scheduler` - wake signal and periodic sweep driving the dispatcher

pub mod jobs;
pub mod priority;
pub mod rate_limiter;
pub mod scheduler;
pub mod workers;

use crate::store::StoreError;

pub use jobs::{Job, JobData, JobStatus, JobType, StatusRecord, StatusUpdate};
pub use priority::{CleanupReport, CleanupSummary, JobQueue, Popped, QueueStats};
pub use rate_limiter::{AdmissionDecision, ProviderUsage, RateLimiter};
pub use scheduler::{run_dispatcher, DispatcherSettings, WakeSignal};
pub use workers::{JobExecutor, JobOutcome, RunSummary, Worker};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Store command failed: {0}")]
    Store(String),

    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => QueueError::BackendUnavailable(reason),
            StoreError::Command(reason) => QueueError::Store(reason),
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
