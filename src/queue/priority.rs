//! Job Store & Priority Queue
//!
//! One sorted index per job type. The score puts the priority class in the
//! high digits and an inverted enqueue timestamp in the low digits, so popping
//! the maximum yields the highest priority and, within a class, the oldest job.

use super::jobs::{Job, JobData, JobStatus, JobType, StatusRecord, StatusUpdate};
use super::{QueueError, QueueResult};
use crate::store::{AtomicStore, HashMerge, JobWrite, KeySpace, MergeOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Width of the timestamp term. Millisecond timestamps stay below it until 2286.
pub const SCORE_SPAN: i64 = 10_000_000_000_000;

pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const STATUS_FIELD: &str = "status";

/// Index score for a job: priority dominates, earlier enqueue wins ties.
pub fn score(priority: i64, created_at: DateTime<Utc>) -> i64 {
    let millis = created_at.timestamp_millis().clamp(0, SCORE_SPAN - 1);
    priority * SCORE_SPAN + (SCORE_SPAN - 1 - millis)
}

/// Result of popping one index entry.
#[derive(Debug)]
pub enum Popped {
    Job(Job),
    /// Entry removed but its payload was gone
    Orphan(Uuid),
    Empty,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeStats {
    pub waiting: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queues: BTreeMap<String, TypeStats>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Legacy list entries with no priority index entry
    pub legacy_removed: u64,
    /// Priority index entries whose payload no longer exists
    pub dangling_removed: u64,
}

impl CleanupReport {
    pub fn removed(&self) -> u64 {
        self.legacy_removed + self.dangling_removed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    pub removed: BTreeMap<String, u64>,
    pub total: u64,
}

pub struct JobQueue {
    store: Arc<dyn AtomicStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn AtomicStore>, keys: KeySpace, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    // =========================================================================
    // Enqueue / dequeue
    // =========================================================================

    /// Accept a new job and return its id.
    pub async fn enqueue(
        &self,
        data: JobData,
        client_id: &str,
    ) -> QueueResult<Uuid> {
        let job = Job::new(data, client_id);
        self.enqueue_job(&job).await?;
        Ok(job.id)
    }

    /// Persist payload, index entries and the `queued` status as one transaction.
    pub async fn enqueue_job(&self, job: &Job) -> QueueResult<()> {
        let job_type = job.job_type();
        let member = job.id.to_string();

        let write = JobWrite {
            job_key: self.keys.job(&job.id),
            payload: serde_json::to_string(job)?,
            index_key: self.keys.priority_index(job_type.as_str()),
            legacy_key: self.keys.legacy_index(job_type.as_str()),
            member,
            score: score(job_type.priority(), job.created_at),
            status_key: self.keys.status(&job.id),
            status_fields: encode_fields(&StatusRecord::queued(job))?,
            ttl: self.ttl,
        };

        self.store.enqueue_job(&write).await?;
        info!("Enqueued {} job {} for client {}", job_type, job.id, job.client_id);
        Ok(())
    }

    /// Announce new work to dispatchers in other processes. Best effort.
    pub async fn announce(&self) {
        if let Err(e) = self.store.publish(&self.keys.wake_channel()).await {
            warn!("Failed to publish wake-up: {}", e);
        }
    }

    /// Pop the highest-priority job of a type. An orphaned entry yields `None`.
    pub async fn dequeue(&self, job_type: JobType) -> QueueResult<Option<Job>> {
        match self.pop_next(job_type).await? {
            Popped::Job(job) => Ok(Some(job)),
            Popped::Orphan(_) | Popped::Empty => Ok(None),
        }
    }

    /// Pop one index entry and resolve its payload.
    pub async fn pop_next(&self, job_type: JobType) -> QueueResult<Popped> {
        let index_key = self.keys.priority_index(job_type.as_str());
        let legacy_key = self.keys.legacy_index(job_type.as_str());
        let Some(member) = self.store.pop_max(&index_key, &legacy_key).await? else {
            return Ok(Popped::Empty);
        };

        let job_id = Uuid::parse_str(&member).map_err(|e| QueueError::CorruptRecord {
            key: index_key.clone(),
            reason: format!("member {} is not a job id: {}", member, e),
        })?;

        let Some(payload) = self.store.get(&self.keys.job(&job_id)).await? else {
            warn!("Orphan entry {} discarded from {} queue", job_id, job_type);
            return Ok(Popped::Orphan(job_id));
        };

        match serde_json::from_str::<Job>(&payload) {
            Ok(job) => {
                debug!("Dequeued {} job {}", job_type, job_id);
                Ok(Popped::Job(job))
            }
            Err(e) => {
                error!("Job {} payload could not be decoded: {}", job_id, e);
                self.update_status(job_id, &StatusUpdate::failed("job payload could not be decoded"))
                    .await?;
                Ok(Popped::Orphan(job_id))
            }
        }
    }

    /// 1-based position of a waiting job, `None` if it is not in the queue.
    pub async fn position(&self, job_type: JobType, job_id: Uuid) -> QueueResult<Option<u64>> {
        let rank = self
            .store
            .rank_desc(&self.keys.priority_index(job_type.as_str()), &job_id.to_string())
            .await?;
        Ok(rank.map(|rank| rank + 1))
    }

    // =========================================================================
    // Status records
    // =========================================================================

    /// Merge a partial update over the status record and refresh its TTL.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        update: &StatusUpdate,
    ) -> QueueResult<MergeOutcome> {
        let merge = HashMerge {
            key: self.keys.status(&job_id),
            fields: encode_fields(update)?,
            ttl: self.ttl,
            guard_field: STATUS_FIELD.to_string(),
            final_values: vec![
                serde_json::to_string(&JobStatus::Completed)?,
                serde_json::to_string(&JobStatus::Failed)?,
            ],
        };
        Ok(self.store.merge_hash(&merge).await?)
    }

    /// Current status record, with `position` filled while queued.
    pub async fn status(&self, job_id: Uuid) -> QueueResult<Option<StatusRecord>> {
        let key = self.keys.status(&job_id);
        let fields = self.store.read_hash(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut object = serde_json::Map::new();
        for (field, raw) in fields {
            let value = serde_json::from_str(&raw).map_err(|e| QueueError::CorruptRecord {
                key: key.clone(),
                reason: format!("field {}: {}", field, e),
            })?;
            object.insert(field, value);
        }

        let mut record: StatusRecord = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| QueueError::CorruptRecord {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        if record.status == JobStatus::Queued {
            record.position = self.position(record.job_type, job_id).await?;
        }
        Ok(Some(record))
    }

    // =========================================================================
    // Stats and cleanup
    // =========================================================================

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for job_type in JobType::ALL {
            let waiting = self
                .store
                .index_len(&self.keys.priority_index(job_type.as_str()))
                .await?;
            stats.total += waiting;
            stats
                .queues
                .insert(job_type.as_str().to_string(), TypeStats { waiting });
        }
        Ok(stats)
    }

    /// Reconcile the legacy list with the priority index and drop index
    /// entries whose payload has vanished.
    pub async fn cleanup_orphans(&self, job_type: JobType) -> QueueResult<CleanupReport> {
        let index_key = self.keys.priority_index(job_type.as_str());

        let mut dangling = Vec::new();
        for member in self.store.index_members(&index_key).await? {
            let Ok(job_id) = Uuid::parse_str(&member) else {
                dangling.push(member);
                continue;
            };
            if !self.store.exists(&self.keys.job(&job_id)).await? {
                dangling.push(member);
            }
        }
        let dangling_removed = self.store.remove_from_index(&index_key, &dangling).await?;

        let legacy_removed = self
            .store
            .reconcile_legacy(&self.keys.legacy_index(job_type.as_str()), &index_key)
            .await?;

        let report = CleanupReport {
            legacy_removed,
            dangling_removed,
        };
        if report.removed() > 0 {
            info!(
                "Cleanup for {} queue removed {} legacy and {} dangling entries",
                job_type, legacy_removed, dangling_removed
            );
        }
        Ok(report)
    }

    /// Run cleanup for every job type.
    pub async fn cleanup_all(&self) -> QueueResult<CleanupSummary> {
        let mut summary = CleanupSummary::default();
        for job_type in JobType::ALL {
            let removed = self.cleanup_orphans(job_type).await?.removed();
            summary.total += removed;
            summary.removed.insert(job_type.as_str().to_string(), removed);
        }
        Ok(summary)
    }
}

/// Flatten a serializable struct into hash fields with JSON encoded values.
fn encode_fields<T: Serialize>(value: &T) -> QueueResult<Vec<(String, String)>> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(object) => Ok(object
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k, v.to_string()))
            .collect()),
        other => Err(QueueError::CorruptRecord {
            key: "status".to_string(),
            reason: format!("expected an object, got {}", other),
        }),
    }
}
