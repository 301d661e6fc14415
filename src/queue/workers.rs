// Worker: pulls jobs in priority order, admits them against provider quotas
// and runs them through the executor. Failures are terminal, nothing is requeued.

use super::jobs::{Job, JobType, StatusUpdate};
use super::priority::{JobQueue, Popped};
use super::rate_limiter::RateLimiter;
use super::QueueResult;
use crate::llm::providers::{ProviderCatalog, ProviderId, ProviderProfile};
use crate::store::MergeOutcome;
use crate::types::AppResult;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const MAX_JOBS_PER_RUN: usize = 5;

/// Runs the external call for a job on the provider chosen by the worker.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, provider: &ProviderProfile) -> AppResult<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { provider: ProviderId },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dequeued: usize,
    pub completed: usize,
    pub failed: usize,
    pub orphans: usize,
}

pub struct Worker {
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    providers: Arc<ProviderCatalog>,
    executor: Arc<dyn JobExecutor>,
    max_jobs_per_run: usize,
    worker_id: String,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        providers: Arc<ProviderCatalog>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            queue,
            limiter,
            providers,
            executor,
            max_jobs_per_run: MAX_JOBS_PER_RUN,
            worker_id: default_worker_id(),
        }
    }

    pub fn with_max_jobs_per_run(mut self, max_jobs_per_run: usize) -> Self {
        self.max_jobs_per_run = max_jobs_per_run;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One bounded batch: up to `max_jobs_per_run` pops per job type.
    pub async fn run_once(&self) -> QueueResult<RunSummary> {
        let mut summary = RunSummary::default();

        for job_type in JobType::ALL {
            for _ in 0..self.max_jobs_per_run {
                let job = match self.queue.pop_next(job_type).await? {
                    Popped::Job(job) => job,
                    Popped::Orphan(_) => {
                        summary.orphans += 1;
                        continue;
                    }
                    Popped::Empty => break,
                };

                summary.dequeued += 1;
                match self.process_job(&job).await {
                    JobOutcome::Completed { .. } => summary.completed += 1,
                    JobOutcome::Failed { .. } => summary.failed += 1,
                }
            }
        }

        if summary.dequeued > 0 || summary.orphans > 0 {
            info!(
                "Worker {} run: {} dequeued, {} completed, {} failed, {} orphans",
                self.worker_id, summary.dequeued, summary.completed, summary.failed, summary.orphans
            );
        }
        Ok(summary)
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type(), worker_id = %self.worker_id)
    )]
    pub async fn process_job(&self, job: &Job) -> JobOutcome {
        self.record(job.id, StatusUpdate::processing(Utc::now())).await;

        let candidates = self.providers.candidates(job.job_type());
        if candidates.is_empty() {
            return self
                .fail(job.id, format!("no provider configured for {} jobs", job.job_type()))
                .await;
        }

        let estimated_tokens = job.data.estimated_tokens();
        let mut rejections = Vec::new();

        for provider in candidates {
            let decision = self.limiter.can_process(provider.id, estimated_tokens).await;
            if !decision.allowed {
                rejections.push(
                    decision
                        .reason
                        .unwrap_or_else(|| format!("{} rejected", provider.id)),
                );
                continue;
            }

            info!("Running job on {} ({})", provider.id, provider.model);
            return match self.executor.execute(job, provider).await {
                Ok(result) => {
                    self.record(job.id, StatusUpdate::completed(result, provider.id.as_str()))
                        .await;
                    JobOutcome::Completed {
                        provider: provider.id,
                    }
                }
                Err(e) => self.fail(job.id, e.to_string()).await,
            };
        }

        self.fail(
            job.id,
            format!("all providers saturated: {}", rejections.join("; ")),
        )
        .await
    }

    async fn fail(&self, job_id: Uuid, error: String) -> JobOutcome {
        warn!("Job {} failed: {}", job_id, error);
        self.record(job_id, StatusUpdate::failed(error.clone())).await;
        JobOutcome::Failed { error }
    }

    /// Status writes that fail are logged and dropped; the stored record stays authoritative.
    async fn record(&self, job_id: Uuid, update: StatusUpdate) {
        match self.queue.update_status(job_id, &update).await {
            Ok(MergeOutcome::Applied) => {}
            Ok(MergeOutcome::Missing) => {
                warn!("Status update for {} dropped: record expired or missing", job_id)
            }
            Ok(MergeOutcome::Final) => {
                warn!("Status update for {} dropped: job already finished", job_id)
            }
            Err(e) => error!("Status update for {} failed: {}", job_id, e),
        }
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}
