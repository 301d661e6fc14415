use crate::config::Config;
use crate::llm::providers::ProviderCatalog;
use crate::queue::{
    DispatcherSettings, JobExecutor, JobQueue, ProviderUsage, RateLimiter, WakeSignal, Worker,
};
use crate::store::{AtomicStore, KeySpace};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Shared handles for the HTTP layer and the embedded dispatcher.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub queue: Arc<JobQueue>,
    pub limiter: Arc<RateLimiter>,
    pub worker: Arc<Worker>,
    pub providers: Arc<ProviderCatalog>,
    pub wake: WakeSignal,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn AtomicStore>,
        providers: Arc<ProviderCatalog>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let keys = KeySpace::new(config.redis.key_prefix.clone());
        let queue = Arc::new(JobQueue::new(store.clone(), keys.clone(), config.queue.job_ttl()));
        let limiter = Arc::new(RateLimiter::new(store, keys, providers.clone()));
        let worker = Arc::new(
            Worker::new(queue.clone(), limiter.clone(), providers.clone(), executor)
                .with_max_jobs_per_run(config.queue.max_jobs_per_run),
        );

        Self {
            config,
            queue,
            limiter,
            worker,
            providers,
            wake: WakeSignal::new(),
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            sweep_interval: self.config.queue.sweep_interval(),
            cleanup_every: self.config.queue.cleanup_every_sweeps,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status_url: String,
    pub stream_url: String,
}

impl SubmitJobResponse {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id,
            status_url: format!("/api/jobs/{}", job_id),
            stream_url: format!("/api/jobs/{}/stream", job_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub store: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageResponse {
    pub providers: Vec<ProviderUsage>,
}
