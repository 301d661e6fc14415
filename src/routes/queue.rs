use crate::middleware::require_admin;
use crate::models::{AppState, UsageResponse};
use crate::queue::{CleanupSummary, QueueStats, RunSummary};
use crate::types::AppResult;
use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/queue/process", post(process_queue))
        .route("/api/admin/cleanup", post(cleanup_queues))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/usage", get(provider_usage))
        .merge(admin)
        .with_state(state)
}

async fn queue_stats(State(state): State<AppState>) -> AppResult<Json<QueueStats>> {
    Ok(Json(state.queue.stats().await?))
}

async fn provider_usage(State(state): State<AppState>) -> AppResult<Json<UsageResponse>> {
    let providers = state.limiter.usage_all().await?;
    Ok(Json(UsageResponse { providers }))
}

/// Run one bounded worker batch in the request.
async fn process_queue(State(state): State<AppState>) -> AppResult<Json<RunSummary>> {
    let summary = state.worker.run_once().await?;
    info!(
        "Manual queue run: {} dequeued, {} completed, {} failed",
        summary.dequeued, summary.completed, summary.failed
    );
    Ok(Json(summary))
}

async fn cleanup_queues(State(state): State<AppState>) -> AppResult<Json<CleanupSummary>> {
    let summary = state.queue.cleanup_all().await?;
    info!("Manual cleanup removed {} entries", summary.total);
    Ok(Json(summary))
}
