//! API Routes
//!
//! - `/api/jobs` - Job submission, status and status stream
//! - `/api/queue` - Queue stats, provider usage, manual processing
//! - `/api/admin` - Maintenance
//! - `/api/health` - Health checks

pub mod health;
pub mod jobs;
pub mod queue;

use crate::middleware::cors_layer;
use crate::models::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(jobs::router(state.clone()))
        .merge(queue::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
