use crate::models::{AppState, SubmitJobResponse};
use crate::queue::{JobData, JobQueue, StatusRecord};
use crate::types::{AppError, AppResult};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const CLIENT_ID_HEADER: &str = "x-client-id";
const ANONYMOUS_CLIENT: &str = "anonymous";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{job_id}", get(get_job_status))
        .route("/api/jobs/{job_id}/stream", get(stream_job_status))
        .with_state(state)
}

pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<JobData>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SubmitJobResponse>)> {
    let Json(data) = body.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    data.validate().map_err(|e| AppError::InvalidRequest(e.to_string()))?;

    let job_type = data.job_type();
    if !state.providers.supports(job_type) {
        return Err(AppError::InvalidRequest(format!(
            "no provider configured for {} jobs",
            job_type
        )));
    }

    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT);

    let job_id = state.queue.enqueue(data, client_id).await?;
    state.wake.wake();
    state.queue.announce().await;
    info!("Accepted {} job {} from {}", job_type, job_id, client_id);

    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse::for_job(job_id))))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<StatusRecord>> {
    state
        .queue
        .status(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", job_id)))
}

struct StreamCursor {
    queue: Arc<JobQueue>,
    job_id: Uuid,
    poll: Duration,
    last: Option<String>,
    finished: bool,
}

/// One `status` event per change of the record, until it is terminal or expires.
pub async fn stream_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if state.queue.status(job_id).await?.is_none() {
        return Err(AppError::NotFound(format!("job {} not found", job_id)));
    }

    let cursor = StreamCursor {
        queue: state.queue.clone(),
        job_id,
        poll: state.config.queue.stream_poll(),
        last: None,
        finished: false,
    };

    let stream = stream::unfold(cursor, |mut cursor| async move {
        if cursor.finished {
            return None;
        }

        let event = loop {
            match cursor.queue.status(cursor.job_id).await {
                Ok(Some(record)) => {
                    let data = match serde_json::to_string(&record) {
                        Ok(data) => data,
                        Err(e) => {
                            cursor.finished = true;
                            break Event::default().event("error").data(e.to_string());
                        }
                    };
                    if cursor.last.as_deref() != Some(data.as_str()) {
                        cursor.finished = record.status.is_terminal();
                        cursor.last = Some(data.clone());
                        break Event::default().event("status").data(data);
                    }
                }
                Ok(None) => {
                    cursor.finished = true;
                    break Event::default().event("expired").data(cursor.job_id.to_string());
                }
                Err(e) => {
                    cursor.finished = true;
                    break Event::default().event("error").data(e.to_string());
                }
            }
            tokio::time::sleep(cursor.poll).await;
        };

        Some((Ok(event), cursor))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
