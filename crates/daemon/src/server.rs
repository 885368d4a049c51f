//! Status HTTP server
//!
//! Read-mostly view of the job pipeline for clients: job records, cancel,
//! removal of finished records, and a live server-sent event stream of
//! [`JobUpdate`](crate::jobs::JobUpdate)s.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broadcast::Subscription;
use crate::jobs::Job;
use crate::queue::{Dispatcher, QueueError};
use crate::store::StoreError;

/// Interval between SSE keepalive comments.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the SSE event carrying a job update.
pub const JOB_UPDATE_EVENT: &str = "job-update";

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

/// Handler-level failure, rendered as `{"error": "..."}`.
enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(format!("job {} not found", id)),
            other => {
                error!(error = %other, "job store request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// GET /jobs
async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.dispatcher.processor().store().list().await?;
    Ok(Json(jobs))
}

/// GET /jobs/:id
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.dispatcher.processor().store().get(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("job {} not found", id))),
    }
}

/// POST /jobs/:id/cancel
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.dispatcher.cancel_job(&id).await {
        Ok(()) => Ok(Json(json!({ "jobId": id, "canceled": true }))),
        Err(e @ QueueError::NotActive(_)) => Err(ApiError::Conflict(e.to_string())),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// DELETE /jobs/:id
///
/// Only records in a terminal stage can be removed.
async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let store = state.dispatcher.processor().store();
    match store.get(&id).await? {
        Some(job) if job.is_terminal() => {
            store.delete(&id).await?;
            info!(job_id = %id, stage = %job.stage, "job record removed");
            Ok(StatusCode::NO_CONTENT)
        }
        _ => Err(ApiError::NotFound(format!(
            "job {} not found or still in progress",
            id
        ))),
    }
}

/// Unsubscribes from the broadcaster when the SSE stream is dropped.
struct EventFeed {
    subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.subscription.id);
        debug!(subscriber = self.subscription.id, "event stream closed");
    }
}

fn job_events(feed: EventFeed) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(feed, |mut feed| async move {
        let update = tokio::select! {
            _ = feed.shutdown.cancelled() => None,
            update = feed.subscription.receiver.recv() => update,
        }?;
        let event = Event::default().event(JOB_UPDATE_EVENT).json_data(&update);
        Some((event, feed))
    })
}

/// GET /jobs/events
async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.dispatcher.subscribe();
    debug!(subscriber = subscription.id, "event stream opened");
    let feed = EventFeed {
        subscription,
        dispatcher: state.dispatcher.clone(),
        shutdown: state.shutdown.clone(),
    };
    Sse::new(job_events(feed)).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

/// Creates the axum Router with the job endpoints
///
/// Event streams end when `shutdown` is cancelled so a graceful shutdown
/// is not held open by connected clients.
pub fn create_router(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/events", get(stream_events))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(AppState {
            dispatcher,
            shutdown,
        })
}

/// Runs the status server on `addr` until `shutdown` is cancelled
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start or serve
pub async fn run_server(
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(dispatcher, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}
