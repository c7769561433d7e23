// HTTP front-end - the JSON surface over the queues, store and scheduler
//
// A thin validating shell: every endpoint either enqueues work or reads the
// result store; nothing here waits on job completion. Successful responses
// carry success=true, validation failures map to 400 with the validator's
// message, and an unknown job id on DELETE /job maps to 404.

mod analysis;
mod analyze;
mod hashes;
mod jobs;

#[cfg(test)]
mod tests;

use crate::pipeline::Engine;
use crate::sched::Scheduler;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

pub use analysis::{remove_analyses, retrieve_analyses};
pub use analyze::analyze;
pub use hashes::list_hashes;
pub use jobs::{add_job, get_jobs, remove_job};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
}

/// How a front-end request can go wrong.
///
/// Rejections mirror the endpoint contract: malformed requests carry the
/// validator's message back as a 400, cancelling an unregistered schedule
/// is a 404, and a store failure underneath a read or delete is the only
/// 500. Every arm answers with the same JSON envelope the success paths
/// use, just with `success=false`.
#[derive(Debug)]
pub enum ApiError {
    /// Request failed validation; the message names the offending field.
    BadRequest(String),
    /// DELETE /job named a schedule id that is not on the board.
    UnknownJob(String),
    /// The result store failed underneath the request.
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => {
                tracing::debug!(reason = %message, "rejecting malformed request");
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::UnknownJob(job_id) => {
                tracing::debug!(job = %job_id, "cancel requested for unknown schedule");
                (StatusCode::NOT_FOUND, "no such job".to_string())
            }
            ApiError::Store(e) => {
                // Conflicts never reach the front-end (reads and deletes
                // don't insert), so anything landing here is operational
                tracing::error!("result store failed under front-end request: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "result store failure".to_string())
            }
        };

        let body = Json(serde_json::json!({ "success": false, "message": message }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

/// Build the application router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/analyze", post(analyze))
        .route(
            "/analysis",
            get(retrieve_analyses).delete(remove_analyses),
        )
        .route("/job", get(get_jobs).post(add_job).delete(remove_job))
        .route("/hashes", get(list_hashes))
        .with_state(state)
}

/// Serve the front-end until the process exits.
pub async fn serve(state: ApiState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("front-end listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// A well-formed binary identity: 64 chars of lowercase hex.
pub(crate) fn valid_sha256(hash: &str) -> bool {
    hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Validate a hash list: non-empty, every entry well-formed.
pub(crate) fn validate_hashes(hashes: &[String]) -> Result<(), ApiError> {
    if hashes.is_empty() {
        return Err(ApiError::BadRequest("hashes must be non-empty".into()));
    }
    if let Some(bad) = hashes.iter().find(|h| !valid_sha256(h)) {
        return Err(ApiError::BadRequest(format!(
            "not a sha256 hash: {bad:?}"
        )));
    }
    Ok(())
}
