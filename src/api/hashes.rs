// GET /hashes - every binary hash the sandbox has observed

use super::{ApiError, ApiState};
use axum::extract::State;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HashesResponse {
    pub success: bool,
    pub hashes: Vec<String>,
}

pub async fn list_hashes(
    State(state): State<ApiState>,
) -> Result<Json<HashesResponse>, ApiError> {
    let hashes = state.engine.store.all_hashes()?;
    Ok(Json(HashesResponse {
        success: true,
        hashes,
    }))
}
