// GET/DELETE /analysis - read or remove stored results

use super::{validate_hashes, ApiError, ApiState};
use crate::model::AnalysisResult;
use crate::store::DeleteKind;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub hashes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AnalysesData {
    /// hash -> results (with IOCs) already in the store
    pub completed: HashMap<String, Vec<AnalysisResult>>,
    /// active (pending or running) analysis job ids
    pub pending: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub success: bool,
    pub data: AnalysesData,
}

pub async fn retrieve_analyses(
    State(state): State<ApiState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    tracing::debug!("retrieve_analyses: {:?}", req);
    validate_hashes(&req.hashes)?;

    let mut completed = HashMap::new();
    for hash in &req.hashes {
        completed.insert(hash.clone(), state.engine.store.results_by_hash(hash)?);
    }

    Ok(Json(RetrieveResponse {
        success: true,
        data: AnalysesData {
            completed,
            pending: state.engine.active_analyses(),
        },
    }))
}

/// Which result field `items` matches against.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalKind {
    Hashes,
    ConnectorNames,
    AnalysisNames,
    JobIds,
}

impl From<RemovalKind> for DeleteKind {
    fn from(kind: RemovalKind) -> Self {
        match kind {
            RemovalKind::Hashes => DeleteKind::Hashes,
            RemovalKind::ConnectorNames => DeleteKind::ConnectorNames,
            RemovalKind::AnalysisNames => DeleteKind::AnalysisNames,
            RemovalKind::JobIds => DeleteKind::JobIds,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub kind: RemovalKind,
    pub items: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
    pub removed: usize,
}

pub async fn remove_analyses(
    State(state): State<ApiState>,
    Json(req): Json<RemoveRequest>,
) -> Result<Json<RemoveResponse>, ApiError> {
    tracing::debug!("remove_analyses: {:?}", req);

    if req.items.is_empty() {
        return Err(ApiError::BadRequest("items must be non-empty".into()));
    }
    if matches!(req.kind, RemovalKind::Hashes) {
        validate_hashes(&req.items)?;
    }

    let removed = state
        .engine
        .store
        .delete_results(req.kind.into(), &req.items)?;

    Ok(Json(RemoveResponse {
        success: true,
        removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_kind_names() {
        for (name, expected) in [
            ("hashes", DeleteKind::Hashes),
            ("connector_names", DeleteKind::ConnectorNames),
            ("analysis_names", DeleteKind::AnalysisNames),
            ("job_ids", DeleteKind::JobIds),
        ] {
            let kind: RemovalKind =
                serde_json::from_str(&format!("\"{name}\"")).expect(name);
            assert_eq!(DeleteKind::from(kind), expected);
        }
        assert!(serde_json::from_str::<RemovalKind>("\"everything\"").is_err());
    }
}
