// POST /analyze - request analysis of hashes or of a saved query's matches

use super::{validate_hashes, ApiError, ApiState};
use crate::queue::{Enqueue, JobKind, QueueName};
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Request body: exactly one of `hashes` or `query`.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub hashes: Option<Vec<String>>,
    pub query: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub job_id: String,
}

pub async fn analyze(
    State(state): State<ApiState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    tracing::debug!("/analyze: {:?}", req);

    let limit = match req.limit {
        Some(n) if n <= 0 => {
            return Err(ApiError::BadRequest("limit must be positive".into()));
        }
        Some(n) => Some(n as usize),
        None => None,
    };

    let kind = match (req.hashes, req.query) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "request must carry either hashes or query, not both".into(),
            ));
        }
        (Some(hashes), None) => {
            validate_hashes(&hashes)?;
            tracing::debug!("enqueueing retrieval of {} binaries", hashes.len());
            JobKind::FetchBinaries { hashes }
        }
        (None, Some(query)) => {
            if query.is_empty() {
                return Err(ApiError::BadRequest("query must be non-empty".into()));
            }
            JobKind::FetchQuery { query, limit }
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "request must carry hashes or query".into(),
            ));
        }
    };

    let job_id = state
        .engine
        .queues
        .enqueue(QueueName::BinaryRetrieval, kind, Enqueue::default());

    Ok(Json(AnalyzeResponse {
        success: true,
        job_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes_deserialize() {
        let req: AnalyzeRequest =
            serde_json::from_str(&format!(r#"{{"hashes": ["{}"]}}"#, "a".repeat(64))).unwrap();
        assert_eq!(req.hashes.unwrap().len(), 1);

        let req: AnalyzeRequest =
            serde_json::from_str(r#"{"query": "process_name:evil.exe", "limit": 50}"#).unwrap();
        assert_eq!(req.query.as_deref(), Some("process_name:evil.exe"));
        assert_eq!(req.limit, Some(50));
    }
}
