// GET/POST/DELETE /job - manage cron-scheduled query ingestion

use super::{ApiError, ApiState};
use crate::sched::Repeat;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct GetJobsRequest {
    /// "forever" or an ISO-8601 cutoff.
    pub until: String,
}

#[derive(Debug, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct GetJobsResponse {
    pub success: bool,
    pub jobs: Vec<ScheduledJob>,
}

pub async fn get_jobs(
    State(state): State<ApiState>,
    Json(req): Json<GetJobsRequest>,
) -> Result<Json<GetJobsResponse>, ApiError> {
    tracing::debug!("get_jobs: {:?}", req);

    let until = if req.until == "forever" {
        None
    } else {
        let cutoff = DateTime::parse_from_rfc3339(&req.until)
            .map_err(|e| ApiError::BadRequest(format!("bad until timestamp: {e}")))?;
        Some(cutoff.with_timezone(&Utc))
    };

    let jobs = state
        .scheduler
        .jobs_until(until)
        .into_iter()
        .map(|(job_id, at)| ScheduledJob {
            job_id,
            at: at.to_rfc3339(),
        })
        .collect();

    Ok(Json(GetJobsResponse {
        success: true,
        jobs,
    }))
}

/// "forever" or a positive run count.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RepeatField {
    Word(String),
    Count(i64),
}

impl RepeatField {
    fn into_repeat(self) -> Result<Repeat, ApiError> {
        match self {
            RepeatField::Word(word) if word == "forever" => Ok(Repeat::Forever),
            RepeatField::Word(word) => Err(ApiError::BadRequest(format!(
                "repeat must be \"forever\" or a positive integer, got {word:?}"
            ))),
            RepeatField::Count(n) if n > 0 => Ok(Repeat::Times(n as u32)),
            RepeatField::Count(n) => Err(ApiError::BadRequest(format!(
                "repeat must be positive, got {n}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddJobRequest {
    pub query: String,
    /// Cron expression.
    pub schedule: String,
    pub repeat: RepeatField,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AddJobResponse {
    pub success: bool,
    pub job_id: String,
}

pub async fn add_job(
    State(state): State<ApiState>,
    Json(req): Json<AddJobRequest>,
) -> Result<Json<AddJobResponse>, ApiError> {
    tracing::debug!("add_job: {:?}", req);

    if req.query.is_empty() {
        return Err(ApiError::BadRequest("query must be non-empty".into()));
    }
    let limit = match req.limit {
        Some(n) if n <= 0 => {
            return Err(ApiError::BadRequest("limit must be positive".into()));
        }
        Some(n) => Some(n as usize),
        None => None,
    };
    let repeat = req.repeat.into_repeat()?;

    let job_id = state
        .scheduler
        .add(&req.schedule, req.query, limit, repeat)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(AddJobResponse {
        success: true,
        job_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RemoveJobRequest {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveJobResponse {
    pub success: bool,
}

pub async fn remove_job(
    State(state): State<ApiState>,
    Json(req): Json<RemoveJobRequest>,
) -> Result<Json<RemoveJobResponse>, ApiError> {
    tracing::debug!("remove_job: {:?}", req);

    if !state.scheduler.contains(&req.job_id) {
        return Err(ApiError::UnknownJob(req.job_id));
    }
    state.scheduler.cancel(&req.job_id);

    Ok(Json(RemoveJobResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_field_parsing() {
        let forever: RepeatField = serde_json::from_str("\"forever\"").unwrap();
        assert_eq!(forever.into_repeat().unwrap(), Repeat::Forever);

        let three: RepeatField = serde_json::from_str("3").unwrap();
        assert_eq!(three.into_repeat().unwrap(), Repeat::Times(3));

        let zero: RepeatField = serde_json::from_str("0").unwrap();
        assert!(zero.into_repeat().is_err());

        let word: RepeatField = serde_json::from_str("\"sometimes\"").unwrap();
        assert!(word.into_repeat().is_err());
    }

    #[test]
    fn test_add_job_request_shape() {
        let req: AddJobRequest = serde_json::from_str(
            r#"{"query": "process_name:evil.exe", "schedule": "*/5 * * * *", "repeat": 3}"#,
        )
        .unwrap();
        assert_eq!(req.schedule, "*/5 * * * *");
        assert!(req.limit.is_none());
    }
}
