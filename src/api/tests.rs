//! Front-end contract tests
//!
//! Handlers are plain async functions over `ApiState`, so the validation
//! and response contract can be exercised directly, without binding a
//! socket. The engine underneath runs no workers here: these tests check
//! what gets enqueued and what comes back, not pipeline execution.

use super::analysis::{RemoveRequest, RetrieveRequest};
use super::analyze::AnalyzeRequest;
use super::jobs::{AddJobRequest, GetJobsRequest, RemoveJobRequest};
use super::*;
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::connector::Registry;
use crate::model::{IocDraft, ResultDraft};
use crate::queue::{JobKind, Queues};
use crate::sink::{Report, ResultSink};
use crate::store::Store;
use crate::ubs::{DownloadError, Resolved, Ubs};
use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use std::sync::Arc;

/// UBS that knows nothing; the front-end never calls it directly.
struct NoUbs;

#[async_trait]
impl Ubs for NoUbs {
    async fn resolve(&self, hashes: &[String]) -> Resolved {
        Resolved {
            not_found: hashes.to_vec(),
            ..Default::default()
        }
    }

    async fn search(&self, _query: &str, _limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn download(&self, _url: &str) -> Result<Bytes, DownloadError> {
        Err(DownloadError::NotFound)
    }
}

struct NoSink;

#[async_trait]
impl ResultSink for NoSink {
    async fn append_reports(&self, _feed_id: &str, _reports: &[Report]) -> anyhow::Result<()> {
        Ok(())
    }
}

fn fixture() -> (ApiState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("api.db")).expect("open store");
    let queues = Arc::new(Queues::new());

    let engine = Arc::new(Engine {
        config: Config::production(),
        store,
        cache: Arc::new(MemoryCache::new()),
        ubs: Arc::new(NoUbs),
        sink: Arc::new(NoSink),
        registry: Arc::new(Registry::from_connectors(Vec::new()).unwrap()),
        queues: queues.clone(),
    });
    let scheduler = Arc::new(Scheduler::new(queues));

    (ApiState { engine, scheduler }, dir)
}

fn hash(c: char) -> String {
    std::iter::repeat(c).take(64).collect()
}

#[test]
fn test_valid_sha256() {
    assert!(valid_sha256(&hash('a')));
    assert!(valid_sha256(&format!("{:064x}", 0xdeadbeefu64)));
    // wrong length
    assert!(!valid_sha256(&"a".repeat(63)));
    // uppercase is rejected; identities are canonically lowercase
    assert!(!valid_sha256(&"A".repeat(64)));
    // non-hex
    assert!(!valid_sha256(&"g".repeat(64)));
}

#[tokio::test]
async fn test_analyze_empty_hashes_is_400() {
    let (state, _dir) = fixture();
    let err = analyze(
        State(state),
        Json(AnalyzeRequest {
            hashes: Some(Vec::new()),
            query: None,
            limit: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_analyze_requires_exactly_one_selector() {
    let (state, _dir) = fixture();

    let err = analyze(
        State(state.clone()),
        Json(AnalyzeRequest {
            hashes: None,
            query: None,
            limit: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = analyze(
        State(state),
        Json(AnalyzeRequest {
            hashes: Some(vec![hash('a')]),
            query: Some("process_name:evil.exe".into()),
            limit: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_analyze_enqueues_retrieval() {
    let (state, _dir) = fixture();
    let Json(resp) = analyze(
        State(state.clone()),
        Json(AnalyzeRequest {
            hashes: Some(vec![hash('a')]),
            query: None,
            limit: None,
        }),
    )
    .await
    .unwrap();
    assert!(resp.success);

    let job = state.engine.queues.job(&resp.job_id).expect("job on board");
    match job.kind {
        JobKind::FetchBinaries { hashes } => assert_eq!(hashes, vec![hash('a')]),
        other => panic!("unexpected job kind {:?}", other),
    }
}

#[tokio::test]
async fn test_analyze_query_with_bad_limit_is_400() {
    let (state, _dir) = fixture();
    let err = analyze(
        State(state),
        Json(AnalyzeRequest {
            hashes: None,
            query: Some("process_name:evil.exe".into()),
            limit: Some(0),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_retrieve_round_trips_results_with_iocs() {
    let (state, _dir) = fixture();
    let draft = ResultDraft::new("rules", 6)
        .with_ioc(IocDraft::equality(vec![hash('a')], None))
        .with_ioc(IocDraft::equality(vec!["evil.exe".into()], Some("process_name".into())));
    state
        .engine
        .store
        .create_result(&hash('a'), "yara", "job-1", &draft)
        .unwrap();

    let Json(resp) = retrieve_analyses(
        State(state),
        Json(RetrieveRequest {
            hashes: vec![hash('a'), hash('b')],
        }),
    )
    .await
    .unwrap();

    assert!(resp.success);
    let completed = &resp.data.completed;
    assert_eq!(completed[&hash('a')].len(), 1);
    assert_eq!(completed[&hash('a')][0].iocs.len(), 2);
    assert!(completed[&hash('b')].is_empty());
    assert!(resp.data.pending.is_empty());
}

#[tokio::test]
async fn test_remove_analyses_by_connector() {
    let (state, _dir) = fixture();
    state
        .engine
        .store
        .create_result(&hash('a'), "yara", "job-1", &ResultDraft::new("rules", 5))
        .unwrap();

    let Json(resp) = remove_analyses(
        State(state.clone()),
        Json(RemoveRequest {
            kind: super::analysis::RemovalKind::ConnectorNames,
            items: vec!["yara".into()],
        }),
    )
    .await
    .unwrap();
    assert!(resp.success);
    assert_eq!(resp.removed, 1);
    assert!(state.engine.store.results_by_hash(&hash('a')).unwrap().is_empty());
}

#[tokio::test]
async fn test_job_lifecycle() {
    let (state, _dir) = fixture();

    // Add
    let Json(added) = add_job(
        State(state.clone()),
        Json(AddJobRequest {
            query: "process_name:evil.exe".into(),
            schedule: "*/5 * * * *".into(),
            repeat: serde_json::from_str("3").unwrap(),
            limit: None,
        }),
    )
    .await
    .unwrap();
    assert!(added.success);

    // List
    let Json(listed) = get_jobs(
        State(state.clone()),
        Json(GetJobsRequest {
            until: "forever".into(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(listed.jobs.len(), 1);
    assert_eq!(listed.jobs[0].job_id, added.job_id);

    // Remove
    let Json(removed) = remove_job(
        State(state.clone()),
        Json(RemoveJobRequest {
            job_id: added.job_id.clone(),
        }),
    )
    .await
    .unwrap();
    assert!(removed.success);

    // Removing again is a 404
    let err = remove_job(
        State(state),
        Json(RemoveJobRequest {
            job_id: added.job_id,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::UnknownJob(_)));
}

#[tokio::test]
async fn test_add_job_rejects_bad_schedule() {
    let (state, _dir) = fixture();
    let err = add_job(
        State(state),
        Json(AddJobRequest {
            query: "q".into(),
            schedule: "whenever".into(),
            repeat: serde_json::from_str("\"forever\"").unwrap(),
            limit: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_get_jobs_rejects_bad_cutoff() {
    let (state, _dir) = fixture();
    let err = get_jobs(
        State(state),
        Json(GetJobsRequest {
            until: "next tuesday".into(),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn test_hashes_lists_known_binaries() {
    let (state, _dir) = fixture();
    state.engine.store.upsert_binary(&hash('a'), true).unwrap();
    state.engine.store.upsert_binary(&hash('b'), false).unwrap();

    let Json(resp) = list_hashes(State(state)).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.hashes, vec![hash('a'), hash('b')]);
}
