//! Queue substrate - four named FIFO work queues with dependency chaining
//!
//! Jobs are tagged `JobKind` values, not serialized closures: the worker
//! loop (pipeline/mod.rs) matches on the kind to run the right stage. Each
//! queue is an unbounded channel of job ids; the job board tracks every
//! record for introspection and for the `depends_on` protocol.
//!
//! Dependency protocol: a job enqueued with `depends_on` stays deferred
//! until its predecessor finishes. Predecessor success releases dependents
//! onto their queues; failure or cancellation cancels them, cascading.
//!
//! Queue names are part of the external contract - workers subscribe by
//! name and operators watch them by name.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// The four work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    BinaryRetrieval,
    BinaryAnalysis,
    BinaryCleanup,
    ResultDispatch,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::BinaryRetrieval,
        QueueName::BinaryAnalysis,
        QueueName::BinaryCleanup,
        QueueName::ResultDispatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::BinaryRetrieval => "binary_retrieval",
            QueueName::BinaryAnalysis => "binary_analysis",
            QueueName::BinaryCleanup => "binary_cleanup",
            QueueName::ResultDispatch => "result_dispatch",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does. One variant per pipeline stage.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Filter, resolve via UBS, and chain download+analysis per hash.
    FetchBinaries { hashes: Vec<String> },
    /// Download one binary into the cache; `retry` counts remaining 404
    /// attempts.
    DownloadBinary {
        sha256: String,
        url: String,
        retry: u32,
    },
    /// Seed the refcount and fan out one RunConnector job per connector.
    AnalyzeBinary { sha256: String },
    /// Run a single connector over a cached binary.
    RunConnector { connector: String, sha256: String },
    /// Deliver a batch of result ids to the connector's sink.
    DispatchResults {
        connector: String,
        result_ids: Vec<i64>,
    },
    /// Evict a binary's cache keys once its refcount reaches zero.
    FlushBinary { sha256: String },
    /// Run a saved UBS query and enqueue retrieval of the matches.
    FetchQuery {
        query: String,
        limit: Option<usize>,
    },
}

impl JobKind {
    /// Stable name for logs and job introspection.
    pub fn func_name(&self) -> &'static str {
        match self {
            JobKind::FetchBinaries { .. } => "fetch_binaries",
            JobKind::DownloadBinary { .. } => "download_binary",
            JobKind::AnalyzeBinary { .. } => "analyze_binary",
            JobKind::RunConnector { .. } => "run_connector",
            JobKind::DispatchResults { .. } => "dispatch_results",
            JobKind::FlushBinary { .. } => "flush_binary",
            JobKind::FetchQuery { .. } => "fetch_query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// In its queue's channel, waiting for a worker.
    Queued,
    /// Waiting on a predecessor.
    Deferred,
    Started,
    Finished,
    Failed,
    /// Predecessor failed, so this job will never run.
    Cancelled,
}

/// One job on the board.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub queue: QueueName,
    pub kind: JobKind,
    pub status: JobStatus,
    pub timeout: Option<Duration>,
    pub depends_on: Option<String>,
    pub dependents: Vec<String>,
    /// Free-form per-job map, settable while the job runs.
    pub meta: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Per-enqueue options.
#[derive(Debug, Default)]
pub struct Enqueue {
    pub timeout: Option<Duration>,
    pub depends_on: Option<String>,
}

struct QueueChannel {
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

/// The job board plus the four queue channels.
pub struct Queues {
    board: Mutex<HashMap<String, JobRecord>>,
    channels: HashMap<QueueName, QueueChannel>,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for name in QueueName::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            channels.insert(
                name,
                QueueChannel {
                    tx,
                    rx: tokio::sync::Mutex::new(rx),
                },
            );
        }
        Self {
            board: Mutex::new(HashMap::new()),
            channels,
        }
    }

    /// Enqueue a job, returning its id. With `depends_on` the job defers
    /// until the predecessor succeeds; a predecessor that already failed
    /// (or doesn't exist) cancels the new job immediately.
    pub fn enqueue(&self, queue: QueueName, kind: JobKind, opts: Enqueue) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut record = JobRecord {
            id: id.clone(),
            queue,
            kind,
            status: JobStatus::Queued,
            timeout: opts.timeout,
            depends_on: opts.depends_on.clone(),
            dependents: Vec::new(),
            meta: Map::new(),
            enqueued_at: Utc::now(),
            error: None,
        };

        let mut board = self.board.lock().unwrap();
        let mut push = true;

        if let Some(pred_id) = &opts.depends_on {
            match board.get_mut(pred_id) {
                Some(pred) => match pred.status {
                    JobStatus::Finished => {}
                    JobStatus::Failed | JobStatus::Cancelled => {
                        tracing::debug!(
                            job = %id,
                            predecessor = %pred_id,
                            "predecessor already failed, cancelling dependent"
                        );
                        record.status = JobStatus::Cancelled;
                        push = false;
                    }
                    _ => {
                        pred.dependents.push(id.clone());
                        record.status = JobStatus::Deferred;
                        push = false;
                    }
                },
                None => {
                    tracing::warn!(
                        job = %id,
                        predecessor = %pred_id,
                        "unknown predecessor, cancelling dependent"
                    );
                    record.status = JobStatus::Cancelled;
                    push = false;
                }
            }
        }

        tracing::debug!(
            job = %id,
            queue = %queue,
            func = record.kind.func_name(),
            status = ?record.status,
            "enqueued"
        );
        board.insert(id.clone(), record);
        drop(board);

        if push {
            self.push(queue, &id);
        }
        id
    }

    fn push(&self, queue: QueueName, id: &str) {
        // The receiver lives as long as Queues, so send can't fail
        let _ = self.channels[&queue].tx.send(id.to_string());
    }

    /// Block until the next runnable job id on `queue`. Multiple workers
    /// may call this concurrently; each id is handed to exactly one.
    pub async fn next_job(&self, queue: QueueName) -> Option<String> {
        loop {
            let id = {
                let mut rx = self.channels[&queue].rx.lock().await;
                rx.recv().await?
            };
            // Skip ids whose record was cancelled while queued
            let runnable = {
                let board = self.board.lock().unwrap();
                board
                    .get(&id)
                    .map(|r| r.status == JobStatus::Queued)
                    .unwrap_or(false)
            };
            if runnable {
                return Some(id);
            }
        }
    }

    /// Transition a popped job to Started, returning a snapshot of it.
    pub fn mark_started(&self, id: &str) -> Option<JobRecord> {
        let mut board = self.board.lock().unwrap();
        let record = board.get_mut(id)?;
        record.status = JobStatus::Started;
        Some(record.clone())
    }

    /// Mark a job finished and release its dependents onto their queues.
    pub fn complete(&self, id: &str) {
        let dependents = {
            let mut board = self.board.lock().unwrap();
            let Some(record) = board.get_mut(id) else {
                return;
            };
            record.status = JobStatus::Finished;
            let dependents = std::mem::take(&mut record.dependents);
            for dep_id in &dependents {
                if let Some(dep) = board.get_mut(dep_id) {
                    if dep.status == JobStatus::Deferred {
                        dep.status = JobStatus::Queued;
                    }
                }
            }
            dependents
        };
        for dep_id in dependents {
            let queue = {
                let board = self.board.lock().unwrap();
                board.get(&dep_id).map(|r| r.queue)
            };
            if let Some(queue) = queue {
                self.push(queue, &dep_id);
            }
        }
    }

    /// Mark a job failed and cancel its dependents, cascading.
    pub fn fail(&self, id: &str, error: &str) {
        let mut board = self.board.lock().unwrap();
        if let Some(record) = board.get_mut(id) {
            record.status = JobStatus::Failed;
            record.error = Some(error.to_string());
            let dependents = std::mem::take(&mut record.dependents);
            cancel_all(&mut board, dependents);
        }
    }

    /// Re-enqueue a variant of a running job on its own queue, transferring
    /// the job's dependents to the successor. Used by the download retry
    /// path: the analysis chained to the original download ends up waiting
    /// on whichever retry finally succeeds.
    pub fn requeue_with_dependents(&self, current_id: &str, kind: JobKind) -> Option<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut board = self.board.lock().unwrap();
        let current = board.get_mut(current_id)?;
        let queue = current.queue;
        let timeout = current.timeout;
        let dependents = std::mem::take(&mut current.dependents);

        for dep_id in &dependents {
            if let Some(dep) = board.get_mut(dep_id) {
                dep.depends_on = Some(id.clone());
            }
        }

        tracing::debug!(
            from = %current_id,
            to = %id,
            func = kind.func_name(),
            transferred = dependents.len(),
            "requeued with dependents"
        );
        board.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                queue,
                kind,
                status: JobStatus::Queued,
                timeout,
                depends_on: None,
                dependents,
                meta: Map::new(),
                enqueued_at: Utc::now(),
                error: None,
            },
        );
        drop(board);

        self.push(queue, &id);
        Some(id)
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Fetch a job snapshot by id.
    pub fn job(&self, id: &str) -> Option<JobRecord> {
        self.board.lock().unwrap().get(id).cloned()
    }

    /// Jobs waiting (queued or deferred) on the given queue, oldest first.
    pub fn queued_jobs(&self, queue: QueueName) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .board
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.queue == queue
                    && matches!(r.status, JobStatus::Queued | JobStatus::Deferred)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|r| r.enqueued_at);
        jobs
    }

    /// Jobs currently executing on the given queue, oldest first.
    pub fn started_jobs(&self, queue: QueueName) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .board
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.queue == queue && r.status == JobStatus::Started)
            .cloned()
            .collect();
        jobs.sort_by_key(|r| r.enqueued_at);
        jobs
    }

    /// Merge a key into a job's persisted meta map.
    pub fn set_meta(&self, id: &str, key: &str, value: Value) {
        if let Some(record) = self.board.lock().unwrap().get_mut(id) {
            record.meta.insert(key.to_string(), value);
        }
    }

    /// Number of jobs that are not yet terminal. Zero means the pipeline
    /// has drained.
    pub fn pending_count(&self) -> usize {
        self.board
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    JobStatus::Queued | JobStatus::Deferred | JobStatus::Started
                )
            })
            .count()
    }

    /// All job records, for diagnostics.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        self.board.lock().unwrap().values().cloned().collect()
    }
}

fn cancel_all(board: &mut HashMap<String, JobRecord>, mut pending: Vec<String>) {
    while let Some(id) = pending.pop() {
        if let Some(record) = board.get_mut(&id) {
            if matches!(record.status, JobStatus::Deferred | JobStatus::Queued) {
                record.status = JobStatus::Cancelled;
                pending.extend(std::mem::take(&mut record.dependents));
            }
        }
    }
}
