//! The job engine - workers, stage dispatch, and timeout salvage
//!
//! Control flow through the sandbox is job-to-job enqueueing; nothing in
//! here waits in-process for another job to finish. The engine bundles the
//! shared handles (store, cache, UBS, sink, connector registry, queues) and
//! runs a pool of workers per queue. Each worker pops a job, matches on its
//! kind, and runs the corresponding stage:
//!
//! ```text
//! fetch_binaries ──→ download_binary ──→ analyze_binary ──→ run_connector
//!                        (depends_on)                            │
//!                                    flush_binary ←── refcount 0 ┤
//!                                    dispatch_results ←── batches┘
//! ```
//!
//! Per-job timeouts are raced against the job future; when one fires inside
//! a `run_connector` job, the salvage path flushes whatever result ids were
//! still buffered below the batch window, so completed work reaches the
//! dispatcher even though the job itself fails.

pub mod analysis;
pub mod cleanup;
pub mod dispatch;
pub mod retrieval;


use crate::cache::BinaryCache;
use crate::config::Config;
use crate::connector::Registry;
use crate::queue::{Enqueue, JobKind, JobRecord, QueueName, Queues};
use crate::sink::ResultSink;
use crate::store::Store;
use crate::ubs::Ubs;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Result ids produced by a running analysis job but not yet handed to the
/// dispatcher. Owned by the worker, shared with the running job; the
/// timeout path drains it by swapping in an empty buffer.
pub type SalvageBuffer = Arc<Mutex<Vec<i64>>>;

/// Shared handles for every pipeline stage.
pub struct Engine {
    pub config: Config,
    pub store: Store,
    pub cache: Arc<dyn BinaryCache>,
    pub ubs: Arc<dyn Ubs>,
    pub sink: Arc<dyn ResultSink>,
    pub registry: Arc<Registry>,
    pub queues: Arc<Queues>,
}

impl Engine {
    /// Spawn `workers_per_queue` workers for each of the four queues.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            for n in 0..self.config.workers_per_queue {
                let engine = self.clone();
                handles.push(tokio::spawn(async move {
                    tracing::debug!(queue = %queue, worker = n, "worker started");
                    engine.worker_loop(queue).await;
                }));
            }
        }
        handles
    }

    async fn worker_loop(self: Arc<Self>, queue: QueueName) {
        while let Some(id) = self.queues.next_job(queue).await {
            let Some(job) = self.queues.mark_started(&id) else {
                continue;
            };
            self.run_job(job).await;
        }
    }

    /// Run one job to completion, honoring its timeout. Worker-level
    /// failure handling lives here: a failed job is recorded and its
    /// dependents cancel, but the worker itself never dies.
    pub async fn run_job(&self, job: JobRecord) {
        tracing::debug!(job = %job.id, func = job.kind.func_name(), "job started");
        let salvage: SalvageBuffer = Arc::new(Mutex::new(Vec::new()));

        let outcome = match job.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.execute(&job, &salvage)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.salvage_timeout(&job, &salvage);
                    Err(anyhow::anyhow!("job timeout after {:?}", limit))
                }
            },
            None => self.execute(&job, &salvage).await,
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(job = %job.id, "job finished");
                self.queues.complete(&job.id);
            }
            Err(e) => {
                tracing::error!(job = %job.id, func = job.kind.func_name(), "job failed: {:#}", e);
                self.queues.fail(&job.id, &format!("{:#}", e));
            }
        }
    }

    async fn execute(&self, job: &JobRecord, salvage: &SalvageBuffer) -> anyhow::Result<()> {
        match &job.kind {
            JobKind::FetchBinaries { hashes } => retrieval::fetch_binaries(self, hashes).await,
            JobKind::DownloadBinary { sha256, url, retry } => {
                retrieval::download_binary(self, job, sha256, url, *retry).await
            }
            JobKind::AnalyzeBinary { sha256 } => analysis::analyze_binary(self, sha256).await,
            JobKind::RunConnector { connector, sha256 } => {
                analysis::run_connector(self, job, connector, sha256, salvage).await
            }
            JobKind::DispatchResults {
                connector,
                result_ids,
            } => dispatch::dispatch_results(self, connector, result_ids).await,
            JobKind::FlushBinary { sha256 } => cleanup::flush_binary(self, sha256).await,
            JobKind::FetchQuery { query, limit } => {
                retrieval::fetch_query(self, query, *limit).await
            }
        }
    }

    /// Timeout salvage: only analysis jobs have anything to rescue. The
    /// buffer swap is atomic, so ids land in exactly one dispatch chunk
    /// even if the cancelled job had just flushed a full batch.
    fn salvage_timeout(&self, job: &JobRecord, salvage: &SalvageBuffer) {
        let JobKind::RunConnector { connector, sha256 } = &job.kind else {
            return;
        };
        tracing::warn!(
            job = %job.id,
            connector = %connector,
            sha256 = %sha256,
            "analysis timed out"
        );

        let leftover = std::mem::take(&mut *salvage.lock().unwrap());
        if leftover.is_empty() {
            return;
        }

        tracing::info!(
            job = %job.id,
            count = leftover.len(),
            "salvaging buffered results from timed-out analysis"
        );
        self.queues.set_meta(&job.id, "salvaged", serde_json::json!(leftover.len()));
        self.queues.enqueue(
            QueueName::ResultDispatch,
            JobKind::DispatchResults {
                connector: connector.clone(),
                result_ids: leftover,
            },
            Enqueue::default(),
        );
    }

    /// Active (pending or running) per-connector analysis job ids, for the
    /// front-end's `pending` listing.
    pub fn active_analyses(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .queued_jobs(QueueName::BinaryAnalysis)
            .into_iter()
            .filter(|j| matches!(j.kind, JobKind::RunConnector { .. }))
            .map(|j| j.id)
            .collect();
        ids.extend(
            self.queues
                .started_jobs(QueueName::BinaryAnalysis)
                .into_iter()
                .map(|j| j.id),
        );
        ids
    }
}
