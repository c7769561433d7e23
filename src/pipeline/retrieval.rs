//! Retrieval pipeline - from hashes to cached bytes
//!
//! Binary retrieval happens in two stages: the UBS resolves which hashes it
//! can serve (returning time-limited URLs), then each found binary is
//! downloaded and cached, with the analysis fan-out chained behind the
//! download via `depends_on`.

use super::Engine;
use crate::model::binary_data_key;
use crate::queue::{Enqueue, JobKind, JobRecord, QueueName};
use crate::ubs::DownloadError;

/// Saved-query matches are retrieved in chunks of this many hashes, so one
/// giant query cannot monopolize a retrieval worker.
const QUERY_CHUNK: usize = 10;

/// Attempt to retrieve and analyze each of the given hashes.
pub async fn fetch_binaries(engine: &Engine, hashes: &[String]) -> anyhow::Result<()> {
    tracing::debug!(count = hashes.len(), "fetch_binaries");
    let hashes = engine.store.filter_unavailable(hashes)?;

    if hashes.is_empty() {
        tracing::info!("no hashes that aren't already available");
        return Ok(());
    }

    let resolved = engine.ubs.resolve(&hashes).await;

    for found in &resolved.found {
        let download = engine.queues.enqueue(
            QueueName::BinaryRetrieval,
            JobKind::DownloadBinary {
                sha256: found.sha256.clone(),
                url: found.url.clone(),
                retry: engine.config.binary_fetch_max_retry,
            },
            Enqueue::default(),
        );
        engine.queues.enqueue(
            QueueName::BinaryAnalysis,
            JobKind::AnalyzeBinary {
                sha256: found.sha256.clone(),
            },
            Enqueue {
                depends_on: Some(download),
                ..Default::default()
            },
        );
    }

    if !resolved.error.is_empty() {
        tracing::info!(
            "retrying retrieval of {}/{} binaries",
            resolved.error.len(),
            hashes.len()
        );
        engine.queues.enqueue(
            QueueName::BinaryRetrieval,
            JobKind::FetchBinaries {
                hashes: resolved.error.clone(),
            },
            Enqueue::default(),
        );
    }

    if !resolved.not_found.is_empty() {
        tracing::warn!(
            "no binaries found for hashes: {}",
            resolved.not_found.join(",")
        );
    }

    Ok(())
}

/// Download one binary from its UBS-supplied URL into the cache.
///
/// A 404 usually means the pre-signed URL expired before a worker got to
/// it; with retries remaining the download is re-enqueued and the chained
/// analysis job transfers to the retry. Any other failure fails the job,
/// cancelling the dependent analysis.
pub async fn download_binary(
    engine: &Engine,
    job: &JobRecord,
    sha256: &str,
    url: &str,
    retry: u32,
) -> anyhow::Result<()> {
    tracing::info!(sha256 = %sha256, "downloading binary from {}", url);

    let data = match engine.ubs.download(url).await {
        Ok(data) => data,
        Err(DownloadError::NotFound) if retry > 0 => {
            tracing::warn!(
                sha256 = %sha256,
                retries_left = retry - 1,
                "download URL 404ed, retrying"
            );
            engine.queues.requeue_with_dependents(
                &job.id,
                JobKind::DownloadBinary {
                    sha256: sha256.to_string(),
                    url: url.to_string(),
                    retry: retry - 1,
                },
            );
            return Ok(());
        }
        Err(DownloadError::NotFound) => {
            anyhow::bail!("download of {} failed: retries exhausted", sha256);
        }
        Err(DownloadError::Other(e)) => {
            return Err(e.context(format!("download failed for {}", sha256)));
        }
    };

    engine
        .cache
        .set_data(&binary_data_key(sha256), data)
        .await?;
    engine.store.upsert_binary(sha256, true)?;

    Ok(())
}

/// Run a saved process-search query and enqueue retrieval of the matches.
///
/// Scheduled jobs run unattended; errors are logged and swallowed so a bad
/// query or an unreachable backend never crashes the retrieval queue.
pub async fn fetch_query(
    engine: &Engine,
    query: &str,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    tracing::debug!(query = %query, ?limit, "fetch_query");

    let hashes = match engine.ubs.search(query, limit).await {
        Ok(hashes) => hashes,
        Err(e) => {
            tracing::error!(query = %query, "process search failed: {:#}", e);
            return Ok(());
        }
    };

    tracing::info!(query = %query, count = hashes.len(), "query matched binaries");
    for chunk in hashes.chunks(QUERY_CHUNK) {
        engine.queues.enqueue(
            QueueName::BinaryRetrieval,
            JobKind::FetchBinaries {
                hashes: chunk.to_vec(),
            },
            Enqueue::default(),
        );
    }

    Ok(())
}
