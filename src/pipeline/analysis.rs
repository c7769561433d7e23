//! Analysis fan-out and the per-connector result pipeline
//!
//! `analyze_binary` seeds the refcount and fans out one `run_connector` job
//! per live connector. Each of those drains its connector's result stream,
//! persisting drafts as they arrive and batching result ids toward the
//! dispatcher in `feed_size` chunks. The refcount must be seeded before any
//! fan-out job is enqueued: a fast-failing analysis would otherwise
//! decrement an uninitialized counter.

use super::{Engine, SalvageBuffer};
use crate::queue::{Enqueue, JobKind, JobRecord, QueueName};
use crate::store::StoreError;
use anyhow::Context;
use futures::StreamExt;

/// Enqueue the binary with the given hash for analysis by all connectors.
pub async fn analyze_binary(engine: &Engine, sha256: &str) -> anyhow::Result<()> {
    tracing::debug!(sha256 = %sha256, "analyzing binary");

    let binary = engine
        .store
        .binary_by_hash(sha256)?
        .with_context(|| format!("no binary row for {}", sha256))?;

    let connectors = engine.registry.connectors();
    engine
        .cache
        .set_count(&binary.count_key(), connectors.len() as i64)
        .await?;

    for connector in connectors {
        tracing::debug!(connector = connector.name(), "running analysis");
        engine.queues.enqueue(
            QueueName::BinaryAnalysis,
            JobKind::RunConnector {
                connector: connector.name().to_string(),
                sha256: sha256.to_string(),
            },
            Enqueue {
                timeout: engine.config.binary_timeout(),
                ..Default::default()
            },
        );
    }

    Ok(())
}

/// Run one connector over one cached binary.
///
/// Results are persisted as the stream yields them; with a configured sink
/// their ids accumulate in the job's salvage buffer and leave as dispatch
/// chunks of `feed_size` (plus one leftover chunk after the drain). Without
/// a sink the stream is still drained for its side effects.
///
/// The refcount decrement comes last; the decrementer that observes zero
/// enqueues the cache flush.
pub async fn run_connector(
    engine: &Engine,
    job: &JobRecord,
    connector_name: &str,
    sha256: &str,
    salvage: &SalvageBuffer,
) -> anyhow::Result<()> {
    let connector = engine
        .registry
        .get(connector_name)
        .with_context(|| format!("no such connector: {}", connector_name))?;

    engine
        .queues
        .set_meta(&job.id, "conn", serde_json::json!(connector_name));

    let binary = engine
        .store
        .binary_by_hash(sha256)?
        .with_context(|| format!("no binary row for {}", sha256))?;

    let data = engine
        .cache
        .get_data(&binary.data_key())
        .await?
        .with_context(|| format!("bytes for {} missing from cache", sha256))?;

    let has_sink = engine.config.sinks.contains_key(connector_name);
    let feed_size = engine.config.feed_size.max(1);

    let mut stream = connector.analyze(&binary, data);
    while let Some(draft) = stream.next().await {
        // A connector runtime error fails the job here; ids already
        // buffered are intentionally not salvaged on this path.
        let draft = draft.with_context(|| format!("{} analysis failed", connector_name))?;

        let result = match engine
            .store
            .create_result(sha256, connector_name, &job.id, &draft)
        {
            Ok(result) => result,
            Err(StoreError::Conflict(key)) => {
                // Another job already produced this (hash, connector,
                // analysis) row - a concurrent request for the same hash.
                // The earlier writer owns dispatch.
                tracing::warn!(duplicate = %key, "skipping duplicate analysis result");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if has_sink {
            let full_batch = {
                let mut buffer = salvage.lock().unwrap();
                buffer.push(result.id);
                if buffer.len() >= feed_size {
                    Some(std::mem::take(&mut *buffer))
                } else {
                    None
                }
            };
            if let Some(result_ids) = full_batch {
                enqueue_dispatch(engine, connector_name, result_ids);
            }
        }
    }

    if has_sink {
        let leftover = std::mem::take(&mut *salvage.lock().unwrap());
        if !leftover.is_empty() {
            enqueue_dispatch(engine, connector_name, leftover);
        }
    }

    let refcount = engine.cache.decr(&binary.count_key()).await?;
    if refcount == 0 {
        engine.queues.enqueue(
            QueueName::BinaryCleanup,
            JobKind::FlushBinary {
                sha256: sha256.to_string(),
            },
            Enqueue::default(),
        );
    } else if refcount < 0 {
        tracing::error!(
            sha256 = %sha256,
            refcount,
            "refcount went negative; leaving cache untouched"
        );
    }

    Ok(())
}

fn enqueue_dispatch(engine: &Engine, connector_name: &str, result_ids: Vec<i64>) {
    tracing::debug!(
        connector = connector_name,
        count = result_ids.len(),
        "enqueueing dispatch chunk"
    );
    engine.queues.enqueue(
        QueueName::ResultDispatch,
        JobKind::DispatchResults {
            connector: connector_name.to_string(),
            result_ids,
        },
        Enqueue::default(),
    );
}
