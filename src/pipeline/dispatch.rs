//! Dispatch - deliver batched results to their connector's sink
//!
//! Every id in a dispatch job belongs to the same connector (the batcher
//! maintains that), so one lookup gives the sink for the whole chunk.
//! Delivery is at-least-once: a sink failure fails the job and leaves the
//! rows undispatched, and the `dispatched` flag keeps retries from
//! double-appending.

use super::Engine;
use crate::config::SinkKind;
use crate::sink::Report;

pub async fn dispatch_results(
    engine: &Engine,
    connector_name: &str,
    result_ids: &[i64],
) -> anyhow::Result<()> {
    let results = engine.store.results_by_ids(result_ids)?;
    let undispatched: Vec<_> = results.into_iter().filter(|r| !r.dispatched).collect();

    if undispatched.is_empty() {
        tracing::debug!(connector = connector_name, "nothing left to dispatch");
        return Ok(());
    }

    let Some(sink) = engine.config.sinks.get(connector_name) else {
        tracing::warn!(
            connector = connector_name,
            "dispatch job for a connector with no configured sink"
        );
        return Ok(());
    };

    match sink.kind {
        SinkKind::Feed => {
            let reports: Vec<Report> = undispatched.iter().map(Report::from_result).collect();
            engine.sink.append_reports(&sink.id, &reports).await?;
        }
        SinkKind::Watchlist => {
            // Reserved: watchlist delivery is not implemented. Rows stay
            // undispatched.
            tracing::warn!(
                connector = connector_name,
                watchlist = %sink.id,
                "watchlist dispatch is not implemented"
            );
            return Ok(());
        }
    }

    let ids: Vec<i64> = undispatched.iter().map(|r| r.id).collect();
    engine.store.mark_dispatched(&ids)?;
    tracing::debug!(
        connector = connector_name,
        count = ids.len(),
        "results dispatched"
    );

    Ok(())
}
