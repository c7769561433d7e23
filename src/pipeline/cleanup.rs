//! Cache cleanup - evict a binary once nothing references it
//!
//! The zero-observing decrementer in the analysis pipeline enqueues this
//! job. The refcount is re-read here: a fresh analysis request can re-seed
//! the counter between the decrement and the flush, in which case the
//! bytes stay put.

use super::Engine;
use crate::model::{binary_count_key, binary_data_key};

pub async fn flush_binary(engine: &Engine, sha256: &str) -> anyhow::Result<()> {
    tracing::debug!(sha256 = %sha256, "flush_binary");

    let count_key = binary_count_key(sha256);
    let refcount = engine.cache.get_count(&count_key).await?.unwrap_or(0);

    if refcount > 0 {
        tracing::info!(sha256 = %sha256, refcount, "binary has references remaining");
        return Ok(());
    }

    tracing::info!(sha256 = %sha256, "flushing binary from cache");
    engine
        .cache
        .delete(&[binary_data_key(sha256), count_key])
        .await?;
    engine.store.set_available(sha256, false)?;

    Ok(())
}
