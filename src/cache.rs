//! Binary cache - blob storage plus per-hash refcounts
//!
//! The cache holds two keys per binary: the downloaded bytes at
//! `/binaries/<sha256>` and an integer refcount at
//! `/binaries/<sha256>/refcount`. The refcount is the number of outstanding
//! analysis jobs still needing the bytes; the atomic `decr` is the only
//! cross-worker synchronization point - exactly one decrementer observes
//! zero and enqueues the flush.
//!
//! `RedisCache` is the production backend (DECR is atomic on the server).
//! `MemoryCache` backs tests and development runs without a Redis.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait BinaryCache: Send + Sync {
    async fn set_data(&self, key: &str, data: Bytes) -> anyhow::Result<()>;
    async fn get_data(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    async fn set_count(&self, key: &str, count: i64) -> anyhow::Result<()>;
    async fn get_count(&self, key: &str) -> anyhow::Result<Option<i64>>;

    /// Atomically increment, returning the new value. A missing key counts
    /// as zero, matching Redis INCR.
    async fn incr(&self, key: &str) -> anyhow::Result<i64>;

    /// Atomically decrement, returning the new value. A missing key counts
    /// as zero, matching Redis DECR.
    async fn decr(&self, key: &str) -> anyhow::Result<i64>;

    async fn delete(&self, keys: &[String]) -> anyhow::Result<()>;
}

// ── Redis ────────────────────────────────────────────────────────────────

/// Redis-backed cache over an async connection manager (reconnects are
/// handled internally; clones share the multiplexed connection).
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!(url, "connected to binary cache");
        Ok(Self { manager })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl BinaryCache for RedisCache {
    async fn set_data(&self, key: &str, data: Bytes) -> anyhow::Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(data.as_ref())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_data(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let mut conn = self.conn();
        let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(data.map(Bytes::from))
    }

    async fn set_count(&self, key: &str, count: i64) -> anyhow::Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(count)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_count(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let mut conn = self.conn();
        let count: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> anyhow::Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("DECR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Entry {
    Data(Bytes),
    Count(i64),
}

/// Mutex-guarded map with Redis-compatible counter semantics. The single
/// lock makes incr/decr atomic, which is all the refcount protocol needs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored keys, for assertions in tests.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BinaryCache for MemoryCache {
    async fn set_data(&self, key: &str, data: Bytes) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Entry::Data(data));
        Ok(())
    }

    async fn get_data(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(match self.entries.lock().unwrap().get(key) {
            Some(Entry::Data(data)) => Some(data.clone()),
            _ => None,
        })
    }

    async fn set_count(&self, key: &str, count: i64) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Entry::Count(count));
        Ok(())
    }

    async fn get_count(&self, key: &str) -> anyhow::Result<Option<i64>> {
        Ok(match self.entries.lock().unwrap().get(key) {
            Some(Entry::Count(count)) => Some(*count),
            _ => None,
        })
    }

    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.to_string())
            .or_insert(Entry::Count(0));
        match entry {
            Entry::Count(count) => {
                *count += 1;
                Ok(*count)
            }
            Entry::Data(_) => anyhow::bail!("INCR on non-integer key {key}"),
        }
    }

    async fn decr(&self, key: &str) -> anyhow::Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.to_string())
            .or_insert(Entry::Count(0));
        match entry {
            Entry::Count(count) => {
                *count -= 1;
                Ok(*count)
            }
            Entry::Data(_) => anyhow::bail!("DECR on non-integer key {key}"),
        }
    }

    async fn delete(&self, keys: &[String]) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_round_trip() {
        let cache = MemoryCache::new();
        cache
            .set_data("/binaries/abc", Bytes::from_static(b"MZ\x90\x00"))
            .await
            .unwrap();
        let data = cache.get_data("/binaries/abc").await.unwrap().unwrap();
        assert_eq!(&data[..2], b"MZ");
        assert!(cache.get_data("/binaries/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counter_semantics() {
        let cache = MemoryCache::new();
        cache.set_count("refs", 3).await.unwrap();
        assert_eq!(cache.decr("refs").await.unwrap(), 2);
        assert_eq!(cache.decr("refs").await.unwrap(), 1);
        assert_eq!(cache.decr("refs").await.unwrap(), 0);
        // Over-decrement is representable; the caller logs the anomaly
        assert_eq!(cache.decr("refs").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_decr_missing_key_counts_from_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.decr("never-set").await.unwrap(), -1);
        assert_eq!(cache.incr("also-never-set").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_both_keys() {
        let cache = MemoryCache::new();
        cache
            .set_data("/binaries/x", Bytes::from_static(b"data"))
            .await
            .unwrap();
        cache.set_count("/binaries/x/refcount", 2).await.unwrap();
        cache
            .delete(&[
                "/binaries/x".to_string(),
                "/binaries/x/refcount".to_string(),
            ])
            .await
            .unwrap();
        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_decr_exactly_one_zero_observer() {
        use std::sync::Arc;

        let cache = Arc::new(MemoryCache::new());
        cache.set_count("refs", 8).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.decr("refs").await.unwrap() },
            ));
        }

        let mut zeros = 0;
        for handle in handles {
            if handle.await.unwrap() == 0 {
                zeros += 1;
            }
        }
        assert_eq!(zeros, 1);
    }
}
