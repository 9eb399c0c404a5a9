//! Redis cache backend
//!
//! Payloads are stored as JSON strings under namespaced keys with `SET .. EX`.
//! TTL enforcement is entirely Redis-side; hit/miss counters are process-local.

use crate::cache::{CacheBackend, CacheStats, Fingerprint};
use async_trait::async_trait;
use lexflow_core::{BackendError, LexflowError, LexflowResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn cache_err(e: impl std::fmt::Display) -> LexflowError {
    LexflowError::Backend(BackendError::CacheUnavailable {
        reason: e.to_string(),
    })
}

/// Redis-backed cache shared by all engine instances.
pub struct RedisCache {
    conn: ConnectionManager,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    /// Connect to Redis. The connection manager reconnects transparently on
    /// broken connections.
    pub async fn connect(url: &str) -> LexflowResult<Self> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_err)?;
        Ok(Self {
            conn,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &Fingerprint) -> LexflowResult<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key.storage_key()).await.map_err(cache_err)?;

        match raw {
            Some(json) => {
                let payload = serde_json::from_str(&json).map_err(cache_err)?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(payload))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &Fingerprint,
        payload: &serde_json::Value,
        ttl: Duration,
    ) -> LexflowResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(payload).map_err(cache_err)?;
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key.storage_key(), json, ttl_secs)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> LexflowResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key.storage_key()).await.map_err(cache_err)?;
        Ok(())
    }

    async fn stats(&self) -> LexflowResult<CacheStats> {
        let mut conn = self.conn.clone();
        let entry_count: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .unwrap_or(0);

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
        })
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}
