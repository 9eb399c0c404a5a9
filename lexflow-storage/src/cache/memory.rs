//! In-memory cache backend
//!
//! Used by tests and single-node deployments. Expiry is lazy: entries are
//! checked on read and swept opportunistically on write.

use crate::cache::{CacheBackend, CacheStats, Fingerprint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lexflow_core::LexflowResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct Entry {
    payload: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Process-local cache over a concurrent map.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &Fingerprint) -> LexflowResult<Option<serde_json::Value>> {
        let storage_key = key.storage_key();
        let now = Utc::now();

        if let Some(entry) = self.entries.get(&storage_key) {
            if entry.expires_at > now {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.payload.clone()));
            }
        }
        // Expired entries are removed on the next write sweep
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(
        &self,
        key: &Fingerprint,
        payload: &serde_json::Value,
        ttl: Duration,
    ) -> LexflowResult<()> {
        self.sweep_expired();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.entries.insert(
            key.storage_key(),
            Entry {
                payload: payload.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> LexflowResult<()> {
        self.entries.remove(&key.storage_key());
        Ok(())
    }

    async fn stats(&self) -> LexflowResult<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::{IntentTag, QueryContext};

    fn fingerprint(intent: IntentTag) -> Fingerprint {
        let context = QueryContext {
            intent,
            intent_confidence: 0.9,
            complexity: 0.1,
            entities: Vec::new(),
            concepts: Vec::new(),
            norm_references: Vec::new(),
            temporal_hints: Vec::new(),
        };
        Fingerprint::for_enrichment(&context, None)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = MemoryCache::new();
        let key = fingerprint(IntentTag::NormSearch);
        let payload = serde_json::json!({"norms": ["art. 1321 c.c."]});

        cache
            .put(&key, &payload, Duration::from_secs(60))
            .await
            .unwrap();
        let fetched = cache.get(&key).await.unwrap();
        assert_eq!(fetched, Some(payload));
    }

    #[tokio::test]
    async fn test_miss_on_absent_key() {
        let cache = MemoryCache::new();
        let key = fingerprint(IntentTag::Interpretation);
        assert_eq!(cache.get(&key).await.unwrap(), None);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new();
        let key = fingerprint(IntentTag::NormSearch);
        let payload = serde_json::json!({"norms": []});

        cache
            .put(&key, &payload, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let cache = MemoryCache::new();
        let key = fingerprint(IntentTag::NormSearch);

        cache
            .put(&key, &serde_json::json!({"v": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .put(&key, &serde_json::json!({"v": 2}), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            cache.get(&key).await.unwrap(),
            Some(serde_json::json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn test_idempotent_reads_within_ttl() {
        let cache = MemoryCache::new();
        let key = fingerprint(IntentTag::NormSearch);
        let payload = serde_json::json!({"norms": ["art. 1321 c.c."], "doctrine": []});

        cache
            .put(&key, &payload, Duration::from_secs(60))
            .await
            .unwrap();
        let first = cache.get(&key).await.unwrap().unwrap();
        let second = cache.get(&key).await.unwrap().unwrap();
        // Byte-equal payloads for a stable fingerprint within TTL
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
