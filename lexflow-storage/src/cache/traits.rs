//! Cache backend trait
//!
//! Abstracts over cache implementations (Redis, in-memory). Implementations
//! must be thread-safe and support concurrent access; readers may observe a
//! value written by any concurrent writer for the same key.

use crate::cache::Fingerprint;
use async_trait::async_trait;
use lexflow_core::LexflowResult;
use std::time::Duration;

/// Cache backend for JSON payloads with TTL.
///
/// Keys are fingerprints (see [`Fingerprint`]); values are opaque JSON. An
/// expired entry is indistinguishable from a missing one.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a payload, or None on miss or expiry.
    async fn get(&self, key: &Fingerprint) -> LexflowResult<Option<serde_json::Value>>;

    /// Put a payload with the given TTL. Best-effort: callers treat a failed
    /// put as a warning, not an error.
    async fn put(
        &self,
        key: &Fingerprint,
        payload: &serde_json::Value,
        ttl: Duration,
    ) -> LexflowResult<()>;

    /// Delete a payload.
    async fn delete(&self, key: &Fingerprint) -> LexflowResult<()>;

    /// Get cache statistics.
    async fn stats(&self) -> LexflowResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache (approximate for shared backends).
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
