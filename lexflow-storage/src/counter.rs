//! Sliding-window rate-limit counter
//!
//! One ordered timestamp set per credential. Charging a request is a single
//! atomic prune-count-append: entries older than the window are dropped, the
//! remainder counted against the quota, and the current timestamp appended
//! only when the request is admitted. The set's expiry is window + 60s so
//! idle credentials cost nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lexflow_core::{BackendError, LexflowError, LexflowResult};
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

/// Outcome of charging one request against a credential's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// The quota the decision was made against
    pub limit: u32,
    /// Entries in the window, including this request when admitted
    pub used: u32,
    /// Requests still available in the window
    pub remaining: u32,
    /// Epoch seconds when the oldest entry falls out of the window
    pub reset_epoch: i64,
    /// Seconds to wait before retrying; meaningful when denied
    pub retry_after_secs: i64,
}

/// Atomic sliding-window charging against a shared counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Charge one request. `key` is the per-credential counter key.
    async fn charge(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        quota: u32,
    ) -> LexflowResult<WindowDecision>;
}

fn build_decision(
    allowed: bool,
    quota: u32,
    used: u32,
    oldest_ms: i64,
    now_ms: i64,
    window_ms: i64,
) -> WindowDecision {
    let reset_ms = oldest_ms + window_ms;
    WindowDecision {
        allowed,
        limit: quota,
        used,
        remaining: quota.saturating_sub(used),
        reset_epoch: reset_ms / 1000,
        retry_after_secs: ((reset_ms - now_ms) / 1000).max(1),
    }
}

// ============================================================================
// MEMORY COUNTER
// ============================================================================

/// Process-local counter for tests and single-node deployments.
///
/// Per-key exclusivity comes from the map's shard locking: `entry()` holds
/// the shard lock for the whole prune-count-append sequence.
pub struct MemoryCounter {
    windows: DashMap<String, Vec<i64>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }
}

impl Default for MemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounter {
    async fn charge(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        quota: u32,
    ) -> LexflowResult<WindowDecision> {
        let now_ms = now.timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let cutoff = now_ms - window_ms;

        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|&ts| ts > cutoff);

        let count = entry.len() as u32;
        if count >= quota {
            let oldest = entry.first().copied().unwrap_or(now_ms);
            return Ok(build_decision(false, quota, count, oldest, now_ms, window_ms));
        }

        entry.push(now_ms);
        let oldest = entry.first().copied().unwrap_or(now_ms);
        Ok(build_decision(
            true,
            quota,
            count + 1,
            oldest,
            now_ms,
            window_ms,
        ))
    }
}

// ============================================================================
// REDIS COUNTER
// ============================================================================

const CHARGE_SCRIPT: &str = r#"
local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
    local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    return {0, count, oldest[2] or ARGV[1]}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {1, count + 1, oldest[2] or ARGV[1]}
"#;

fn counter_err(e: impl std::fmt::Display) -> LexflowError {
    LexflowError::Backend(BackendError::CounterUnavailable {
        reason: e.to_string(),
    })
}

/// Redis sorted-set counter shared by all gate instances.
///
/// The prune-count-append sequence runs as a single server-side script, so
/// concurrent requests for the same credential serialize on the Redis key.
pub struct RedisCounter {
    conn: ConnectionManager,
    script: Script,
}

impl RedisCounter {
    pub async fn connect(url: &str) -> LexflowResult<Self> {
        let client = redis::Client::open(url).map_err(counter_err)?;
        let conn = ConnectionManager::new(client).await.map_err(counter_err)?;
        Ok(Self {
            conn,
            script: Script::new(CHARGE_SCRIPT),
        })
    }

    fn counter_key(key: &str) -> String {
        format!("lexflow:ratelimit:{}", key)
    }
}

#[async_trait]
impl CounterStore for RedisCounter {
    async fn charge(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        quota: u32,
    ) -> LexflowResult<WindowDecision> {
        let now_ms = now.timestamp_millis();
        let window_ms = window.as_millis() as i64;
        // Unique member so two requests in the same millisecond both count
        let member = format!("{}-{}", now_ms, uuid::Uuid::now_v7());
        let expiry_secs = window.as_secs() + 60;

        let mut conn = self.conn.clone();
        let (allowed, used, oldest_ms): (i64, i64, i64) = self
            .script
            .key(Self::counter_key(key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(quota as i64)
            .arg(member)
            .arg(expiry_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(counter_err)?;

        Ok(build_decision(
            allowed == 1,
            quota,
            used as u32,
            oldest_ms,
            now_ms,
            window_ms,
        ))
    }
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter").finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// The count of admitted requests inside any window never exceeds
        /// the quota.
        #[test]
        fn prop_window_never_exceeds_quota(
            quota in 1u32..20,
            offsets_secs in proptest::collection::vec(0i64..7200, 1..60),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let counter = MemoryCounter::new();
                let base = Utc::now();
                let mut offsets = offsets_secs.clone();
                offsets.sort_unstable();

                let mut admitted: Vec<i64> = Vec::new();
                for offset in offsets {
                    let now = base + chrono::Duration::seconds(offset);
                    let decision = counter
                        .charge("prop", now, Duration::from_secs(3600), quota)
                        .await
                        .unwrap();
                    if decision.allowed {
                        admitted.push(offset);
                    }
                    // Invariant: admitted timestamps within (offset-3600, offset]
                    let in_window = admitted
                        .iter()
                        .filter(|&&t| t > offset - 3600 && t <= offset)
                        .count();
                    prop_assert!(in_window as u32 <= quota);
                }
                Ok(())
            })?;
        }
    }
}
