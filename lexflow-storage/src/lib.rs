//! Lexflow Storage - Cache, Durable Store, Counter
//!
//! Three external-state boundaries behind pluggable traits:
//! - `CacheBackend`: JSON payloads keyed by enrichment fingerprint, with TTL
//! - `DurableStore`: the eight persisted record types
//! - `CounterStore`: atomic sliding-window quota charging
//!
//! Each has a production backend (Redis / Postgres / Redis) and an in-memory
//! backend used by tests and single-node deployments.

pub mod cache;
pub mod counter;
pub mod durable;

pub use cache::{CacheBackend, CacheStats, Fingerprint, MemoryCache, RedisCache};
pub use counter::{CounterStore, MemoryCounter, RedisCounter, WindowDecision};
pub use durable::{DurableStore, MemoryStore, PgConfig, PgStore, StoreStats};
