//! Cache boundary
//!
//! Enrichment payloads are cached under deterministic fingerprints with
//! per-freshness-class TTLs. Puts are best-effort; concurrent misses on the
//! same fingerprint may both compute and write, and the last writer wins
//! (enrichment is idempotent).

mod fingerprint;
mod memory;
mod redis_backend;
mod traits;

pub use fingerprint::Fingerprint;
pub use memory::MemoryCache;
pub use redis_backend::RedisCache;
pub use traits::{CacheBackend, CacheStats};
