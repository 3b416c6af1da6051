//! # tagcache
//!
//! A Redis-backed tagged cache engine.
//!
//! ## Features
//!
//! - **Tagged invalidation**: attach string tags to cache entries and flush
//!   many entries at once without enumerating their keys
//! - **Two tagging modes**: `all` (intersection: reads are scoped to the
//!   exact tag set, flush removes entries carrying all given tags) and
//!   `any` (union: tags are write/flush metadata, flush removes entries
//!   carrying any given tag)
//! - **Cluster-aware**: every multi-key protocol has a standalone path
//!   (pipelines, single Lua scripts) and a cluster path (sequential,
//!   slot-local commands)
//! - **Lazy pruning**: stale tag references left behind by expiry or flush
//!   are reconciled by a background sweep
//! - **Async-first**: built on tokio and the async `redis` driver
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tagcache::{CacheConfig, RedisStore, Store};
//! use std::time::Duration;
//!
//! # async fn demo() -> tagcache::CacheResult<()> {
//! let store = RedisStore::connect(CacheConfig::default()).await?;
//!
//! // Plain key/value
//! store.put("greet", b"\"hello\"", Duration::from_secs(60)).await?;
//!
//! // Tagged writes; flushing "featured" later removes p1 in `any` mode
//! let tagged = store.tags(&["posts", "featured"]);
//! tagged.put("p1", &"X", Duration::from_secs(60)).await?;
//! tagged.flush().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod bench;
pub mod config;
pub mod context;
pub mod doctor;
pub mod events;
pub mod prune;
pub mod scan;
pub mod scripts;
pub mod serialize;
pub mod store;
pub mod tagged;
pub mod tags;

pub use bench::{BenchConfig, BenchReport, Benchmark};
pub use config::{CacheConfig, FlushMode, RedisConfig, TagMode};
pub use context::StoreContext;
pub use doctor::{Doctor, DoctorReport};
pub use events::{CacheEvent, CacheStats, EventSink, MemorySink, NullSink, StatsSink, TracingSink};
pub use prune::{AllPruneReport, AnyPruneReport, PruneReport, Pruner};
pub use store::RedisStore;
pub use tagged::TaggedCache;
pub use tags::{TagOps, TagSet};

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// The connection pool could not serve a connection.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The server lacks a command this engine requires (e.g. `HSETEX` on
    /// Redis < 8.0 / Valkey < 9.0). Only meaningful for `any` mode.
    #[error("unsupported server command: {command} ({detail})")]
    UnsupportedCommand { command: String, detail: String },

    /// A cluster deployment received a multi-key command whose keys hashed
    /// to distinct slots. Always an engine bug: the cluster paths should
    /// have serialized the sequence.
    #[error("cross-slot command reached the cluster; this is a bug in the engine's cluster path: {0}")]
    ClusterCrossSlot(String),

    /// A read through `any`-mode tags was attempted; tags are for writing
    /// and flushing only in that mode.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Value could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// Benchmark harness only: resident memory crossed the configured
    /// percentage and the run was aborted.
    #[error("memory pressure: resident set at {used_percent:.1}% exceeds limit of {limit_percent:.1}%")]
    MemoryPressure {
        used_percent: f64,
        limit_percent: f64,
    },

    /// Cache configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecognised driver error, rethrown unchanged.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl CacheError {
    /// Translate recognised driver error patterns into typed errors;
    /// anything unrecognised passes through as [`CacheError::Redis`].
    pub fn from_redis(err: redis::RedisError) -> Self {
        let text = err.to_string().to_lowercase();
        if text.contains("unknown command")
            || text.contains("err unknown")
            || text.contains("command not found")
            || text.contains("unknown redis command")
        {
            return CacheError::UnsupportedCommand {
                command: "HSETEX/HEXPIRE".to_string(),
                detail: err.to_string(),
            };
        }
        if text.contains("crossslot") {
            return CacheError::ClusterCrossSlot(err.to_string());
        }
        CacheError::Redis(err)
    }

    /// True when retrying on another connection cannot help.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            CacheError::UnsupportedCommand { .. }
                | CacheError::ClusterCrossSlot(_)
                | CacheError::UnsupportedOperation(_)
        )
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache key type
pub type CacheKey = String;

/// Cache tag name
pub type CacheTag = String;

/// Registry score recorded for entries stored forever (`9999-12-31T23:59:59Z`).
pub const MAX_EXPIRY: i64 = 253_402_300_799;

/// Abstract store interface consumed by external collaborators (the cache
/// repository facade, higher-level wrappers). Values are pre-serialized
/// bytes; see [`serialize`] for the encoding used by the tagged facade.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Get several values in one round trip, position-matched with `keys`.
    async fn many(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// Store a value for `ttl`.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Store several values for a shared `ttl`.
    async fn put_many(&self, entries: &[(&str, Vec<u8>)], ttl: Duration) -> CacheResult<bool>;

    /// Store a value only when the key is absent; `true` iff newly inserted.
    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Store a value with no expiry.
    async fn forever(&self, key: &str, value: &[u8]) -> CacheResult<bool>;

    /// Remove a key; `true` iff a key was actually removed.
    async fn forget(&self, key: &str) -> CacheResult<bool>;

    /// Increment a numeric value, creating it at `by` when absent.
    async fn increment(&self, key: &str, by: i64) -> CacheResult<i64>;

    /// Decrement a numeric value.
    async fn decrement(&self, key: &str, by: i64) -> CacheResult<i64>;

    /// Remove every entry in the store (policy-dependent, see
    /// [`config::FlushMode`]).
    async fn flush(&self) -> CacheResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_err(msg: &str) -> redis::RedisError {
        redis::RedisError::from((redis::ErrorKind::ResponseError, "", msg.to_string()))
    }

    #[test]
    fn test_unknown_command_is_translated() {
        let err = CacheError::from_redis(redis_err("ERR unknown command 'HSETEX'"));
        assert!(matches!(err, CacheError::UnsupportedCommand { .. }));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_crossslot_is_translated() {
        let err = CacheError::from_redis(redis_err(
            "CROSSSLOT Keys in request don't hash to the same slot",
        ));
        assert!(matches!(err, CacheError::ClusterCrossSlot(_)));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let err = CacheError::from_redis(redis_err("OOM command not allowed"));
        assert!(matches!(err, CacheError::Redis(_)));
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn test_max_expiry_is_year_9999() {
        assert_eq!(MAX_EXPIRY, 253_402_300_799);
    }
}
