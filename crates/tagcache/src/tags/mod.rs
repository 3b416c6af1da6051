//! Tagged operation containers
//!
//! The two tagging modes are a closed set, so dispatch is a tagged enum
//! rather than a trait hierarchy: [`TagOps::All`] carries the
//! intersection semantics (sorted-set references, namespaced entries),
//! [`TagOps::Any`] the union semantics (tag hashes, reverse indexes, the
//! registry). The [`crate::TaggedCache`] facade routes every call through
//! here.

pub mod all;
pub mod any;
mod set;

pub use all::IntersectionTagOps;
pub use any::UnionTagOps;
pub use set::TagSet;

use crate::config::TagMode;
use crate::context::StoreContext;
use crate::prune::PruneReport;
use crate::CacheResult;
use std::sync::Arc;
use std::time::Duration;

/// Mode-dispatching container for tagged operations. Values arriving here
/// are already serialized (see [`crate::serialize`]).
pub enum TagOps {
    All(IntersectionTagOps),
    Any(UnionTagOps),
}

impl TagOps {
    /// Select the container for the context's configured mode.
    pub fn for_context(context: Arc<StoreContext>) -> Self {
        match context.config().mode {
            TagMode::All => TagOps::All(IntersectionTagOps::new(context)),
            TagMode::Any => TagOps::Any(UnionTagOps::new(context)),
        }
    }

    pub fn mode(&self) -> TagMode {
        match self {
            TagOps::All(_) => TagMode::All,
            TagOps::Any(_) => TagMode::Any,
        }
    }

    /// Tagged write; `ttl = None` stores forever.
    pub async fn put(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        match self {
            TagOps::All(ops) => ops.put(set, key, value, ttl).await,
            TagOps::Any(ops) => ops.put(set, key, value, ttl).await,
        }
    }

    /// Tagged insert-if-absent; `true` iff newly inserted.
    pub async fn add(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        match self {
            TagOps::All(ops) => ops.add(set, key, value, ttl).await,
            TagOps::Any(ops) => ops.add(set, key, value, ttl).await,
        }
    }

    /// Tagged bulk write sharing one TTL.
    pub async fn put_many(
        &self,
        set: &TagSet,
        entries: &[(&str, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        match self {
            TagOps::All(ops) => ops.put_many(set, entries, ttl).await,
            TagOps::Any(ops) => ops.put_many(set, entries, ttl).await,
        }
    }

    /// Tagged counter update; negative `by` decrements.
    pub async fn increment(&self, set: &TagSet, key: &str, by: i64) -> CacheResult<i64> {
        match self {
            TagOps::All(ops) => ops.increment(set, key, by).await,
            TagOps::Any(ops) => ops.increment(set, key, by).await,
        }
    }

    /// Remove every entry referenced by the set, with mode semantics:
    /// intersection in `all`, union in `any`.
    pub async fn flush(&self, set: &TagSet) -> CacheResult<()> {
        match self {
            TagOps::All(ops) => ops.flush(set).await,
            TagOps::Any(ops) => ops.flush(set).await,
        }
    }

    /// Deduplicated union of cache keys across the set's tags.
    pub async fn entries(&self, set: &TagSet) -> CacheResult<Vec<String>> {
        match self {
            TagOps::All(ops) => ops.entries(set).await,
            TagOps::Any(ops) => ops.entries(set).await,
        }
    }

    /// Drop expired references from the set's own tag structures. A no-op
    /// in `any` mode, where field TTLs expire references server-side.
    pub async fn flush_stale(&self, set: &TagSet) -> CacheResult<u64> {
        match self {
            TagOps::All(ops) => ops.flush_stale(set).await,
            TagOps::Any(_) => Ok(0),
        }
    }

    /// Full keyspace sweep reconciling orphan references; see
    /// [`crate::prune`].
    pub async fn prune(&self) -> CacheResult<PruneReport> {
        match self {
            TagOps::All(ops) => ops.prune().await,
            TagOps::Any(ops) => ops.prune().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn test_container_follows_configured_mode() {
        let all_ctx = StoreContext::new(
            CacheConfig::builder().mode(TagMode::All).build(),
        )
        .unwrap();
        assert_eq!(TagOps::for_context(Arc::new(all_ctx)).mode(), TagMode::All);

        let any_ctx = StoreContext::new(
            CacheConfig::builder().mode(TagMode::Any).build(),
        )
        .unwrap();
        assert_eq!(TagOps::for_context(Arc::new(any_ctx)).mode(), TagMode::Any);
    }
}
