//! Untagged store operations
//!
//! Each operation maps to a single Redis command (or one Lua script) with
//! a standalone and a cluster branch where multiple keys are involved.
//! The cluster branch issues sequential commands, because multi-key
//! commands and pipelines cannot span hash slots.

use crate::config::{FlushMode, TagMode};
use crate::context::StoreContext;
use crate::events::{EventSink, TracingSink};
use crate::tagged::TaggedCache;
use crate::tags::TagSet;
use crate::{scripts, CacheConfig, CacheResult, Store};
use async_trait::async_trait;
use redis::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keys deleted per variadic `DEL`/`UNLINK` during bulk cleanup.
pub(crate) const DELETE_CHUNK: usize = 1000;

/// TTLs are expressed in whole seconds and never reach the server as zero.
pub(crate) fn clamp_ttl(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis-backed store: untagged operations plus entry to the tagged API.
pub struct RedisStore {
    context: Arc<StoreContext>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the configured deployment and probe it.
    pub async fn connect(config: CacheConfig) -> CacheResult<Self> {
        let context = Arc::new(StoreContext::connect(config).await?);
        Ok(Self {
            context,
            events: Arc::new(TracingSink),
        })
    }

    /// Replace the event sink observable by tagged operations.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn context(&self) -> Arc<StoreContext> {
        Arc::clone(&self.context)
    }

    pub fn mode(&self) -> TagMode {
        self.context.config().mode
    }

    /// A tagged view over this store. The tagging mode comes from the
    /// store configuration.
    pub fn tags(&self, names: &[&str]) -> TaggedCache {
        let set = TagSet::new(Arc::clone(&self.context), names);
        TaggedCache::new(Arc::clone(&self.context), set, Arc::clone(&self.events))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let wire = self.context.entry_key(key);
        self.context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("GET").arg(&wire).query_async(&mut conn).await;
                (result, conn)
            })
            .await
    }

    async fn many(&self, keys: &[&str]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let wires: Vec<String> = keys.iter().map(|k| self.context.entry_key(k)).collect();
        let cluster = self.context.is_cluster();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
                        // MGET requires all keys in one slot; walk them.
                        let mut values = Vec::with_capacity(wires.len());
                        for wire in &wires {
                            let value: Option<Vec<u8>> =
                                redis::cmd("GET").arg(wire).query_async(&mut conn).await?;
                            values.push(value);
                        }
                        Ok(values)
                    } else {
                        redis::cmd("MGET").arg(&wires).query_async(&mut conn).await
                    }
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let wire = self.context.entry_key(key);
        let secs = clamp_ttl(ttl);
        let value = value.to_vec();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    redis::cmd("SETEX")
                        .arg(&wire)
                        .arg(secs)
                        .arg(&value)
                        .query_async::<()>(&mut conn)
                        .await?;
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn put_many(&self, entries: &[(&str, Vec<u8>)], ttl: Duration) -> CacheResult<bool> {
        if entries.is_empty() {
            return Ok(true);
        }
        let secs = clamp_ttl(ttl);
        let wired: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(k, v)| (self.context.entry_key(k), v.clone()))
            .collect();
        let cluster = self.context.is_cluster();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
                        for (wire, value) in &wired {
                            redis::cmd("SETEX")
                                .arg(wire)
                                .arg(secs)
                                .arg(value)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                    } else {
                        let mut pipe = redis::pipe();
                        for (wire, value) in &wired {
                            pipe.cmd("SETEX").arg(wire).arg(secs).arg(value).ignore();
                        }
                        pipe.query_async::<()>(&mut conn).await?;
                    }
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let wire = self.context.entry_key(key);
        let secs = clamp_ttl(ttl);
        let value = value.to_vec();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let reply: Value = redis::Script::new(scripts::ADD)
                        .key(&wire)
                        .arg(&value)
                        .arg(secs)
                        .invoke_async(&mut conn)
                        .await?;
                    // The script returns false (nil on the wire) when the
                    // key already exists, OK otherwise.
                    Ok(!matches!(reply, Value::Nil))
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn forever(&self, key: &str, value: &[u8]) -> CacheResult<bool> {
        let wire = self.context.entry_key(key);
        let value = value.to_vec();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    redis::cmd("SET")
                        .arg(&wire)
                        .arg(&value)
                        .query_async::<()>(&mut conn)
                        .await?;
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn forget(&self, key: &str) -> CacheResult<bool> {
        let wire = self.context.entry_key(key);
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let removed: i64 = redis::cmd("DEL").arg(&wire).query_async(&mut conn).await?;
                    Ok(removed >= 1)
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn increment(&self, key: &str, by: i64) -> CacheResult<i64> {
        let wire = self.context.entry_key(key);
        self.context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("INCRBY")
                    .arg(&wire)
                    .arg(by)
                    .query_async(&mut conn)
                    .await;
                (result, conn)
            })
            .await
    }

    async fn decrement(&self, key: &str, by: i64) -> CacheResult<i64> {
        let wire = self.context.entry_key(key);
        self.context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("DECRBY")
                    .arg(&wire)
                    .arg(by)
                    .query_async(&mut conn)
                    .await;
                (result, conn)
            })
            .await
    }

    async fn flush(&self) -> CacheResult<bool> {
        match self.context.config().flush_mode {
            FlushMode::FlushDb => {
                if self.context.is_cluster() {
                    // FLUSHDB is node-local; hit every configured node.
                    for url in self.context.config().redis.node_urls() {
                        let mut conn = self.context.node_connection(&url).await?;
                        redis::cmd("FLUSHDB")
                            .query_async::<()>(&mut conn)
                            .await
                            .map_err(crate::CacheError::from_redis)?;
                    }
                    debug!("flushed all cluster nodes");
                    Ok(true)
                } else {
                    self.context
                        .with_connection(|mut conn| async move {
                            let result = async {
                                warn!("FLUSHDB clears the whole database, not just cache keys");
                                redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
                                Ok(true)
                            }
                            .await;
                            (result, conn)
                        })
                        .await
                }
            }
            FlushMode::ScanPrefix => {
                let pattern = format!("{}*", self.context.entry_prefix());
                let keys = crate::scan::scan_matching(&self.context, &pattern).await?;
                if keys.is_empty() {
                    return Ok(true);
                }
                let cluster = self.context.is_cluster();
                self.context
                    .with_connection(|mut conn| async move {
                        let result = async {
                            if cluster {
                                for key in &keys {
                                    redis::cmd("UNLINK")
                                        .arg(key)
                                        .query_async::<()>(&mut conn)
                                        .await?;
                                }
                            } else {
                                for chunk in keys.chunks(DELETE_CHUNK) {
                                    redis::cmd("UNLINK")
                                        .arg(chunk)
                                        .query_async::<()>(&mut conn)
                                        .await?;
                                }
                            }
                            Ok(true)
                        }
                        .await;
                        (result, conn)
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_clamped_to_one_second() {
        assert_eq!(clamp_ttl(Duration::from_millis(10)), 1);
        assert_eq!(clamp_ttl(Duration::from_secs(0)), 1);
        assert_eq!(clamp_ttl(Duration::from_secs(60)), 60);
    }

    #[test]
    fn test_delete_chunk_matches_flush_contract() {
        assert_eq!(DELETE_CHUNK, 1000);
    }
}
