//! Tagged cache facade
//!
//! Translates the public cache API into the active mode's operation
//! calls and fires the observable events. Values are encoded here (see
//! [`crate::serialize`]); the operation containers only ever see bytes.
//!
//! Mode asymmetry: in `all` mode reads are scoped through the namespaced
//! item key and work normally. In `any` mode tags exist for writing and
//! flushing only, so `get`, `many`, `has`, `pull`, and `forget` fail with
//! [`CacheError::UnsupportedOperation`]; `remember` still works because it
//! consults the underlying store by the raw key.

use crate::config::TagMode;
use crate::context::StoreContext;
use crate::events::{CacheEvent, EventSink};
use crate::serialize::{deserialize, serialize, serialize_for_lua};
use crate::tags::{TagOps, TagSet};
use crate::{CacheError, CacheResult};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct TaggedCache {
    context: Arc<StoreContext>,
    set: TagSet,
    ops: TagOps,
    events: Arc<dyn EventSink>,
}

impl TaggedCache {
    pub fn new(context: Arc<StoreContext>, set: TagSet, events: Arc<dyn EventSink>) -> Self {
        let ops = TagOps::for_context(Arc::clone(&context));
        Self {
            context,
            set,
            ops,
            events,
        }
    }

    pub fn tag_set(&self) -> &TagSet {
        &self.set
    }

    pub fn mode(&self) -> TagMode {
        self.ops.mode()
    }

    /// Wire key a value for `key` lives at under this tag set: the
    /// digest-namespaced key in `all` mode, the raw entry key in `any`.
    fn item_key(&self, key: &str) -> String {
        match &self.ops {
            TagOps::All(ops) => ops.entry_key(&self.set, key),
            TagOps::Any(_) => self.context.entry_key(key),
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let config = self.context.config();
        match self.mode() {
            // `any`-mode values travel through Lua ARGV.
            TagMode::Any => {
                serialize_for_lua(value, config.compression, config.compression_threshold)
            }
            TagMode::All => serialize(value),
        }
    }

    fn reject_read(&self, operation: &str) -> CacheError {
        CacheError::UnsupportedOperation(format!(
            "{} through `any`-mode tags: tags are for writing and flushing only",
            operation
        ))
    }

    fn written(&self, key: &str, ttl: Option<Duration>) {
        self.events.emit(CacheEvent::KeyWritten {
            key: key.to_string(),
            ttl,
            tags: self.set.names().to_vec(),
        });
    }

    /// Store a value under this tag set.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<bool> {
        let bytes = self.encode(value)?;
        let stored = self.ops.put(&self.set, key, &bytes, Some(ttl)).await?;
        if stored {
            self.written(key, Some(ttl));
        }
        Ok(stored)
    }

    /// Store several values under this tag set with a shared TTL.
    pub async fn put_many<T: Serialize>(
        &self,
        entries: &[(&str, T)],
        ttl: Duration,
    ) -> CacheResult<bool> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            encoded.push((*key, self.encode(value)?));
        }
        let stored = self.ops.put_many(&self.set, &encoded, Some(ttl)).await?;
        if stored {
            for (key, _) in entries {
                self.written(key, Some(ttl));
            }
        }
        Ok(stored)
    }

    /// Store a value only when absent; `true` iff newly inserted.
    pub async fn add<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<bool> {
        let bytes = self.encode(value)?;
        let inserted = self.ops.add(&self.set, key, &bytes, Some(ttl)).await?;
        if inserted {
            self.written(key, Some(ttl));
        }
        Ok(inserted)
    }

    /// Store a value with no expiry.
    pub async fn forever<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<bool> {
        let bytes = self.encode(value)?;
        let stored = self.ops.put(&self.set, key, &bytes, None).await?;
        if stored {
            self.written(key, None);
        }
        Ok(stored)
    }

    /// Increment a tagged counter.
    pub async fn increment(&self, key: &str, by: i64) -> CacheResult<i64> {
        let value = self.ops.increment(&self.set, key, by).await?;
        self.written(key, None);
        Ok(value)
    }

    /// Decrement a tagged counter.
    pub async fn decrement(&self, key: &str, by: i64) -> CacheResult<i64> {
        let value = self.ops.increment(&self.set, key, -by).await?;
        self.written(key, None);
        Ok(value)
    }

    /// Read a value scoped by this tag set. `all` mode only.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        if self.mode() == TagMode::Any {
            return Err(self.reject_read("get"));
        }
        self.read(key).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let wire = self.item_key(key);
        let bytes: Option<Vec<u8>> = self
            .context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("GET").arg(&wire).query_async(&mut conn).await;
                (result, conn)
            })
            .await?;
        match bytes {
            Some(bytes) => {
                self.events.emit(CacheEvent::CacheHit {
                    key: key.to_string(),
                    tags: self.set.names().to_vec(),
                });
                Ok(Some(deserialize(&bytes)?))
            }
            None => {
                self.events.emit(CacheEvent::CacheMissed {
                    key: key.to_string(),
                    tags: self.set.names().to_vec(),
                });
                Ok(None)
            }
        }
    }

    /// Read several values scoped by this tag set. `all` mode only.
    pub async fn many<T: DeserializeOwned>(&self, keys: &[&str]) -> CacheResult<Vec<Option<T>>> {
        if self.mode() == TagMode::Any {
            return Err(self.reject_read("many"));
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let wires: Vec<String> = keys.iter().map(|k| self.item_key(k)).collect();
        let cluster = self.context.is_cluster();
        let raw: Vec<Option<Vec<u8>>> = self
            .context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
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
            .await?;

        let mut values = Vec::with_capacity(raw.len());
        for (key, bytes) in keys.iter().zip(raw) {
            match bytes {
                Some(bytes) => {
                    self.events.emit(CacheEvent::CacheHit {
                        key: key.to_string(),
                        tags: self.set.names().to_vec(),
                    });
                    values.push(Some(deserialize(&bytes)?));
                }
                None => {
                    self.events.emit(CacheEvent::CacheMissed {
                        key: key.to_string(),
                        tags: self.set.names().to_vec(),
                    });
                    values.push(None);
                }
            }
        }
        Ok(values)
    }

    /// Whether a scoped value exists. `all` mode only.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        if self.mode() == TagMode::Any {
            return Err(self.reject_read("has"));
        }
        let wire = self.item_key(key);
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let exists: i64 = redis::cmd("EXISTS")
                        .arg(&wire)
                        .query_async(&mut conn)
                        .await?;
                    Ok(exists >= 1)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Read and remove a scoped value. `all` mode only.
    pub async fn pull<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        if self.mode() == TagMode::Any {
            return Err(self.reject_read("pull"));
        }
        let value = self.read(key).await?;
        if value.is_some() {
            self.remove(key).await?;
        }
        Ok(value)
    }

    /// Remove a scoped value. `all` mode only; `true` iff a key was
    /// actually removed.
    pub async fn forget(&self, key: &str) -> CacheResult<bool> {
        if self.mode() == TagMode::Any {
            return Err(self.reject_read("forget"));
        }
        self.remove(key).await
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        let wire = self.item_key(key);
        let removed = self
            .context
            .with_connection(|mut conn| async move {
                let result = async {
                    let count: i64 = redis::cmd("DEL").arg(&wire).query_async(&mut conn).await?;
                    Ok(count >= 1)
                }
                .await;
                (result, conn)
            })
            .await?;
        if removed {
            self.events.emit(CacheEvent::KeyForgotten {
                key: key.to_string(),
                tags: self.set.names().to_vec(),
            });
        }
        Ok(removed)
    }

    /// Get the stored value or compute, store, and return it. Works in
    /// both modes: the read consults the mode's item key directly.
    pub async fn remember<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.read(key).await? {
            return Ok(value);
        }
        let value = compute().await;
        self.put(key, &value, ttl).await?;
        Ok(value)
    }

    /// [`TaggedCache::remember`] with no expiry.
    pub async fn remember_forever<T, F, Fut>(&self, key: &str, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.read(key).await? {
            return Ok(value);
        }
        let value = compute().await;
        self.forever(key, &value).await?;
        Ok(value)
    }

    /// Remove every entry referenced by this tag set, with the semantics
    /// of the active mode.
    pub async fn flush(&self) -> CacheResult<()> {
        self.ops.flush(&self.set).await?;
        self.events.emit(CacheEvent::TagsFlushed {
            tags: self.set.names().to_vec(),
        });
        Ok(())
    }

    /// The union of cache keys across this set's tags.
    pub async fn entries(&self) -> CacheResult<Vec<String>> {
        self.ops.entries(&self.set).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::events::NullSink;

    fn tagged(mode: TagMode) -> TaggedCache {
        let context = Arc::new(
            StoreContext::new(CacheConfig::builder().prefix("app:").mode(mode).build()).unwrap(),
        );
        let set = TagSet::new(Arc::clone(&context), &["a", "b"]);
        TaggedCache::new(context, set, Arc::new(NullSink))
    }

    #[test]
    fn test_item_key_is_namespaced_in_all_mode() {
        let cache = tagged(TagMode::All);
        let item = cache.item_key("x");
        assert!(item.starts_with("app:"));
        assert!(item.ends_with(":x"));
        assert_ne!(item, "app:x");
    }

    #[test]
    fn test_item_key_is_raw_in_any_mode() {
        let cache = tagged(TagMode::Any);
        assert_eq!(cache.item_key("x"), "app:x");
    }

    #[tokio::test]
    async fn test_any_mode_reads_are_rejected() {
        let cache = tagged(TagMode::Any);
        let err = cache.get::<String>("x").await.unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedOperation(_)));
        let err = cache.many::<String>(&["x"]).await.unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedOperation(_)));
        let err = cache.has("x").await.unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedOperation(_)));
        let err = cache.pull::<String>("x").await.unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedOperation(_)));
        let err = cache.forget("x").await.unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedOperation(_)));
    }
}
