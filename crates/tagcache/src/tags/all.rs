//! Intersection tagging (mode `all`)
//!
//! Every tag owns a sorted set of cache keys scored by absolute expiry
//! (`-1` for forever). The cache value itself lives at a key namespaced
//! by the SHA-1 digest of the tag-id list, so reads with the same tag set
//! land on it and reads with any other set do not.
//!
//! Expired members stay in the sorted sets until [`IntersectionTagOps::prune`]
//! or [`IntersectionTagOps::flush_stale`] removes them.

use crate::context::StoreContext;
use crate::prune::{AllPruneReport, PruneReport};
use crate::scan::{scan_matching, ZsetScan};
use crate::store::{clamp_ttl, DELETE_CHUNK};
use crate::tags::TagSet;
use crate::CacheResult;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Conditional flags relayed to `ZADD` when writing tag references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZaddFlag {
    /// Unconditional write.
    None,
    /// Only add new members; never touch an existing score.
    Nx,
    /// Only update existing members.
    Xx,
    /// Only move scores upward.
    Gt,
    /// Only move scores downward.
    Lt,
}

impl ZaddFlag {
    fn as_arg(&self) -> Option<&'static str> {
        match self {
            ZaddFlag::None => None,
            ZaddFlag::Nx => Some("NX"),
            ZaddFlag::Xx => Some("XX"),
            ZaddFlag::Gt => Some("GT"),
            ZaddFlag::Lt => Some("LT"),
        }
    }
}

/// Sorted-set score for entries stored forever.
const FOREVER_SCORE: i64 = -1;

pub struct IntersectionTagOps {
    context: Arc<StoreContext>,
}

impl IntersectionTagOps {
    pub fn new(context: Arc<StoreContext>) -> Self {
        Self { context }
    }

    /// Wire key of the tag-scoped entry for `key` under `set`.
    pub fn entry_key(&self, set: &TagSet, key: &str) -> String {
        self.context.namespaced_entry_key(&set.digest(), key)
    }

    fn zset_keys(&self, set: &TagSet) -> Vec<String> {
        set.names()
            .iter()
            .map(|name| self.context.tag_zset_key(name))
            .collect()
    }

    fn score_for(&self, ttl: Option<Duration>) -> i64 {
        match ttl {
            Some(ttl) => self.context.now() + clamp_ttl(ttl) as i64,
            None => FOREVER_SCORE,
        }
    }

    fn zadd(zset: &str, flag: ZaddFlag, score: i64, member: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(zset);
        if let Some(flag) = flag.as_arg() {
            cmd.arg(flag);
        }
        cmd.arg(score).arg(member);
        cmd
    }

    /// Tagged write: reference `key` from every tag's sorted set, then
    /// store the value at the namespaced key.
    pub async fn put(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.write(set, key, value, ttl, ZaddFlag::None).await
    }

    /// [`IntersectionTagOps::put`] with a caller-relayed `ZADD` flag on
    /// the reference writes.
    pub async fn put_with(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        flag: ZaddFlag,
    ) -> CacheResult<bool> {
        self.write(set, key, value, ttl, flag).await
    }

    async fn write(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        flag: ZaddFlag,
    ) -> CacheResult<bool> {
        let zsets = self.zset_keys(set);
        let entry = self.entry_key(set, key);
        let score = self.score_for(ttl);
        let secs = ttl.map(clamp_ttl);
        let member = key.to_string();
        let value = value.to_vec();
        let cluster = self.context.is_cluster();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
                        for zset in &zsets {
                            Self::zadd(zset, flag, score, &member)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                        match secs {
                            Some(secs) => {
                                redis::cmd("SETEX")
                                    .arg(&entry)
                                    .arg(secs)
                                    .arg(&value)
                                    .query_async::<()>(&mut conn)
                                    .await?
                            }
                            None => {
                                redis::cmd("SET")
                                    .arg(&entry)
                                    .arg(&value)
                                    .query_async::<()>(&mut conn)
                                    .await?
                            }
                        }
                    } else {
                        let mut pipe = redis::pipe();
                        for zset in &zsets {
                            pipe.add_command(Self::zadd(zset, flag, score, &member))
                                .ignore();
                        }
                        match secs {
                            Some(secs) => {
                                pipe.cmd("SETEX").arg(&entry).arg(secs).arg(&value).ignore()
                            }
                            None => pipe.cmd("SET").arg(&entry).arg(&value).ignore(),
                        };
                        pipe.query_async::<()>(&mut conn).await?;
                    }
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Tagged insert-if-absent. Tag references are written only when the
    /// namespaced key was actually created.
    pub async fn add(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let zsets = self.zset_keys(set);
        let entry = self.entry_key(set, key);
        let score = self.score_for(ttl);
        let secs = clamp_ttl(ttl.unwrap_or(Duration::from_secs(0)));
        let forever = ttl.is_none();
        let member = key.to_string();
        let value = value.to_vec();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let inserted = if forever {
                        let reply: Option<String> = redis::cmd("SET")
                            .arg(&entry)
                            .arg(&value)
                            .arg("NX")
                            .query_async(&mut conn)
                            .await?;
                        reply.is_some()
                    } else {
                        let reply: redis::Value = redis::Script::new(crate::scripts::ADD)
                            .key(&entry)
                            .arg(&value)
                            .arg(secs)
                            .invoke_async(&mut conn)
                            .await?;
                        !matches!(reply, redis::Value::Nil)
                    };

                    if inserted {
                        for zset in &zsets {
                            Self::zadd(zset, ZaddFlag::None, score, &member)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                    }
                    Ok(inserted)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Tagged bulk write sharing one TTL and one reference score.
    pub async fn put_many(
        &self,
        set: &TagSet,
        entries: &[(&str, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if entries.is_empty() {
            return Ok(true);
        }
        let zsets = self.zset_keys(set);
        let score = self.score_for(ttl);
        let secs = ttl.map(clamp_ttl);
        let digest = set.digest();
        let wired: Vec<(String, String, Vec<u8>)> = entries
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    self.context.namespaced_entry_key(&digest, k),
                    v.clone(),
                )
            })
            .collect();
        let cluster = self.context.is_cluster();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
                        for (member, entry, value) in &wired {
                            for zset in &zsets {
                                Self::zadd(zset, ZaddFlag::None, score, member)
                                    .query_async::<()>(&mut conn)
                                    .await?;
                            }
                            match secs {
                                Some(secs) => {
                                    redis::cmd("SETEX")
                                        .arg(entry)
                                        .arg(secs)
                                        .arg(value)
                                        .query_async::<()>(&mut conn)
                                        .await?
                                }
                                None => {
                                    redis::cmd("SET")
                                        .arg(entry)
                                        .arg(value)
                                        .query_async::<()>(&mut conn)
                                        .await?
                                }
                            }
                        }
                    } else {
                        let mut pipe = redis::pipe();
                        for (member, entry, value) in &wired {
                            for zset in &zsets {
                                pipe.add_command(Self::zadd(zset, ZaddFlag::None, score, member))
                                    .ignore();
                            }
                            match secs {
                                Some(secs) => {
                                    pipe.cmd("SETEX").arg(entry).arg(secs).arg(value).ignore()
                                }
                                None => pipe.cmd("SET").arg(entry).arg(value).ignore(),
                            };
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

    /// Tagged counter update. References are added with `NX` so an
    /// existing counter keeps its recorded expiry; fresh counters are
    /// referenced forever, matching the persistence of `INCRBY`-created
    /// keys.
    pub async fn increment(&self, set: &TagSet, key: &str, by: i64) -> CacheResult<i64> {
        let zsets = self.zset_keys(set);
        let entry = self.entry_key(set, key);
        let member = key.to_string();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    for zset in &zsets {
                        Self::zadd(zset, ZaddFlag::Nx, FOREVER_SCORE, &member)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }
                    redis::cmd("INCRBY")
                        .arg(&entry)
                        .arg(by)
                        .query_async(&mut conn)
                        .await
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Deduplicated union of members across the set's sorted sets.
    pub async fn entries(&self, set: &TagSet) -> CacheResult<Vec<String>> {
        let zsets = self.zset_keys(set);
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let mut seen: HashSet<String> = HashSet::new();
                    for zset in &zsets {
                        let mut scan = ZsetScan::new(zset);
                        while !scan.is_done() {
                            for (member, _score) in scan.next_page(&mut conn).await? {
                                seen.insert(member);
                            }
                        }
                    }
                    Ok(seen.into_iter().collect())
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Intersection flush: remove every entry recorded under this exact
    /// tag set, then drop the sorted sets themselves.
    pub async fn flush(&self, set: &TagSet) -> CacheResult<()> {
        let members = self.entries(set).await?;
        let digest = set.digest();
        let entry_keys: Vec<String> = members
            .iter()
            .map(|m| self.context.namespaced_entry_key(&digest, m))
            .collect();
        let zsets = self.zset_keys(set);
        let cluster = self.context.is_cluster();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if cluster {
                        for key in &entry_keys {
                            redis::cmd("DEL")
                                .arg(key)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                        for zset in &zsets {
                            redis::cmd("DEL")
                                .arg(zset)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                    } else {
                        for chunk in entry_keys.chunks(DELETE_CHUNK) {
                            redis::cmd("DEL")
                                .arg(chunk)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                        if !zsets.is_empty() {
                            redis::cmd("DEL")
                                .arg(&zsets)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                    }
                    Ok(())
                }
                .await;
                (result, conn)
            })
            .await?;

        debug!(tags = ?set.names(), removed = members.len(), "flushed tag set");
        Ok(())
    }

    /// Drop expired references from this set's sorted sets, preserving
    /// forever members at score `-1`. Returns the number removed.
    pub async fn flush_stale(&self, set: &TagSet) -> CacheResult<u64> {
        let zsets = self.zset_keys(set);
        let now = self.context.now();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let mut removed: u64 = 0;
                    for zset in &zsets {
                        let count: u64 = redis::cmd("ZREMRANGEBYSCORE")
                            .arg(zset)
                            .arg(0)
                            .arg(now)
                            .query_async(&mut conn)
                            .await?;
                        removed += count;
                    }
                    Ok(removed)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Full sweep: walk every tag sorted set in the keyspace, drop
    /// expired references, and delete sets that end up empty.
    pub async fn prune(&self) -> CacheResult<PruneReport> {
        let pattern = self.context.all_tag_scan_pattern();
        let zsets = scan_matching(&self.context, &pattern).await?;
        let now = self.context.now();

        let report = self
            .context
            .with_connection(|mut conn| async move {
                let result = async {
                    let mut report = AllPruneReport::default();
                    for zset in &zsets {
                        report.tags_scanned += 1;

                        let removed: Result<u64, redis::RedisError> =
                            redis::cmd("ZREMRANGEBYSCORE")
                                .arg(zset)
                                .arg(0)
                                .arg(now)
                                .query_async(&mut conn)
                                .await;
                        let removed = match removed {
                            Ok(removed) => removed,
                            Err(e) if connection_failed(&e) => return Err(e),
                            Err(_) => {
                                report.failures += 1;
                                continue;
                            }
                        };
                        report.entries_removed += removed;

                        let remaining: Result<u64, redis::RedisError> = redis::cmd("ZCARD")
                            .arg(zset)
                            .query_async(&mut conn)
                            .await;
                        match remaining {
                            Ok(0) => {
                                redis::cmd("DEL")
                                    .arg(zset)
                                    .query_async::<()>(&mut conn)
                                    .await?;
                                report.empty_sets_deleted += 1;
                            }
                            Ok(_) => {}
                            Err(e) if connection_failed(&e) => return Err(e),
                            Err(_) => report.failures += 1,
                        }
                    }
                    Ok(report)
                }
                .await;
                (result, conn)
            })
            .await?;

        Ok(PruneReport::All(report))
    }
}

/// Connection-level failures abort a sweep; per-object errors only count.
pub(crate) fn connection_failed(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, TagMode};

    fn ops() -> (IntersectionTagOps, Arc<StoreContext>) {
        let context = Arc::new(
            StoreContext::new(CacheConfig::builder().prefix("app:").mode(TagMode::All).build())
                .unwrap(),
        );
        (IntersectionTagOps::new(Arc::clone(&context)), context)
    }

    #[test]
    fn test_entry_key_is_digest_namespaced() {
        let (ops, context) = ops();
        let set = TagSet::new(Arc::clone(&context), &["a", "b"]);
        let entry = ops.entry_key(&set, "x");
        assert!(entry.starts_with("app:"));
        assert!(entry.ends_with(":x"));
        // 40 hex chars between the prefix and the key.
        let digest = &entry["app:".len()..entry.len() - ":x".len()];
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, set.digest());
    }

    #[test]
    fn test_score_for_forever_is_negative_one() {
        let (ops, _context) = ops();
        assert_eq!(ops.score_for(None), FOREVER_SCORE);
        let score = ops.score_for(Some(Duration::from_secs(60)));
        assert!(score > chrono::Utc::now().timestamp());
    }

    #[test]
    fn test_zadd_flags() {
        assert_eq!(ZaddFlag::None.as_arg(), None);
        assert_eq!(ZaddFlag::Nx.as_arg(), Some("NX"));
        assert_eq!(ZaddFlag::Gt.as_arg(), Some("GT"));
    }
}
