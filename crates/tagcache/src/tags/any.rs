//! Union tagging (mode `any`)
//!
//! Cache entries keep their user-supplied keys; tags are invalidation
//! metadata only. Every tag owns a hash whose fields are cache keys with
//! per-field TTLs (`HSETEX`, Redis 8.0+), every entry owns a reverse
//! index set listing its tags, and a shared registry sorted set tracks
//! live tags scored by their maximum entry expiry.
//!
//! On standalone deployments a tagged write is one Lua script and
//! therefore atomic. On cluster the same sequence runs as node-local
//! commands with a `MULTI/EXEC` only on the single-slot reverse index;
//! a failure part-way leaks orphan hash fields for the pruner to repair.

use crate::context::StoreContext;
use crate::prune::{AnyPruneReport, PruneReport};
use crate::scan::{scan_matching, HashScan};
use crate::store::clamp_ttl;
use crate::tags::all::connection_failed;
use crate::tags::TagSet;
use crate::{scripts, CacheResult, MAX_EXPIRY};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hashes larger than this are enumerated with `HSCAN`; smaller ones
/// with a single `HKEYS`.
const HSCAN_THRESHOLD: u64 = 1000;

pub struct UnionTagOps {
    context: Arc<StoreContext>,
}

impl UnionTagOps {
    pub fn new(context: Arc<StoreContext>) -> Self {
        Self { context }
    }

    fn script_args(&self, set: &TagSet) -> (String, String, i64, Vec<String>) {
        (
            self.context.any_tag_prefix(),
            self.context.entry_prefix(),
            self.context.now(),
            set.names().to_vec(),
        )
    }

    /// Tagged write; `ttl = None` stores forever (registry score pinned
    /// at [`MAX_EXPIRY`], no field expiration).
    pub async fn put(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let secs = ttl.map(clamp_ttl).unwrap_or(0);
        if self.context.is_cluster() {
            self.write_sequential(set, key, value, secs, false).await
        } else {
            let entry = self.context.entry_key(key);
            let rindex = self.context.reverse_index_key(key);
            let (tag_prefix, entry_prefix, now, names) = self.script_args(set);
            let value = value.to_vec();
            self.context
                .with_connection(|mut conn| async move {
                    let result = async {
                        let _: i64 = redis::Script::new(scripts::ANY_PUT)
                            .key(&entry)
                            .key(&rindex)
                            .arg(&value)
                            .arg(secs)
                            .arg(&tag_prefix)
                            .arg(&entry_prefix)
                            .arg(now)
                            .arg(&names)
                            .invoke_async(&mut conn)
                            .await?;
                        Ok(true)
                    }
                    .await;
                    (result, conn)
                })
                .await
        }
    }

    /// Tagged insert-if-absent; the `EXISTS` guard runs inside the same
    /// atomic script, so concurrent adds elect exactly one winner.
    pub async fn add(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let secs = ttl.map(clamp_ttl).unwrap_or(0);
        if self.context.is_cluster() {
            return self.write_sequential(set, key, value, secs, true).await;
        }
        let entry = self.context.entry_key(key);
        let rindex = self.context.reverse_index_key(key);
        let (tag_prefix, entry_prefix, now, names) = self.script_args(set);
        let value = value.to_vec();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let inserted: i64 = redis::Script::new(scripts::ANY_ADD)
                        .key(&entry)
                        .key(&rindex)
                        .arg(&value)
                        .arg(secs)
                        .arg(&tag_prefix)
                        .arg(&entry_prefix)
                        .arg(now)
                        .arg(&names)
                        .invoke_async(&mut conn)
                        .await?;
                    Ok(inserted == 1)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Tagged bulk write: one script receives every entry and reverse
    /// index interleaved in `KEYS` and performs the single-entry sequence
    /// per pair.
    pub async fn put_many(
        &self,
        set: &TagSet,
        entries: &[(&str, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if entries.is_empty() {
            return Ok(true);
        }
        let secs = ttl.map(clamp_ttl).unwrap_or(0);
        if self.context.is_cluster() {
            for (key, value) in entries {
                self.write_sequential(set, key, value, secs, false).await?;
            }
            return Ok(true);
        }

        let (tag_prefix, entry_prefix, now, names) = self.script_args(set);
        let script = redis::Script::new(scripts::ANY_PUT_MANY);
        let mut invocation = script.prepare_invoke();
        for (key, _) in entries {
            invocation
                .key(self.context.entry_key(key))
                .key(self.context.reverse_index_key(key));
        }
        invocation
            .arg(secs)
            .arg(&tag_prefix)
            .arg(&entry_prefix)
            .arg(now)
            .arg(names.len())
            .arg(&names);
        for (_, value) in entries {
            invocation.arg(value.as_slice());
        }

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let _: i64 = invocation.invoke_async(&mut conn).await?;
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Tagged counter update: `INCRBY` then TTL propagation to the tag
    /// references, creating reverse-index and registry entries as a fresh
    /// write would. Negative `by` decrements.
    pub async fn increment(&self, set: &TagSet, key: &str, by: i64) -> CacheResult<i64> {
        if self.context.is_cluster() {
            return self.increment_sequential(set, key, by).await;
        }
        let entry = self.context.entry_key(key);
        let rindex = self.context.reverse_index_key(key);
        let (tag_prefix, entry_prefix, now, names) = self.script_args(set);
        self.context
            .with_connection(|mut conn| async move {
                let result = redis::Script::new(scripts::ANY_INCR)
                    .key(&entry)
                    .key(&rindex)
                    .arg(by)
                    .arg(&tag_prefix)
                    .arg(&entry_prefix)
                    .arg(now)
                    .arg(&names)
                    .invoke_async(&mut conn)
                    .await;
                (result, conn)
            })
            .await
    }

    /// The cluster rendition of the atomic write: node-local commands in
    /// script order, with `MULTI/EXEC` on the single-slot reverse index.
    async fn write_sequential(
        &self,
        set: &TagSet,
        key: &str,
        value: &[u8],
        secs: u64,
        only_if_absent: bool,
    ) -> CacheResult<bool> {
        let entry = self.context.entry_key(key);
        let rindex = self.context.reverse_index_key(key);
        let registry = self.context.registry_key();
        let any_tag_prefix = self.context.any_tag_prefix();
        let names = set.names().to_vec();
        let hashes: Vec<String> = names
            .iter()
            .map(|n| self.context.tag_hash_key(n))
            .collect();
        let expiry = if secs > 0 {
            self.context.now() + secs as i64
        } else {
            MAX_EXPIRY
        };
        let member = key.to_string();
        let value = value.to_vec();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    if only_if_absent {
                        let exists: i64 = redis::cmd("EXISTS")
                            .arg(&entry)
                            .query_async(&mut conn)
                            .await?;
                        if exists >= 1 {
                            return Ok(false);
                        }
                    }

                    let old: Vec<String> = redis::cmd("SMEMBERS")
                        .arg(&rindex)
                        .query_async(&mut conn)
                        .await?;

                    if secs > 0 {
                        redis::cmd("SETEX")
                            .arg(&entry)
                            .arg(secs)
                            .arg(&value)
                            .query_async::<()>(&mut conn)
                            .await?;
                    } else {
                        redis::cmd("SET")
                            .arg(&entry)
                            .arg(&value)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }

                    for stale in old.iter().filter(|t| !names.contains(*t)) {
                        redis::cmd("HDEL")
                            .arg(format!("{}{}:entries", any_tag_prefix, stale))
                            .arg(&member)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }

                    for hash in &hashes {
                        let mut cmd = redis::cmd("HSETEX");
                        cmd.arg(hash);
                        if secs > 0 {
                            cmd.arg("EX").arg(secs);
                        }
                        cmd.arg("FVS").arg(1).arg(&member).arg("1");
                        cmd.query_async::<()>(&mut conn).await?;
                    }

                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("DEL").arg(&rindex).ignore();
                    pipe.cmd("SADD").arg(&rindex).arg(&names).ignore();
                    if secs > 0 {
                        pipe.cmd("EXPIRE").arg(&rindex).arg(secs).ignore();
                    }
                    pipe.query_async::<()>(&mut conn).await?;

                    for name in &names {
                        redis::cmd("ZADD")
                            .arg(&registry)
                            .arg("GT")
                            .arg(expiry)
                            .arg(name)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }
                    Ok(true)
                }
                .await;
                (result, conn)
            })
            .await
    }

    async fn increment_sequential(&self, set: &TagSet, key: &str, by: i64) -> CacheResult<i64> {
        let entry = self.context.entry_key(key);
        let rindex = self.context.reverse_index_key(key);
        let registry = self.context.registry_key();
        let names = set.names().to_vec();
        let hashes: Vec<String> = names
            .iter()
            .map(|n| self.context.tag_hash_key(n))
            .collect();
        let now = self.context.now();
        let member = key.to_string();

        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let current: i64 = redis::cmd("INCRBY")
                        .arg(&entry)
                        .arg(by)
                        .query_async(&mut conn)
                        .await?;
                    let secs: i64 = redis::cmd("TTL").arg(&entry).query_async(&mut conn).await?;
                    let expiry = if secs > 0 { now + secs } else { MAX_EXPIRY };

                    for hash in &hashes {
                        let mut cmd = redis::cmd("HSETEX");
                        cmd.arg(hash);
                        if secs > 0 {
                            cmd.arg("EX").arg(secs);
                        }
                        cmd.arg("FVS").arg(1).arg(&member).arg("1");
                        cmd.query_async::<()>(&mut conn).await?;
                    }

                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("SADD").arg(&rindex).arg(&names).ignore();
                    if secs > 0 {
                        pipe.cmd("EXPIRE").arg(&rindex).arg(secs).ignore();
                    }
                    pipe.query_async::<()>(&mut conn).await?;

                    for name in &names {
                        redis::cmd("ZADD")
                            .arg(&registry)
                            .arg("GT")
                            .arg(expiry)
                            .arg(name)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }
                    Ok(current)
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Deduplicated union of cache keys across the set's tag hashes.
    /// Large hashes stream through `HSCAN`; small ones use one `HKEYS`.
    pub async fn entries(&self, set: &TagSet) -> CacheResult<Vec<String>> {
        let hashes: Vec<String> = set
            .names()
            .iter()
            .map(|n| self.context.tag_hash_key(n))
            .collect();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    let mut seen: HashSet<String> = HashSet::new();
                    for hash in &hashes {
                        let len: u64 = redis::cmd("HLEN").arg(hash).query_async(&mut conn).await?;
                        if len > HSCAN_THRESHOLD {
                            let mut scan = HashScan::new(hash);
                            while !scan.is_done() {
                                for (field, _value) in scan.next_page(&mut conn).await? {
                                    seen.insert(field);
                                }
                            }
                        } else {
                            let fields: Vec<String> =
                                redis::cmd("HKEYS").arg(hash).query_async(&mut conn).await?;
                            seen.extend(fields);
                        }
                    }
                    Ok(seen.into_iter().collect())
                }
                .await;
                (result, conn)
            })
            .await
    }

    /// Union flush: remove every entry referenced by any of the set's
    /// tags, clean the reverse indexes and foreign tag hashes, then drop
    /// the set's own hashes and registry entries.
    pub async fn flush(&self, set: &TagSet) -> CacheResult<()> {
        let keys = self.entries(set).await?;
        let registry = self.context.registry_key();
        let names = set.names().to_vec();
        let own_hashes: Vec<String> = names
            .iter()
            .map(|n| self.context.tag_hash_key(n))
            .collect();
        let cluster = self.context.is_cluster();

        let targets: Vec<(String, String, String)> = keys
            .iter()
            .map(|k| {
                (
                    k.clone(),
                    self.context.entry_key(k),
                    self.context.reverse_index_key(k),
                )
            })
            .collect();
        let tag_hash_for = {
            let context = Arc::clone(&self.context);
            move |name: &str| context.tag_hash_key(name)
        };

        let removed = keys.len();
        self.context
            .with_connection(|mut conn| async move {
                let result = async {
                    for (bare, entry, rindex) in &targets {
                        // Per-object failures are tolerated; the pruner
                        // repairs whatever this pass leaves behind.
                        let outcome: Result<(), redis::RedisError> = async {
                            redis::cmd("UNLINK")
                                .arg(entry)
                                .query_async::<()>(&mut conn)
                                .await?;
                            let attached: Vec<String> = redis::cmd("SMEMBERS")
                                .arg(rindex)
                                .query_async(&mut conn)
                                .await?;
                            for tag in attached.iter().filter(|t| !names.contains(*t)) {
                                redis::cmd("HDEL")
                                    .arg(tag_hash_for(tag))
                                    .arg(bare)
                                    .query_async::<()>(&mut conn)
                                    .await?;
                            }
                            redis::cmd("UNLINK")
                                .arg(rindex)
                                .query_async::<()>(&mut conn)
                                .await?;
                            Ok(())
                        }
                        .await;
                        match outcome {
                            Ok(()) => {}
                            Err(e) if connection_failed(&e) => return Err(e),
                            Err(_) => continue,
                        }
                    }

                    if cluster {
                        for hash in &own_hashes {
                            redis::cmd("UNLINK")
                                .arg(hash)
                                .query_async::<()>(&mut conn)
                                .await?;
                        }
                    } else if !own_hashes.is_empty() {
                        redis::cmd("UNLINK")
                            .arg(&own_hashes)
                            .query_async::<()>(&mut conn)
                            .await?;
                    }

                    redis::cmd("ZREM")
                        .arg(&registry)
                        .arg(&names)
                        .query_async::<()>(&mut conn)
                        .await?;
                    Ok(())
                }
                .await;
                (result, conn)
            })
            .await?;

        debug!(tags = ?set.names(), removed, "flushed tag set");
        Ok(())
    }

    /// Full sweep: drop hash fields whose cache entry is gone, delete
    /// empty hashes, and expire registry tags whose hash has disappeared.
    pub async fn prune(&self) -> CacheResult<PruneReport> {
        let pattern = self.context.any_tag_scan_pattern();
        let hashes = scan_matching(&self.context, &pattern).await?;
        let registry = self.context.registry_key();
        let entry_prefix = self.context.entry_prefix();
        let any_tag_prefix = self.context.any_tag_prefix();
        let now = self.context.now();

        let report = self
            .context
            .with_connection(|mut conn| async move {
                let result = async {
                    let mut report = AnyPruneReport::default();

                    for hash in &hashes {
                        report.hashes_scanned += 1;
                        let outcome: Result<(), redis::RedisError> = async {
                            let mut scan = HashScan::new(hash);
                            while !scan.is_done() {
                                for (field, _value) in scan.next_page(&mut conn).await? {
                                    report.fields_checked += 1;
                                    let exists: i64 = redis::cmd("EXISTS")
                                        .arg(format!("{}{}", entry_prefix, field))
                                        .query_async(&mut conn)
                                        .await?;
                                    if exists < 1 {
                                        redis::cmd("HDEL")
                                            .arg(hash)
                                            .arg(&field)
                                            .query_async::<()>(&mut conn)
                                            .await?;
                                        report.orphans_removed += 1;
                                    }
                                }
                            }
                            let remaining: u64 =
                                redis::cmd("HLEN").arg(hash).query_async(&mut conn).await?;
                            if remaining == 0 {
                                redis::cmd("UNLINK")
                                    .arg(hash)
                                    .query_async::<()>(&mut conn)
                                    .await?;
                                report.empty_hashes_deleted += 1;
                            }
                            Ok(())
                        }
                        .await;
                        match outcome {
                            Ok(()) => {}
                            Err(e) if connection_failed(&e) => return Err(e),
                            Err(_) => report.failures += 1,
                        }
                    }

                    // Registry entries whose maximum expiry has passed and
                    // whose hash is already gone.
                    let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                        .arg(&registry)
                        .arg(0)
                        .arg(now)
                        .query_async(&mut conn)
                        .await?;
                    for tag in expired {
                        let hash = format!("{}{}:entries", any_tag_prefix, tag);
                        let exists: i64 = redis::cmd("EXISTS")
                            .arg(&hash)
                            .query_async(&mut conn)
                            .await?;
                        if exists < 1 {
                            redis::cmd("ZREM")
                                .arg(&registry)
                                .arg(&tag)
                                .query_async::<()>(&mut conn)
                                .await?;
                            report.expired_tags_removed += 1;
                        }
                    }

                    Ok(report)
                }
                .await;
                (result, conn)
            })
            .await?;

        Ok(PruneReport::Any(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, TagMode};

    fn ops() -> (UnionTagOps, Arc<StoreContext>) {
        let context = Arc::new(
            StoreContext::new(CacheConfig::builder().prefix("app:").mode(TagMode::Any).build())
                .unwrap(),
        );
        (UnionTagOps::new(Arc::clone(&context)), context)
    }

    #[test]
    fn test_script_args_carry_prefixes_and_names() {
        let (ops, context) = ops();
        let set = TagSet::new(Arc::clone(&context), &["b", "a"]);
        let (tag_prefix, entry_prefix, now, names) = ops.script_args(&set);
        assert_eq!(tag_prefix, "app:_erc:tag:");
        assert_eq!(entry_prefix, "app:");
        assert!(now > 0);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_hscan_threshold_matches_flush_contract() {
        assert_eq!(HSCAN_THRESHOLD, 1000);
    }
}
