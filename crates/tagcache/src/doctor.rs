//! Functional doctor: end-to-end assertions against a live server
//!
//! Each check exercises one contract of the engine (round trips, add
//! races, tag scoping, flush semantics, pruner reconciliation) under the
//! store's configured mode. A failing check never aborts the suite; the
//! report carries every outcome and the CLI turns it into an exit code.

use crate::config::TagMode;
use crate::serialize::serialize;
use crate::tags::TagOps;
use crate::{CacheError, CacheResult, RedisStore, Store, MAX_EXPIRY};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Result of one doctor check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Results of a full doctor run.
#[derive(Debug, Default)]
pub struct DoctorReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl DoctorReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed).count()
    }
}

/// Mode-aware assertion suite.
pub struct Doctor {
    store: Arc<RedisStore>,
    scope: String,
}

impl Doctor {
    pub fn new(store: Arc<RedisStore>) -> Self {
        // A per-run scope keeps doctor keys from colliding with real
        // cache entries and with concurrent doctor runs.
        let scope = format!("doctor:{:08x}", rand::random::<u32>());
        Self { store, scope }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.scope, name)
    }

    fn tag(&self, name: &str) -> String {
        format!("{}:{}", self.scope, name)
    }

    /// Run every check applicable to the store's mode.
    pub async fn run(&self) -> DoctorReport {
        let mut report = DoctorReport::default();

        self.check(&mut report, "simple put/get round-trip", self.check_round_trip())
            .await;
        self.check(&mut report, "add inserts only when absent", self.check_add())
            .await;
        self.check(&mut report, "bulk put/many round-trip", self.check_put_many())
            .await;
        self.check(&mut report, "counters increment natively", self.check_counters())
            .await;
        self.check(&mut report, "forever entries never expire", self.check_forever())
            .await;
        self.check(&mut report, "competing adds elect one winner", self.check_add_race())
            .await;
        self.check(
            &mut report,
            "expired references are pruned",
            self.check_ttl_expiry_cleanup(),
        )
        .await;

        match self.store.mode() {
            TagMode::Any => {
                self.check(
                    &mut report,
                    "server supports hash field TTLs",
                    self.check_hash_field_ttl_support(),
                )
                .await;
                self.check(
                    &mut report,
                    "union flush removes shared entries",
                    self.check_union_flush(),
                )
                .await;
                self.check(
                    &mut report,
                    "tagged reads are rejected",
                    self.check_scoped_read_rejected(),
                )
                .await;
                self.check(
                    &mut report,
                    "shared-tag orphans are pruned",
                    self.check_shared_tag_orphan(),
                )
                .await;
                self.check(
                    &mut report,
                    "forever registry score is pinned",
                    self.check_registry_forever_score(),
                )
                .await;
            }
            TagMode::All => {
                self.check(
                    &mut report,
                    "reads are scoped by tag set",
                    self.check_tag_scoping(),
                )
                .await;
                self.check(
                    &mut report,
                    "flush honours intersection semantics",
                    self.check_intersection_flush(),
                )
                .await;
            }
        }

        info!(
            checks = report.outcomes.len(),
            failed = report.failed_count(),
            "doctor run finished"
        );
        report
    }

    async fn check<F>(&self, report: &mut DoctorReport, name: &'static str, future: F)
    where
        F: std::future::Future<Output = CacheResult<()>>,
    {
        let outcome = match future.await {
            Ok(()) => CheckOutcome {
                name,
                passed: true,
                detail: "ok".to_string(),
            },
            Err(e) => CheckOutcome {
                name,
                passed: false,
                detail: e.to_string(),
            },
        };
        report.outcomes.push(outcome);
    }

    fn fail(&self, detail: impl Into<String>) -> CacheError {
        CacheError::Configuration(detail.into())
    }

    async fn check_round_trip(&self) -> CacheResult<()> {
        let key = self.key("greet");
        self.store
            .put(&key, &serialize(&"hello")?, Duration::from_secs(60))
            .await?;
        let value = self.store.get(&key).await?;
        self.store.forget(&key).await?;
        if value.as_deref() != Some(b"\"hello\"".as_slice()) {
            return Err(self.fail(format!("expected \"hello\", got {:?}", value)));
        }
        Ok(())
    }

    async fn check_add(&self) -> CacheResult<()> {
        let key = self.key("add");
        let first = self
            .store
            .add(&key, &serialize(&"one")?, Duration::from_secs(60))
            .await?;
        let second = self
            .store
            .add(&key, &serialize(&"two")?, Duration::from_secs(60))
            .await?;
        let value = self.store.get(&key).await?;
        self.store.forget(&key).await?;
        if !first {
            return Err(self.fail("first add did not insert"));
        }
        if second {
            return Err(self.fail("second add overwrote an existing key"));
        }
        if value.as_deref() != Some(b"\"one\"".as_slice()) {
            return Err(self.fail("losing add changed the stored value"));
        }
        Ok(())
    }

    async fn check_put_many(&self) -> CacheResult<()> {
        let k1 = self.key("m1");
        let k2 = self.key("m2");
        let entries = vec![
            (k1.as_str(), serialize(&1i64)?),
            (k2.as_str(), serialize(&2i64)?),
        ];
        self.store.put_many(&entries, Duration::from_secs(60)).await?;
        let values = self.store.many(&[&k1, &k2]).await?;
        self.store.forget(&k1).await?;
        self.store.forget(&k2).await?;
        if values != vec![Some(b"1".to_vec()), Some(b"2".to_vec())] {
            return Err(self.fail(format!("bulk read mismatch: {:?}", values)));
        }
        Ok(())
    }

    async fn check_counters(&self) -> CacheResult<()> {
        let key = self.key("counter");
        self.store
            .put(&key, &serialize(&0i64)?, Duration::from_secs(60))
            .await?;
        let mut last = 0;
        for _ in 0..50 {
            last = self.store.increment(&key, 1).await?;
        }
        let value = self.store.get(&key).await?;
        self.store.forget(&key).await?;
        if last != 50 || value.as_deref() != Some(b"50".as_slice()) {
            return Err(self.fail(format!("expected 50, got {} / {:?}", last, value)));
        }
        Ok(())
    }

    async fn check_forever(&self) -> CacheResult<()> {
        let key = self.key("forever");
        self.store.forever(&key, &serialize(&"keep")?).await?;
        let context = self.store.context();
        let wire = context.entry_key(&key);
        let ttl: i64 = context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("TTL").arg(&wire).query_async(&mut conn).await;
                (result, conn)
            })
            .await?;
        self.store.forget(&key).await?;
        if ttl != -1 {
            return Err(self.fail(format!("expected server TTL -1, got {}", ttl)));
        }
        Ok(())
    }

    async fn check_add_race(&self) -> CacheResult<()> {
        let key = self.key("race");
        let mut handles = Vec::new();
        for i in 0..5 {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let value = serialize(&format!("v{}", i))?;
                store.add(&key, &value, Duration::from_secs(60)).await
            }));
        }
        let mut winners = 0;
        for joined in futures::future::join_all(handles).await {
            let inserted = joined
                .map_err(|e| CacheError::Configuration(format!("task panicked: {}", e)))??;
            if inserted {
                winners += 1;
            }
        }
        self.store.forget(&key).await?;
        if winners != 1 {
            return Err(self.fail(format!("expected exactly one winner, got {}", winners)));
        }
        Ok(())
    }

    async fn check_ttl_expiry_cleanup(&self) -> CacheResult<()> {
        let tag = self.tag("t");
        let key = self.key("short");
        let tagged = self.store.tags(&[&tag]);
        tagged.put(&key, &"v", Duration::from_secs(1)).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let gone = match self.store.mode() {
            TagMode::Any => self.store.get(&key).await?.is_none(),
            TagMode::All => tagged.get::<String>(&key).await?.is_none(),
        };
        if !gone {
            return Err(self.fail("entry survived its TTL"));
        }

        let ops = TagOps::for_context(self.store.context());
        ops.prune().await?;
        let entries = tagged.entries().await?;
        if entries.contains(&key) {
            return Err(self.fail("pruner left a stale reference behind"));
        }
        Ok(())
    }

    async fn check_hash_field_ttl_support(&self) -> CacheResult<()> {
        let context = self.store.context();
        let probe = context.tag_hash_key(&self.tag("probe"));
        let result = context
            .with_connection(|mut conn| async move {
                let result = async {
                    redis::cmd("HSETEX")
                        .arg(&probe)
                        .arg("EX")
                        .arg(5)
                        .arg("FVS")
                        .arg(1)
                        .arg("f")
                        .arg("1")
                        .query_async::<()>(&mut conn)
                        .await?;
                    redis::cmd("UNLINK")
                        .arg(&probe)
                        .query_async::<()>(&mut conn)
                        .await?;
                    Ok(())
                }
                .await;
                (result, conn)
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(CacheError::UnsupportedCommand { .. }) => Err(self.fail(
                "`any` mode needs HSETEX (Redis 8.0+ / Valkey 9.0+); the server lacks it",
            )),
            Err(e) => Err(e),
        }
    }

    async fn check_union_flush(&self) -> CacheResult<()> {
        let posts = self.tag("posts");
        let featured = self.tag("featured");
        let key = self.key("p1");
        self.store
            .tags(&[&posts, &featured])
            .put(&key, &"X", Duration::from_secs(60))
            .await?;
        self.store.tags(&[&featured]).flush().await?;
        let value = self.store.get(&key).await?;
        if value.is_some() {
            return Err(self.fail("entry survived a flush of one of its tags"));
        }
        Ok(())
    }

    async fn check_scoped_read_rejected(&self) -> CacheResult<()> {
        let tagged = self.store.tags(&[&self.tag("ro")]);
        match tagged.get::<String>(&self.key("ro")).await {
            Err(CacheError::UnsupportedOperation(_)) => Ok(()),
            Err(e) => Err(self.fail(format!("expected UnsupportedOperation, got {}", e))),
            Ok(_) => Err(self.fail("`any`-mode tagged read unexpectedly succeeded")),
        }
    }

    async fn check_shared_tag_orphan(&self) -> CacheResult<()> {
        let a = self.tag("a");
        let b = self.tag("b");
        let key = self.key("shared");
        self.store
            .tags(&[&a, &b])
            .put(&key, &"v", Duration::from_secs(60))
            .await?;
        self.store.tags(&[&a]).flush().await?;

        if self.store.get(&key).await?.is_some() {
            return Err(self.fail("entry survived the union flush"));
        }
        // The sibling tag keeps an orphan field until the pruner runs.
        let before = self.store.tags(&[&b]).entries().await?;
        if !before.contains(&key) {
            return Err(self.fail("expected an orphan reference under the sibling tag"));
        }

        let ops = TagOps::for_context(self.store.context());
        ops.prune().await?;
        let after = self.store.tags(&[&b]).entries().await?;
        if after.contains(&key) {
            return Err(self.fail("pruner left the orphan behind"));
        }
        Ok(())
    }

    async fn check_registry_forever_score(&self) -> CacheResult<()> {
        let tag = self.tag("pin");
        let key = self.key("pin");
        let tagged = self.store.tags(&[&tag]);
        tagged.forever(&key, &"v").await?;

        let context = self.store.context();
        let registry = context.registry_key();
        let member = tag.clone();
        let score: Option<i64> = context
            .with_connection(|mut conn| async move {
                let result = redis::cmd("ZSCORE")
                    .arg(&registry)
                    .arg(&member)
                    .query_async(&mut conn)
                    .await;
                (result, conn)
            })
            .await?;
        self.store.forget(&key).await?;
        tagged.flush().await?;
        if score != Some(MAX_EXPIRY) {
            return Err(self.fail(format!(
                "expected registry score {}, got {:?}",
                MAX_EXPIRY, score
            )));
        }
        Ok(())
    }

    async fn check_tag_scoping(&self) -> CacheResult<()> {
        let a = self.tag("a");
        let b = self.tag("b");
        let key = self.key("x");
        let both = self.store.tags(&[&a, &b]);
        both.put(&key, &"1", Duration::from_secs(60)).await?;

        let scoped: Option<String> = both.get(&key).await?;
        let subset: Option<String> = self.store.tags(&[&a]).get(&key).await?;
        both.flush().await?;
        if scoped.as_deref() != Some("1") {
            return Err(self.fail("read with the writing tag set missed"));
        }
        if subset.is_some() {
            return Err(self.fail("read with a tag subset unexpectedly hit"));
        }
        Ok(())
    }

    async fn check_intersection_flush(&self) -> CacheResult<()> {
        let a = self.tag("fa");
        let b = self.tag("fb");
        let key = self.key("fx");
        let both = self.store.tags(&[&a, &b]);
        both.put(&key, &"1", Duration::from_secs(60)).await?;

        // Flushing a subset leaves the entry; flushing the exact set
        // removes it.
        self.store.tags(&[&a]).flush().await?;
        if both.get::<String>(&key).await?.is_none() {
            return Err(self.fail("subset flush removed an entry it should not reach"));
        }
        both.flush().await?;
        if both.get::<String>(&key).await?.is_some() {
            return Err(self.fail("exact-set flush left the entry behind"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_aggregation() {
        let mut report = DoctorReport::default();
        report.outcomes.push(CheckOutcome {
            name: "a",
            passed: true,
            detail: "ok".into(),
        });
        assert!(report.passed());
        report.outcomes.push(CheckOutcome {
            name: "b",
            passed: false,
            detail: "boom".into(),
        });
        assert!(!report.passed());
        assert_eq!(report.failed_count(), 1);
    }
}
