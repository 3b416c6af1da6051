//! Lazy background pruning
//!
//! Flush and natural TTL expiry deliberately leave references behind:
//! stale sorted-set members in `all` mode, orphan hash fields and registry
//! entries in `any` mode. A periodic sweep restores the steady-state
//! invariants. Failures on individual tag structures are counted, never
//! fatal; a sweep always walks the whole keyspace.

use crate::context::StoreContext;
use crate::tags::TagOps;
use crate::CacheResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Counters from an `all`-mode sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllPruneReport {
    /// Tag sorted sets visited.
    pub tags_scanned: u64,
    /// Expired members removed (`ZREMRANGEBYSCORE 0 now`).
    pub entries_removed: u64,
    /// Sorted sets deleted because nothing remained.
    pub empty_sets_deleted: u64,
    /// Structures skipped because of per-object errors.
    pub failures: u64,
}

/// Counters from an `any`-mode sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnyPruneReport {
    /// Tag hashes visited.
    pub hashes_scanned: u64,
    /// Hash fields whose cache entry was checked for existence.
    pub fields_checked: u64,
    /// Fields removed because their cache entry was gone.
    pub orphans_removed: u64,
    /// Hashes deleted because nothing remained.
    pub empty_hashes_deleted: u64,
    /// Registry tags removed after their hash disappeared.
    pub expired_tags_removed: u64,
    /// Structures skipped because of per-object errors.
    pub failures: u64,
}

/// Result of one full sweep, shaped by the active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReport {
    All(AllPruneReport),
    Any(AnyPruneReport),
}

impl PruneReport {
    /// Two-column rows for operator output, in reporting order.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        match self {
            PruneReport::All(r) => vec![
                ("Tags scanned", r.tags_scanned),
                ("Entries removed", r.entries_removed),
                ("Empty sets deleted", r.empty_sets_deleted),
                ("Failures", r.failures),
            ],
            PruneReport::Any(r) => vec![
                ("Hashes scanned", r.hashes_scanned),
                ("Fields checked", r.fields_checked),
                ("Orphans removed", r.orphans_removed),
                ("Empty hashes deleted", r.empty_hashes_deleted),
                ("Expired tags removed", r.expired_tags_removed),
                ("Failures", r.failures),
            ],
        }
    }

    pub fn failures(&self) -> u64 {
        match self {
            PruneReport::All(r) => r.failures,
            PruneReport::Any(r) => r.failures,
        }
    }
}

/// Sweep driver over the context's active tagging mode.
pub struct Pruner {
    ops: TagOps,
}

impl Pruner {
    pub fn new(context: Arc<StoreContext>) -> Self {
        Self {
            ops: TagOps::for_context(context),
        }
    }

    /// Run one full sweep and report counters.
    pub async fn run(&self) -> CacheResult<PruneReport> {
        let report = self.ops.prune().await?;
        if report.failures() > 0 {
            warn!(failures = report.failures(), "prune sweep finished with per-object failures");
        } else {
            info!(mode = self.ops.mode().as_str(), "prune sweep finished");
        }
        Ok(report)
    }

    /// Spawn a task that sweeps every `period`. The invariants in the
    /// data model only converge when this (or an external scheduler
    /// calling `prune-stale-tags`) runs regularly. A failed sweep is
    /// logged and retried on the next tick.
    pub fn spawn_periodic(context: Arc<StoreContext>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pruner = Pruner::new(context);
            let mut ticker = interval(period);
            // The first tick fires immediately; skip it so a freshly
            // started service does not sweep during warm-up.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = pruner.run().await {
                    error!(error = %e, "scheduled prune sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_rows_match_mode() {
        let all = PruneReport::All(AllPruneReport {
            tags_scanned: 3,
            entries_removed: 12,
            empty_sets_deleted: 1,
            failures: 0,
        });
        let rows = all.rows();
        assert_eq!(rows[0], ("Tags scanned", 3));
        assert_eq!(rows.len(), 4);

        let any = PruneReport::Any(AnyPruneReport {
            hashes_scanned: 2,
            fields_checked: 40,
            orphans_removed: 5,
            empty_hashes_deleted: 1,
            expired_tags_removed: 1,
            failures: 2,
        });
        assert_eq!(any.rows().len(), 6);
        assert_eq!(any.failures(), 2);
    }
}
