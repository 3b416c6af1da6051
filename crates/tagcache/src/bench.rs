//! Operational benchmark harness
//!
//! Exercises write/read/flush/bulk scenarios through the tagged facade in
//! the store's configured mode and reports throughput per scenario. A
//! memory guard samples system memory between batches and aborts the run
//! with [`CacheError::MemoryPressure`] once the configured percentage is
//! crossed, so a runaway benchmark cannot take the host down with it.

use crate::config::TagMode;
use crate::{CacheError, CacheResult, RedisStore, Store};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::info;

/// Iterations between memory-guard samples.
const MEMORY_CHECK_INTERVAL: u64 = 100;

/// Benchmark tuning knobs.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Operations per scenario.
    pub iterations: u64,
    /// Payload size in bytes.
    pub value_size: usize,
    /// Entries per bulk write.
    pub bulk_size: usize,
    /// Tags attached to every tagged write.
    pub tags_per_entry: usize,
    /// TTL used by every write.
    pub ttl: Duration,
    /// Abort when resident memory crosses this percentage.
    pub memory_limit_percent: f64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            value_size: 64,
            bulk_size: 100,
            tags_per_entry: 2,
            ttl: Duration::from_secs(300),
            memory_limit_percent: 90.0,
        }
    }
}

/// Throughput of one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub operations: u64,
    pub elapsed: Duration,
}

impl ScenarioResult {
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.operations as f64 / secs
        }
    }
}

/// Results of a full benchmark run.
#[derive(Debug)]
pub struct BenchReport {
    pub mode: TagMode,
    pub scenarios: Vec<ScenarioResult>,
}

/// Scenario runner over a connected store.
pub struct Benchmark {
    store: Arc<RedisStore>,
    config: BenchConfig,
    system: System,
    scope: String,
}

impl Benchmark {
    pub fn new(store: Arc<RedisStore>, config: BenchConfig) -> Self {
        let scope = format!("bench:{:08x}", rand::random::<u32>());
        Self {
            store,
            config,
            system: System::new(),
            scope,
        }
    }

    fn payload(&self) -> String {
        "x".repeat(self.config.value_size)
    }

    fn tag_names(&self) -> Vec<String> {
        (0..self.config.tags_per_entry)
            .map(|i| format!("{}:tag{}", self.scope, i))
            .collect()
    }

    fn guard_memory(&mut self) -> CacheResult<()> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Ok(());
        }
        let available = self.system.available_memory();
        let used_percent = ((total - available) as f64 / total as f64) * 100.0;
        if used_percent > self.config.memory_limit_percent {
            return Err(CacheError::MemoryPressure {
                used_percent,
                limit_percent: self.config.memory_limit_percent,
            });
        }
        Ok(())
    }

    /// Run every scenario in order: write, read, bulk, flush.
    pub async fn run(&mut self) -> CacheResult<BenchReport> {
        let mode = self.store.mode();
        let mut scenarios = Vec::new();

        scenarios.push(self.write_scenario().await?);
        scenarios.push(self.read_scenario().await?);
        scenarios.push(self.bulk_scenario().await?);
        scenarios.push(self.flush_scenario().await?);

        // Leave nothing behind.
        let names = self.tag_names();
        let tag_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.store.tags(&tag_refs).flush().await?;

        info!(mode = mode.as_str(), scenarios = scenarios.len(), "benchmark finished");
        Ok(BenchReport { mode, scenarios })
    }

    async fn write_scenario(&mut self) -> CacheResult<ScenarioResult> {
        let names = self.tag_names();
        let tag_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let tagged = self.store.tags(&tag_refs);
        let payload = self.payload();

        let started = Instant::now();
        for i in 0..self.config.iterations {
            if i % MEMORY_CHECK_INTERVAL == 0 {
                self.guard_memory()?;
            }
            tagged
                .put(&format!("{}:w{}", self.scope, i), &payload, self.config.ttl)
                .await?;
        }
        Ok(ScenarioResult {
            name: "tagged write",
            operations: self.config.iterations,
            elapsed: started.elapsed(),
        })
    }

    async fn read_scenario(&mut self) -> CacheResult<ScenarioResult> {
        let names = self.tag_names();
        let tag_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let tagged = self.store.tags(&tag_refs);

        let started = Instant::now();
        for i in 0..self.config.iterations {
            if i % MEMORY_CHECK_INTERVAL == 0 {
                self.guard_memory()?;
            }
            let key = format!("{}:w{}", self.scope, i);
            match self.store.mode() {
                // `any`-mode reads bypass tags by contract.
                TagMode::Any => {
                    let _ = self.store.get(&key).await?;
                }
                TagMode::All => {
                    let _: Option<String> = tagged.get(&key).await?;
                }
            }
        }
        Ok(ScenarioResult {
            name: "read",
            operations: self.config.iterations,
            elapsed: started.elapsed(),
        })
    }

    async fn bulk_scenario(&mut self) -> CacheResult<ScenarioResult> {
        let names = self.tag_names();
        let tag_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let tagged = self.store.tags(&tag_refs);
        let payload = self.payload();
        let batches = (self.config.iterations / self.config.bulk_size as u64).max(1);

        let started = Instant::now();
        for batch in 0..batches {
            self.guard_memory()?;
            let keys: Vec<String> = (0..self.config.bulk_size)
                .map(|i| format!("{}:b{}:{}", self.scope, batch, i))
                .collect();
            let entries: Vec<(&str, &String)> =
                keys.iter().map(|k| (k.as_str(), &payload)).collect();
            tagged.put_many(&entries, self.config.ttl).await?;
        }
        Ok(ScenarioResult {
            name: "bulk write",
            operations: batches * self.config.bulk_size as u64,
            elapsed: started.elapsed(),
        })
    }

    async fn flush_scenario(&mut self) -> CacheResult<ScenarioResult> {
        self.guard_memory()?;
        let names = self.tag_names();
        let tag_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let tagged = self.store.tags(&tag_refs);

        let started = Instant::now();
        tagged.flush().await?;
        Ok(ScenarioResult {
            name: "tag flush",
            operations: 1,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_per_sec() {
        let result = ScenarioResult {
            name: "write",
            operations: 500,
            elapsed: Duration::from_secs(2),
        };
        assert!((result.ops_per_sec() - 250.0).abs() < f64::EPSILON);

        let zero = ScenarioResult {
            name: "write",
            operations: 500,
            elapsed: Duration::from_secs(0),
        };
        assert_eq!(zero.ops_per_sec(), 0.0);
    }

    #[test]
    fn test_default_config_is_sane() {
        let config = BenchConfig::default();
        assert!(config.iterations >= 100);
        assert!(config.memory_limit_percent <= 100.0);
        assert!(config.bulk_size > 0);
    }
}
