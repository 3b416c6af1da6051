use crate::commands::{connect_store, print_table};
use std::sync::Arc;
use tagcache::{BenchConfig, Benchmark, CacheResult};

pub async fn run(
    store: Option<&str>,
    iterations: u64,
    value_size: usize,
    memory_limit: f64,
) -> CacheResult<()> {
    let store = Arc::new(connect_store(store).await?);
    let config = BenchConfig {
        iterations,
        value_size,
        memory_limit_percent: memory_limit,
        ..BenchConfig::default()
    };

    println!(
        "Benchmarking (mode: {}, {} ops/scenario, {}-byte values)...\n",
        store.mode().as_str(),
        iterations,
        value_size
    );

    let mut benchmark = Benchmark::new(store, config);
    let report = benchmark.run().await?;

    let rows: Vec<(String, String)> = report
        .scenarios
        .iter()
        .map(|s| {
            (
                s.name.to_string(),
                format!("{:.0} ops/sec ({} ops)", s.ops_per_sec(), s.operations),
            )
        })
        .collect();
    print_table(&rows);

    Ok(())
}
