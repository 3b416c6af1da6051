use crate::commands::connect_store;
use std::sync::Arc;
use tagcache::{CacheError, CacheResult, Doctor};

pub async fn run(store: Option<&str>) -> CacheResult<()> {
    let store = Arc::new(connect_store(store).await?);
    println!(
        "Running tagged cache diagnostics (mode: {})...\n",
        store.mode().as_str()
    );

    let report = Doctor::new(store).run().await;
    for outcome in &report.outcomes {
        let marker = if outcome.passed { "PASS" } else { "FAIL" };
        if outcome.passed {
            println!("  [{}] {}", marker, outcome.name);
        } else {
            println!("  [{}] {} - {}", marker, outcome.name, outcome.detail);
        }
    }
    println!(
        "\n{} checks, {} failed",
        report.outcomes.len(),
        report.failed_count()
    );

    if !report.passed() {
        return Err(CacheError::Configuration(format!(
            "{} doctor checks failed",
            report.failed_count()
        )));
    }
    Ok(())
}
