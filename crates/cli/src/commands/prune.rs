use crate::commands::{connect_store, print_table};
use tagcache::{CacheError, CacheResult, Pruner};

pub async fn run(store: Option<&str>) -> CacheResult<()> {
    let store = connect_store(store).await?;
    let report = Pruner::new(store.context()).run().await?;

    let rows: Vec<(String, String)> = report
        .rows()
        .into_iter()
        .map(|(metric, value)| (metric.to_string(), value.to_string()))
        .collect();
    print_table(&rows);

    if report.failures() > 0 {
        return Err(CacheError::Configuration(format!(
            "{} tag structures could not be pruned",
            report.failures()
        )));
    }
    Ok(())
}
