pub mod bench;
pub mod doctor;
pub mod prune;

use tagcache::{CacheConfig, CacheError, CacheResult, RedisStore};

/// Resolve the target store: the positional argument wins over
/// `CACHE_DRIVER`; anything that is not Redis-backed is an error.
pub(crate) async fn connect_store(store: Option<&str>) -> CacheResult<RedisStore> {
    if let Some(driver) = store {
        match driver {
            "redis" | "valkey" => {}
            other => {
                return Err(CacheError::Configuration(format!(
                    "store '{}' is not Redis-backed",
                    other
                )))
            }
        }
    }
    let config = CacheConfig::from_env()?;
    RedisStore::connect(config).await
}

/// Print a two-column Metric/Value table.
pub(crate) fn print_table(rows: &[(String, String)]) {
    let width = rows
        .iter()
        .map(|(metric, _)| metric.len())
        .max()
        .unwrap_or(0)
        .max("Metric".len());

    println!("{:<width$}  {}", "Metric", "Value", width = width);
    println!("{:<width$}  {}", "------", "-----", width = width);
    for (metric, value) in rows {
        println!("{:<width$}  {}", metric, value, width = width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_redis_store_is_rejected() {
        // The driver check happens before any connection is dialed.
        let err = connect_store(Some("database")).await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert!(err.to_string().contains("not Redis-backed"));
    }

    #[tokio::test]
    async fn test_file_store_is_rejected() {
        let err = connect_store(Some("file")).await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }
}
