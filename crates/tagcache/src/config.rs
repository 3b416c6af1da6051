//! Cache configuration and builders

use crate::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tagging mode selected for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    /// Intersection semantics: tagged reads require the same tag set that
    /// was used to write; flush removes entries carrying all given tags.
    All,
    /// Union semantics: tags are write/flush metadata only; flush removes
    /// entries carrying any given tag. Requires Redis 8.0+ (`HSETEX`).
    Any,
}

impl TagMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagMode::All => "all",
            TagMode::Any => "any",
        }
    }
}

impl std::str::FromStr for TagMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(TagMode::All),
            "any" => Ok(TagMode::Any),
            other => Err(CacheError::Configuration(format!(
                "unknown tag mode '{}', expected 'all' or 'any'",
                other
            ))),
        }
    }
}

/// Policy for the untagged `flush()` operation.
///
/// `FlushDb` issues `FLUSHDB` and therefore clears the whole logical
/// database, including keys the cache does not own. Deployments sharing a
/// Redis database with other data should select `ScanPrefix`, which walks
/// `prefix*` and deletes in chunks instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    #[default]
    FlushDb,
    ScanPrefix,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL. In cluster mode this may be a comma-separated list
    /// of node URLs, e.g. `redis://host1:6379,host2:6379`.
    pub url: String,

    /// Treat the deployment as a Redis Cluster.
    pub cluster: bool,

    /// Connection pool size.
    pub pool_size: u32,

    /// Timeout for establishing a connection.
    pub connection_timeout: Duration,

    /// Socket-level response timeout inherited by all commands.
    pub response_timeout: Duration,

    /// Number of cluster retry attempts before a command fails.
    pub retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            cluster: false,
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(1),
            retries: 3,
        }
    }
}

impl RedisConfig {
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Node URLs for cluster mode, split from [`RedisConfig::url`].
    pub fn node_urls(&self) -> Vec<String> {
        self.url
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with("redis://") || s.starts_with("rediss://") {
                    s.to_string()
                } else {
                    format!("redis://{}", s)
                }
            })
            .collect()
    }
}

/// Redis configuration builder
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn cluster(mut self, cluster: bool) -> Self {
        self.config.cluster = cluster;
        self
    }

    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn build(self) -> RedisConfig {
        self.config
    }
}

/// Cache engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Caller-supplied cache prefix `P`, composed into every key.
    pub prefix: String,

    /// Additional driver-level prefix prepended to command keys but not to
    /// `SCAN` patterns. Keys returned from `SCAN` carry it and must be
    /// stripped before reuse (the double-prefix hazard).
    pub opt_prefix: Option<String>,

    /// Tagging mode for `tags()`.
    pub mode: TagMode,

    /// Policy for the untagged `flush()`.
    pub flush_mode: FlushMode,

    /// Compress values above the threshold on the Lua argument path.
    pub compression: bool,

    /// Compression threshold in bytes.
    pub compression_threshold: usize,

    /// Redis connection settings.
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "cache:".to_string(),
            opt_prefix: None,
            mode: TagMode::Any,
            flush_mode: FlushMode::default(),
            compression: false,
            compression_threshold: 1024,
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Build a configuration from the process environment.
    ///
    /// `CACHE_DRIVER` must name a Redis-backed store (`redis` or `valkey`);
    /// `CACHE_PREFIX` supplies the cache prefix, `REDIS_URL` the endpoint,
    /// `CACHE_TAG_MODE` the tagging mode. No other environment is consulted.
    pub fn from_env() -> CacheResult<Self> {
        let driver = std::env::var("CACHE_DRIVER").unwrap_or_else(|_| "redis".to_string());
        match driver.as_str() {
            "redis" | "valkey" => {}
            other => {
                return Err(CacheError::Configuration(format!(
                    "store '{}' is not Redis-backed",
                    other
                )))
            }
        }

        let mut builder = Self::builder();
        if let Ok(prefix) = std::env::var("CACHE_PREFIX") {
            builder = builder.prefix(prefix);
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.redis(RedisConfig::builder().url(url).build());
        }
        if let Ok(mode) = std::env::var("CACHE_TAG_MODE") {
            builder = builder.mode(mode.parse()?);
        }
        Ok(builder.build())
    }
}

/// Cache configuration builder
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn opt_prefix<S: Into<String>>(mut self, prefix: Option<S>) -> Self {
        self.config.opt_prefix = prefix.map(|p| p.into());
        self
    }

    pub fn mode(mut self, mode: TagMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn enable_compression(mut self, threshold: usize) -> Self {
        self.config.compression = true;
        self.config.compression_threshold = threshold;
        self
    }

    pub fn disable_compression(mut self) -> Self {
        self.config.compression = false;
        self
    }

    pub fn redis(mut self, redis: RedisConfig) -> Self {
        self.config.redis = redis;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.prefix, "cache:");
        assert_eq!(config.mode, TagMode::Any);
        assert_eq!(config.flush_mode, FlushMode::FlushDb);
        assert!(!config.compression);
        assert!(!config.redis.cluster);
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .prefix("app:")
            .opt_prefix(Some("driver:"))
            .mode(TagMode::All)
            .flush_mode(FlushMode::ScanPrefix)
            .enable_compression(2048)
            .redis(
                RedisConfig::builder()
                    .url("redis://localhost:6380")
                    .pool_size(20)
                    .cluster(true)
                    .build(),
            )
            .build();

        assert_eq!(config.prefix, "app:");
        assert_eq!(config.opt_prefix.as_deref(), Some("driver:"));
        assert_eq!(config.mode, TagMode::All);
        assert_eq!(config.flush_mode, FlushMode::ScanPrefix);
        assert!(config.compression);
        assert_eq!(config.compression_threshold, 2048);
        assert!(config.redis.cluster);
        assert_eq!(config.redis.pool_size, 20);
    }

    #[test]
    fn test_tag_mode_parsing() {
        assert_eq!("all".parse::<TagMode>().unwrap(), TagMode::All);
        assert_eq!("ANY".parse::<TagMode>().unwrap(), TagMode::Any);
        assert!("both".parse::<TagMode>().is_err());
    }

    #[test]
    fn test_cluster_node_urls() {
        let config = RedisConfig::builder()
            .url("redis://host1:6379, host2:6379,rediss://host3:6380")
            .cluster(true)
            .build();

        let nodes = config.node_urls();
        assert_eq!(
            nodes,
            vec![
                "redis://host1:6379".to_string(),
                "redis://host2:6379".to_string(),
                "rediss://host3:6380".to_string(),
            ]
        );
    }
}
