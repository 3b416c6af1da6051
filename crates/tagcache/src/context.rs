//! Store context: connection ownership and key-name computation
//!
//! All Redis traffic flows through [`StoreContext::with_connection`]: a
//! connection is taken from the pool, handed exclusively to the callback,
//! and returned on every exit path, success or failure. Socket timeouts
//! are configured on the connections themselves; no engine-level timeout
//! is layered on top.
//!
//! Every key builder here produces the full wire key, i.e. the optional
//! driver-level prefix followed by the cache prefix `P` and the well-known
//! infixes of the data model. `SCAN` results therefore come back in wire
//! form; see [`crate::scan`] for the stripping utilities.

use crate::config::CacheConfig;
use crate::{CacheError, CacheResult};
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;
use redis::{Client, Cmd, IntoConnectionInfo, Pipeline, RedisFuture, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// Infix for `all`-mode tag sorted sets: `P ‖ "tag:" ‖ name ‖ ":entries"`.
const ALL_TAG_INFIX: &str = "tag:";

/// Infix for `any`-mode tag hashes and the registry.
const ANY_TAG_INFIX: &str = "_erc:tag:";

/// Suffix shared by both tag structures.
pub(crate) const TAG_SUFFIX: &str = ":entries";

/// Suffix of an `any`-mode reverse index: `P ‖ K ‖ ":_erc:tags"`.
const REVERSE_INDEX_SUFFIX: &str = ":_erc:tags";

/// Member name of the `any`-mode tag registry.
const REGISTRY_NAME: &str = "registry";

/// A live connection to either a standalone server or a cluster.
///
/// Both variants implement the async command trait, so commands,
/// pipelines, and script invocations run identically on either; the
/// delegating [`ConnectionLike`] impl below keeps call sites free of
/// per-variant match arms.
pub enum RedisConn {
    Standalone(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConn::Standalone(c) => c.req_packed_command(cmd),
            RedisConn::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConn::Standalone(c) => c.req_packed_commands(cmd, offset, count),
            RedisConn::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConn::Standalone(c) => c.get_db(),
            RedisConn::Cluster(c) => c.get_db(),
        }
    }
}

enum ClientHandle {
    Standalone(Client),
    Cluster(ClusterClient),
}

/// Owns the channel to Redis and exposes key-name computation.
pub struct StoreContext {
    config: CacheConfig,
    client: ClientHandle,
    pool: Mutex<Vec<RedisConn>>,
}

impl StoreContext {
    /// Build the client and an empty pool without dialing the server.
    /// Connections are created lazily on first [`StoreContext::acquire`].
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        let client = if config.redis.cluster {
            let nodes = config.redis.node_urls();
            if nodes.is_empty() {
                return Err(CacheError::Configuration(
                    "no cluster nodes specified in URL".to_string(),
                ));
            }
            let infos = nodes
                .iter()
                .map(|n| n.as_str().into_connection_info())
                .collect::<Result<Vec<_>, _>>()
                .map_err(CacheError::Redis)?;
            let builder = ClusterClientBuilder::new(infos)
                .retries(config.redis.retries)
                .connection_timeout(config.redis.connection_timeout)
                .response_timeout(config.redis.response_timeout);
            ClientHandle::Cluster(builder.build().map_err(CacheError::Redis)?)
        } else {
            ClientHandle::Standalone(
                Client::open(config.redis.url.as_str()).map_err(CacheError::Redis)?,
            )
        };

        Ok(Self {
            config,
            client,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Build the client and probe the server once, so misconfiguration
    /// surfaces at startup rather than on the first cache call.
    pub async fn connect(config: CacheConfig) -> CacheResult<Self> {
        let context = Self::new(config)?;
        let mut conn = context.acquire().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::from_redis)?;
        debug!(pong = %pong, cluster = context.is_cluster(), "redis connection established");
        context.release(conn).await;
        Ok(context)
    }

    /// Acquire a connection: reuse from the pool or dial a fresh one.
    pub async fn acquire(&self) -> CacheResult<RedisConn> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(conn) = pool.pop() {
                return Ok(conn);
            }
        }

        match &self.client {
            ClientHandle::Standalone(client) => {
                let conn = client
                    .get_multiplexed_async_connection_with_timeouts(
                        self.config.redis.response_timeout,
                        self.config.redis.connection_timeout,
                    )
                    .await
                    .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?;
                Ok(RedisConn::Standalone(conn))
            }
            ClientHandle::Cluster(client) => {
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?;
                Ok(RedisConn::Cluster(conn))
            }
        }
    }

    /// Return a connection to the pool, dropping it when the pool is full.
    pub async fn release(&self, conn: RedisConn) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.redis.pool_size as usize {
            pool.push(conn);
        }
    }

    /// Run `operation` with an exclusive pooled connection. The callback
    /// hands the connection back alongside its result, so the release
    /// happens on failure paths too.
    pub async fn with_connection<F, Fut, R>(&self, operation: F) -> CacheResult<R>
    where
        F: FnOnce(RedisConn) -> Fut,
        Fut: std::future::Future<Output = (redis::RedisResult<R>, RedisConn)>,
    {
        let conn = self.acquire().await?;
        let (result, conn) = operation(conn).await;
        self.release(conn).await;
        result.map_err(CacheError::from_redis)
    }

    /// Open a direct connection to a single node, bypassing the cluster
    /// router. Used by the pruner to walk each master's keyspace.
    pub async fn node_connection(&self, url: &str) -> CacheResult<MultiplexedConnection> {
        let client = Client::open(url).map_err(CacheError::Redis)?;
        client
            .get_multiplexed_async_connection_with_timeouts(
                self.config.redis.response_timeout,
                self.config.redis.connection_timeout,
            )
            .await
            .map_err(|e| CacheError::StoreUnavailable(e.to_string()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fixed at construction; true forces the sequential-command paths in
    /// every multi-key operation.
    pub fn is_cluster(&self) -> bool {
        matches!(self.client, ClientHandle::Cluster(_))
    }

    /// The caller-supplied cache prefix `P`.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// The driver-level prefix, empty when unset. Prepended to command
    /// keys and to `SCAN` patterns built here, and present on keys that
    /// `SCAN` returns.
    pub fn opt_prefix(&self) -> &str {
        self.config.opt_prefix.as_deref().unwrap_or("")
    }

    /// Wire prefix of every cache entry: `opt_prefix ‖ P`. Also the Lua
    /// argument used to recover the bare key inside scripts.
    pub fn entry_prefix(&self) -> String {
        format!("{}{}", self.opt_prefix(), self.prefix())
    }

    /// Wire key of an untagged (or `any`-mode) entry: `opt ‖ P ‖ K`.
    pub fn entry_key(&self, key: &str) -> String {
        format!("{}{}", self.entry_prefix(), key)
    }

    /// Wire key of an `all`-mode tagged entry:
    /// `opt ‖ P ‖ sha1(tag_ids joined by '|') ‖ ':' ‖ K`.
    pub fn namespaced_entry_key(&self, digest: &str, key: &str) -> String {
        format!("{}{}:{}", self.entry_prefix(), digest, key)
    }

    /// Wire key of an `all`-mode tag sorted set:
    /// `opt ‖ P ‖ "tag:" ‖ name ‖ ":entries"`.
    pub fn tag_zset_key(&self, name: &str) -> String {
        format!(
            "{}{}{}{}",
            self.entry_prefix(),
            ALL_TAG_INFIX,
            name,
            TAG_SUFFIX
        )
    }

    /// Wire key of an `any`-mode tag hash:
    /// `opt ‖ P ‖ "_erc:tag:" ‖ name ‖ ":entries"`.
    pub fn tag_hash_key(&self, name: &str) -> String {
        format!("{}{}{}", self.any_tag_prefix(), name, TAG_SUFFIX)
    }

    /// Wire key of an `any`-mode reverse index:
    /// `opt ‖ P ‖ K ‖ ":_erc:tags"`.
    pub fn reverse_index_key(&self, key: &str) -> String {
        format!("{}{}", self.entry_key(key), REVERSE_INDEX_SUFFIX)
    }

    /// Wire key of the `any`-mode tag registry:
    /// `opt ‖ P ‖ "_erc:tag:registry"`.
    pub fn registry_key(&self) -> String {
        format!("{}{}", self.any_tag_prefix(), REGISTRY_NAME)
    }

    /// Wire prefix shared by `any`-mode tag structures, also passed into
    /// Lua so scripts can rebuild tag keys: `opt ‖ P ‖ "_erc:tag:"`.
    pub fn any_tag_prefix(&self) -> String {
        format!("{}{}", self.entry_prefix(), ANY_TAG_INFIX)
    }

    /// `SCAN` pattern matching every `all`-mode tag sorted set.
    pub fn all_tag_scan_pattern(&self) -> String {
        format!("{}{}*{}", self.entry_prefix(), ALL_TAG_INFIX, TAG_SUFFIX)
    }

    /// `SCAN` pattern matching every `any`-mode tag hash (the registry
    /// does not carry the `:entries` suffix and is excluded).
    pub fn any_tag_scan_pattern(&self) -> String {
        format!("{}*{}", self.any_tag_prefix(), TAG_SUFFIX)
    }

    /// Current epoch seconds, the clock every expiry score derives from.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn context_with(prefix: &str, opt: Option<&str>) -> StoreContext {
        // Key computation needs no live server.
        let config = CacheConfig::builder()
            .prefix(prefix)
            .opt_prefix(opt)
            .build();
        StoreContext::new(config).unwrap()
    }

    #[test]
    fn test_key_contract_without_opt_prefix() {
        let ctx = context_with("app:", None);
        assert_eq!(ctx.entry_key("user:1"), "app:user:1");
        assert_eq!(ctx.tag_zset_key("posts"), "app:tag:posts:entries");
        assert_eq!(ctx.tag_hash_key("posts"), "app:_erc:tag:posts:entries");
        assert_eq!(ctx.reverse_index_key("user:1"), "app:user:1:_erc:tags");
        assert_eq!(ctx.registry_key(), "app:_erc:tag:registry");
        assert_eq!(
            ctx.namespaced_entry_key("da39a3ee", "user:1"),
            "app:da39a3ee:user:1"
        );
    }

    #[test]
    fn test_key_contract_with_opt_prefix() {
        let ctx = context_with("app:", Some("driver:"));
        assert_eq!(ctx.entry_key("k"), "driver:app:k");
        assert_eq!(ctx.registry_key(), "driver:app:_erc:tag:registry");
        assert_eq!(ctx.all_tag_scan_pattern(), "driver:app:tag:*:entries");
        assert_eq!(ctx.any_tag_scan_pattern(), "driver:app:_erc:tag:*:entries");
    }

    #[test]
    fn test_registry_excluded_from_hash_scan_pattern() {
        let ctx = context_with("app:", None);
        // The registry key must not match the tag-hash pattern, or the
        // pruner would treat it as a tag structure.
        assert!(!ctx.registry_key().ends_with(TAG_SUFFIX));
    }

    #[test]
    fn test_standalone_is_not_cluster() {
        let ctx = context_with("app:", None);
        assert!(!ctx.is_cluster());
    }
}
