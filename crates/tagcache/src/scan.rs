//! SafeScan: cursor-owning keyspace iteration
//!
//! `SCAN`-family commands use an in/out cursor. Each iterator here owns
//! its cursor for its whole lifetime, so cursor state never leaks between
//! callers, and a page fetch is the only suspension point.
//!
//! Keys returned from `SCAN` arrive in wire form, carrying the driver
//! prefix that key builders prepend themselves. The stripping helpers at
//! the bottom convert scanned keys back to logical names before they are
//! fed to code that would re-add the prefix (the double-prefix hazard).

use crate::context::{RedisConn, StoreContext, TAG_SUFFIX};
use crate::CacheResult;
use redis::aio::ConnectionLike;
use redis::RedisResult;
use std::collections::HashSet;

/// Page size requested from `SCAN`/`HSCAN`/`ZSCAN`.
const SCAN_COUNT: usize = 1000;

/// Keyspace iterator over `SCAN MATCH pattern`.
pub struct SafeScan {
    pattern: String,
    cursor: u64,
    started: bool,
}

impl SafeScan {
    pub fn new<S: Into<String>>(pattern: S) -> Self {
        Self {
            pattern: pattern.into(),
            cursor: 0,
            started: false,
        }
    }

    /// Fetch the next page of matching keys; empty pages are possible
    /// mid-iteration. Check [`SafeScan::is_done`] to terminate.
    pub async fn next_page<C>(&mut self, conn: &mut C) -> RedisResult<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(self.cursor)
            .arg("MATCH")
            .arg(&self.pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        self.cursor = cursor;
        self.started = true;
        Ok(keys)
    }

    pub fn is_done(&self) -> bool {
        self.started && self.cursor == 0
    }
}

/// Field iterator over `HSCAN`.
pub struct HashScan {
    key: String,
    cursor: u64,
    started: bool,
}

impl HashScan {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            cursor: 0,
            started: false,
        }
    }

    /// Fetch the next page of `(field, value)` pairs.
    pub async fn next_page<C>(&mut self, conn: &mut C) -> RedisResult<Vec<(String, String)>>
    where
        C: ConnectionLike + Send,
    {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let (cursor, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(&self.key)
            .arg(self.cursor)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        self.cursor = cursor;
        self.started = true;
        Ok(pair_up(flat))
    }

    pub fn is_done(&self) -> bool {
        self.started && self.cursor == 0
    }
}

/// Member iterator over `ZSCAN`.
pub struct ZsetScan {
    key: String,
    cursor: u64,
    started: bool,
}

impl ZsetScan {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            cursor: 0,
            started: false,
        }
    }

    /// Fetch the next page of `(member, score)` pairs.
    pub async fn next_page<C>(&mut self, conn: &mut C) -> RedisResult<Vec<(String, f64)>>
    where
        C: ConnectionLike + Send,
    {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let (cursor, flat): (u64, Vec<String>) = redis::cmd("ZSCAN")
            .arg(&self.key)
            .arg(self.cursor)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        self.cursor = cursor;
        self.started = true;
        Ok(pair_up(flat)
            .into_iter()
            .map(|(member, score)| {
                let score = score.parse::<f64>().unwrap_or(0.0);
                (member, score)
            })
            .collect())
    }

    pub fn is_done(&self) -> bool {
        self.started && self.cursor == 0
    }
}

fn pair_up(flat: Vec<String>) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
        pairs.push((a, b));
    }
    pairs
}

/// Collect every key matching `pattern`, walking all master nodes in
/// cluster mode. Results are deduplicated: a resharding cluster can hand
/// the same key back from two nodes.
pub async fn scan_matching(ctx: &StoreContext, pattern: &str) -> CacheResult<Vec<String>> {
    let mut seen: HashSet<String> = HashSet::new();

    if ctx.is_cluster() {
        for url in ctx.config().redis.node_urls() {
            let mut conn = ctx.node_connection(&url).await?;
            let mut scan = SafeScan::new(pattern);
            while !scan.is_done() {
                for key in scan
                    .next_page(&mut conn)
                    .await
                    .map_err(crate::CacheError::from_redis)?
                {
                    seen.insert(key);
                }
            }
        }
    } else {
        let pattern = pattern.to_string();
        let keys = ctx
            .with_connection(|mut conn: RedisConn| async move {
                let result = async {
                    let mut scan = SafeScan::new(&pattern);
                    let mut keys = Vec::new();
                    while !scan.is_done() {
                        keys.extend(scan.next_page(&mut conn).await?);
                    }
                    Ok(keys)
                }
                .await;
                (result, conn)
            })
            .await?;
        seen.extend(keys);
    }

    Ok(seen.into_iter().collect())
}

/// Strip the driver-level prefix from a scanned wire key. Keys that do
/// not carry the prefix pass through unchanged.
pub fn strip_opt_prefix<'a>(opt_prefix: &str, key: &'a str) -> &'a str {
    key.strip_prefix(opt_prefix).unwrap_or(key)
}

/// Recover the tag name from a scanned `all`-mode sorted-set key, given
/// the context's entry prefix (`opt ‖ P`).
pub fn all_tag_name(entry_prefix: &str, wire_key: &str) -> Option<String> {
    wire_key
        .strip_prefix(entry_prefix)
        .and_then(|rest| rest.strip_prefix("tag:"))
        .and_then(|rest| rest.strip_suffix(TAG_SUFFIX))
        .map(|name| name.to_string())
}

/// Recover the tag name from a scanned `any`-mode hash key, given the
/// context's `any`-tag prefix (`opt ‖ P ‖ "_erc:tag:"`).
pub fn any_tag_name(any_tag_prefix: &str, wire_key: &str) -> Option<String> {
    wire_key
        .strip_prefix(any_tag_prefix)
        .and_then(|rest| rest.strip_suffix(TAG_SUFFIX))
        .map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{Cmd, Pipeline, RedisFuture, Value};
    use std::collections::VecDeque;

    struct FakeConn {
        replies: VecDeque<Value>,
    }

    impl ConnectionLike for FakeConn {
        fn req_packed_command<'a>(&'a mut self, _cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            let reply = self.replies.pop_front().expect("unexpected command");
            Box::pin(async move { Ok(reply) })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn scan_reply(cursor: &str, keys: &[&str]) -> Value {
        Value::Array(vec![
            Value::BulkString(cursor.as_bytes().to_vec()),
            Value::Array(
                keys.iter()
                    .map(|k| Value::BulkString(k.as_bytes().to_vec()))
                    .collect(),
            ),
        ])
    }

    #[tokio::test]
    async fn test_scan_cursor_is_confined_to_the_iterator() {
        let mut conn = FakeConn {
            replies: VecDeque::from(vec![
                scan_reply("17", &["a", "b"]),
                scan_reply("0", &["c"]),
            ]),
        };

        let mut scan = SafeScan::new("app:tag:*:entries");
        assert!(!scan.is_done());
        let first = scan.next_page(&mut conn).await.unwrap();
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);
        assert!(!scan.is_done());
        let second = scan.next_page(&mut conn).await.unwrap();
        assert_eq!(second, vec!["c".to_string()]);
        assert!(scan.is_done());
        // Exhausted iterators stop issuing commands.
        assert!(scan.next_page(&mut conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zscan_parses_scores() {
        let mut conn = FakeConn {
            replies: VecDeque::from(vec![scan_reply("0", &["k1", "1754000000", "k2", "-1"])]),
        };
        let mut scan = ZsetScan::new("app:tag:posts:entries");
        let page = scan.next_page(&mut conn).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0], ("k1".to_string(), 1_754_000_000.0));
        assert_eq!(page[1], ("k2".to_string(), -1.0));
    }

    #[test]
    fn test_tag_name_recovery() {
        assert_eq!(
            all_tag_name("driver:app:", "driver:app:tag:posts:entries"),
            Some("posts".to_string())
        );
        assert_eq!(
            any_tag_name("driver:app:_erc:tag:", "driver:app:_erc:tag:posts:entries"),
            Some("posts".to_string())
        );
        // The registry key has no ":entries" suffix and is not a tag hash.
        assert_eq!(
            any_tag_name("driver:app:_erc:tag:", "driver:app:_erc:tag:registry"),
            None
        );
        // Keys from another keyspace never match.
        assert_eq!(all_tag_name("driver:app:", "other:tag:x:entries"), None);
    }

    #[test]
    fn test_strip_opt_prefix_round_trip() {
        // SCAN hands back wire keys; stripping prevents the double-prefix
        // hazard when the key is fed to a builder that re-adds it.
        assert_eq!(strip_opt_prefix("driver:", "driver:app:k"), "app:k");
        assert_eq!(strip_opt_prefix("driver:", "app:k"), "app:k");
        assert_eq!(strip_opt_prefix("", "app:k"), "app:k");
    }

    #[test]
    fn test_pair_up_drops_trailing_odd_element() {
        let pairs = pair_up(vec!["a".into(), "1".into(), "b".into()]);
        assert_eq!(pairs, vec![("a".to_string(), "1".to_string())]);
    }
}
