//! Untagged store properties against a live Redis.
//!
//! These tests require a running Redis instance (REDIS_URL or
//! redis://127.0.0.1:6379) and are ignored by default.

use std::time::Duration;
use tagcache::serialize::serialize;
use tagcache::{CacheConfig, FlushMode, RedisConfig, RedisStore, Store, TagMode};

async fn store(prefix: &str) -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = CacheConfig::builder()
        .prefix(format!("tagcache-test:{}:", prefix))
        .mode(TagMode::Any)
        .flush_mode(FlushMode::ScanPrefix)
        .redis(RedisConfig::builder().url(url).build())
        .build();
    RedisStore::connect(config).await.unwrap()
}

#[tokio::test]
#[ignore] // requires Redis
async fn test_put_get_round_trip() {
    let store = store("round-trip").await;
    store.flush().await.unwrap();

    store
        .put("greet", &serialize(&"hello").unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    let value = store.get("greet").await.unwrap();
    assert_eq!(value, Some(b"\"hello\"".to_vec()));

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_expired_entries_read_as_absent() {
    let store = store("expiry").await;
    store.flush().await.unwrap();

    store
        .put("short", &serialize(&"v").unwrap(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(store.get("short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.get("short").await.unwrap(), None);
}

#[tokio::test]
#[ignore]
async fn test_add_inserts_only_when_absent() {
    let store = store("add").await;
    store.flush().await.unwrap();

    let first = store
        .add("u", &serialize(&"one").unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    let second = store
        .add("u", &serialize(&"two").unwrap(), Duration::from_secs(60))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(store.get("u").await.unwrap(), Some(b"\"one\"".to_vec()));

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_put_many_and_many_are_position_matched() {
    let store = store("bulk").await;
    store.flush().await.unwrap();

    let entries = vec![
        ("k1", serialize(&1i64).unwrap()),
        ("k2", serialize(&2i64).unwrap()),
        ("k3", serialize(&3i64).unwrap()),
    ];
    store.put_many(&entries, Duration::from_secs(60)).await.unwrap();

    let values = store.many(&["k1", "missing", "k3"]).await.unwrap();
    assert_eq!(
        values,
        vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
    );

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_counters_increment_natively() {
    let store = store("counter").await;
    store.flush().await.unwrap();

    store
        .put("cnt", &serialize(&0i64).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    let mut last = 0;
    for _ in 0..50 {
        last = store.increment("cnt", 1).await.unwrap();
    }
    assert_eq!(last, 50);
    assert_eq!(store.get("cnt").await.unwrap(), Some(b"50".to_vec()));

    assert_eq!(store.decrement("cnt", 8).await.unwrap(), 42);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_forget_reports_actual_removal() {
    let store = store("forget").await;
    store.flush().await.unwrap();

    store
        .put("gone", &serialize(&"v").unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(store.forget("gone").await.unwrap());
    assert!(!store.forget("gone").await.unwrap());
    assert!(!store.forget("never-existed").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_rapid_puts_are_last_writer_wins() {
    let store = store("ordered").await;
    store.flush().await.unwrap();

    for i in 1..=10i64 {
        store
            .put("k", &serialize(&i).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
    }
    assert_eq!(store.get("k").await.unwrap(), Some(b"10".to_vec()));

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_forever_has_no_server_ttl() {
    let store = store("forever").await;
    store.flush().await.unwrap();

    store.forever("pinned", &serialize(&"v").unwrap()).await.unwrap();
    let context = store.context();
    let wire = context.entry_key("pinned");
    let ttl: i64 = context
        .with_connection(|mut conn| async move {
            let result = redis::cmd("TTL").arg(&wire).query_async(&mut conn).await;
            (result, conn)
        })
        .await
        .unwrap();
    assert_eq!(ttl, -1);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_scan_prefix_flush_only_clears_own_keys() {
    let store_a = store("flush-a").await;
    let other = store("flush-b").await;
    store_a.flush().await.unwrap();
    other.flush().await.unwrap();

    store_a
        .put("mine", &serialize(&1i64).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    other
        .put("theirs", &serialize(&2i64).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();

    store_a.flush().await.unwrap();
    assert_eq!(store_a.get("mine").await.unwrap(), None);
    assert_eq!(other.get("theirs").await.unwrap(), Some(b"2".to_vec()));

    other.flush().await.unwrap();
}
