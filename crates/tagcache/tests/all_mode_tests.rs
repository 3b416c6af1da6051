//! Intersection (`all`) mode properties against a live Redis.
//!
//! Ignored by default; any Redis 6.2+ will do (no `HSETEX` needed here).

use std::time::Duration;
use tagcache::{
    CacheConfig, FlushMode, PruneReport, Pruner, RedisConfig, RedisStore, Store, TagMode,
};

async fn store(prefix: &str) -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = CacheConfig::builder()
        .prefix(format!("tagcache-all:{}:", prefix))
        .mode(TagMode::All)
        .flush_mode(FlushMode::ScanPrefix)
        .redis(RedisConfig::builder().url(url).build())
        .build();
    RedisStore::connect(config).await.unwrap()
}

#[tokio::test]
#[ignore] // requires Redis
async fn test_reads_are_scoped_by_tag_set() {
    let store = store("scoping").await;
    store.flush().await.unwrap();

    let both = store.tags(&["a", "b"]);
    both.put("x", &"1", Duration::from_secs(60)).await.unwrap();

    let scoped: Option<String> = both.get("x").await.unwrap();
    assert_eq!(scoped.as_deref(), Some("1"));

    // A different subset forms a different namespace and misses.
    let subset: Option<String> = store.tags(&["a"]).get("x").await.unwrap();
    assert_eq!(subset, None);

    // Argument order does not matter: the digest is canonical.
    let reordered: Option<String> = store.tags(&["b", "a"]).get("x").await.unwrap();
    assert_eq!(reordered.as_deref(), Some("1"));

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_flush_honours_intersection_semantics() {
    let store = store("intersect").await;
    store.flush().await.unwrap();

    let both = store.tags(&["a", "b"]);
    both.put("x", &"1", Duration::from_secs(60)).await.unwrap();

    // A subset flush cannot reach the {a,b}-namespaced entry.
    store.tags(&["a"]).flush().await.unwrap();
    assert_eq!(both.get::<String>("x").await.unwrap().as_deref(), Some("1"));

    // The exact set removes it.
    both.flush().await.unwrap();
    assert_eq!(both.get::<String>("x").await.unwrap(), None);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_ttl_expiry_leaves_stale_reference_for_prune() {
    let store = store("stale").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["t"]);
    tagged.put("k", &"v", Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The entry expired naturally; the sorted-set member went stale but
    // is still present.
    assert_eq!(tagged.get::<String>("k").await.unwrap(), None);
    assert!(tagged.entries().await.unwrap().contains(&"k".to_string()));

    let report = Pruner::new(store.context()).run().await.unwrap();
    match report {
        PruneReport::All(r) => {
            assert!(r.tags_scanned >= 1);
            assert!(r.entries_removed >= 1);
            assert_eq!(r.failures, 0);
        }
        PruneReport::Any(_) => panic!("wrong report shape for all mode"),
    }

    assert!(!tagged.entries().await.unwrap().contains(&"k".to_string()));

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_prune_deletes_emptied_sorted_sets() {
    let store = store("empty-sets").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["solo"]);
    tagged.put("k", &"v", Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let report = Pruner::new(store.context()).run().await.unwrap();
    match report {
        PruneReport::All(r) => assert!(r.empty_sets_deleted >= 1),
        PruneReport::Any(_) => panic!("wrong report shape for all mode"),
    }

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_flush_stale_preserves_forever_members() {
    let store = store("flush-stale").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["mixed"]);
    tagged.put("short", &"v", Duration::from_secs(1)).await.unwrap();
    tagged.forever("pinned", &"v").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let entries = tagged.entries().await.unwrap();
    assert!(entries.contains(&"short".to_string()));
    assert!(entries.contains(&"pinned".to_string()));

    // ZREMRANGEBYSCORE 0 now: stale members go, forever (-1) stays.
    let tag_set = tagged.tag_set().clone();
    let ops = tagcache::TagOps::for_context(store.context());
    let removed = ops.flush_stale(&tag_set).await.unwrap();
    assert!(removed >= 1);

    let entries = tagged.entries().await.unwrap();
    assert!(!entries.contains(&"short".to_string()));
    assert!(entries.contains(&"pinned".to_string()));
    assert_eq!(
        tagged.get::<String>("pinned").await.unwrap().as_deref(),
        Some("v")
    );

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_add_references_tags_only_on_insert() {
    let store = store("add-refs").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["guarded"]);
    assert!(tagged.add("k", &"one", Duration::from_secs(60)).await.unwrap());
    assert!(!tagged.add("k", &"two", Duration::from_secs(60)).await.unwrap());

    assert_eq!(tagged.get::<String>("k").await.unwrap().as_deref(), Some("one"));
    let entries = tagged.entries().await.unwrap();
    assert_eq!(entries.iter().filter(|e| e.as_str() == "k").count(), 1);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_pull_and_has() {
    let store = store("pull").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["p"]);
    tagged.put("k", &"v", Duration::from_secs(60)).await.unwrap();

    assert!(tagged.has("k").await.unwrap());
    let pulled: Option<String> = tagged.pull("k").await.unwrap();
    assert_eq!(pulled.as_deref(), Some("v"));
    assert!(!tagged.has("k").await.unwrap());
    assert_eq!(tagged.pull::<String>("k").await.unwrap(), None);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_entries_is_the_deduplicated_union() {
    let store = store("union").await;
    store.flush().await.unwrap();

    store
        .tags(&["a"])
        .put("only-a", &"1", Duration::from_secs(60))
        .await
        .unwrap();
    store
        .tags(&["b"])
        .put("only-b", &"2", Duration::from_secs(60))
        .await
        .unwrap();
    store
        .tags(&["a", "b"])
        .put("shared", &"3", Duration::from_secs(60))
        .await
        .unwrap();

    let mut entries = store.tags(&["a", "b"]).entries().await.unwrap();
    entries.sort();
    assert_eq!(entries, vec!["only-a", "only-b", "shared"]);

    store.flush().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_tagged_counters_round_trip() {
    let store = store("counters").await;
    store.flush().await.unwrap();

    let tagged = store.tags(&["c"]);
    assert_eq!(tagged.increment("hits", 1).await.unwrap(), 1);
    assert_eq!(tagged.increment("hits", 9).await.unwrap(), 10);
    assert_eq!(tagged.decrement("hits", 3).await.unwrap(), 7);

    let value: Option<i64> = tagged.get("hits").await.unwrap();
    assert_eq!(value, Some(7));

    store.flush().await.unwrap();
}
