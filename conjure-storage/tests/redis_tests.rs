//! Scenarios against a live Redis.
//!
//! Run with `CONJURE_REDIS_URL=redis://... cargo test -- --ignored`. Every
//! test flushes the database it connects to.

use std::sync::Arc;
use std::time::Duration;

use conjure_core::{ConjureConfig, ConjureError};
use conjure_storage::{
    ConjunctionIndexer, GarbageCollector, GcConfig, Invalidator, KeyTtl, QueryCache, RedisStore,
    Store,
};
use conjure_test_utils::fixtures::{dependency, record};
use conjure_test_utils::{CacheableQuery, HashTagRouter};

fn redis_url() -> String {
    std::env::var("CONJURE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
}

async fn fresh_store() -> Arc<RedisStore> {
    let store = RedisStore::connect(&redis_url()).await.unwrap();
    store.flush().await.unwrap();
    Arc::new(store)
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_redis_index_then_invalidate() {
    let store = fresh_store().await;
    let config = ConjureConfig::default();
    let indexer = ConjunctionIndexer::new(Arc::clone(&store), config.clone());
    let invalidator = Invalidator::new(Arc::clone(&store), HashTagRouter::disabled(), config);

    indexer
        .index(
            "q:abc",
            b"rows",
            Duration::from_secs(3600),
            &[dependency("table", &[("x", 1.into())])],
        )
        .await
        .unwrap();
    match store.ttl("conj:table:x=1").await.unwrap() {
        KeyTtl::Expires(ttl) => assert!(ttl >= Duration::from_secs(3600)),
        other => panic!("unexpected set ttl {:?}", other),
    }

    let removed = invalidator
        .invalidate("table", &record(&[("x", 1.into())]), None)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!store.exists("q:abc").await.unwrap());
    assert!(!store.exists("conj:table:x=1").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_redis_gc_prunes_deleted_entry() {
    let store = fresh_store().await;
    let config = ConjureConfig::default().with_lru(true);
    let indexer = ConjunctionIndexer::new(Arc::clone(&store), config.clone());
    let dep = [dependency("table", &[("x", 1.into())])];
    indexer.index("q:a", b"a", Duration::from_secs(60), &dep).await.unwrap();
    indexer.index("q:b", b"b", Duration::from_secs(60), &dep).await.unwrap();

    // A plain DEL leaves the index untouched, like an eviction.
    store.delete(&["q:a".to_string()]).await.unwrap();

    let gc = GarbageCollector::for_deployment(Arc::clone(&store), GcConfig::development(), &config)
        .unwrap();
    assert_eq!(gc.sweep().await.deleted_items, 1);
    assert_eq!(
        store.set_members("conj:table:x=1").await.unwrap(),
        vec!["q:b".to_string()]
    );
    assert_eq!(gc.sweep().await.deleted_items, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires Redis running
async fn test_redis_concurrent_fetch_computes_once() {
    let store = fresh_store().await;
    let cache = Arc::new(QueryCache::new(
        store,
        HashTagRouter::disabled(),
        ConjureConfig::default().with_lock_timeout(Duration::from_secs(5)),
    ));
    let query = CacheableQuery::new("select * from post", Duration::from_secs(60))
        .depends_on(dependency("post", &[]));
    let computes = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let query = query.clone();
        let computes = Arc::clone(&computes);
        handles.push(tokio::spawn(async move {
            cache
                .fetch::<ConjureError, _, _>(&query, || async move {
                    computes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(b"rows".to_vec())
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().data, b"rows".to_vec());
    }
    assert_eq!(computes.load(std::sync::atomic::Ordering::SeqCst), 1);
}
