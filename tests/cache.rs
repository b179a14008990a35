use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uki::resources::{CacheBucket, LoadError, Resource, ResourceCache};

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_load() {
    let cache = ResourceCache::new();
    let loads = Arc::new(AtomicUsize::new(0));

    let start = |loads: Arc<AtomicUsize>| {
        cache.get_or_load(CacheBucket::Script, "lib.js", move || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Resource::Data(json!("lib")))
        })
    };

    let first = start(loads.clone());
    let second = start(loads.clone());
    let (first, second) = tokio::join!(first, second);

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_failures_are_cached() {
    let cache = ResourceCache::new();
    let loads = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let loads = loads.clone();
        let result = cache
            .get_or_load(CacheBucket::Stylesheet, "gone.css", move || async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Err(LoadError::Network {
                    locator: "gone.css".to_string(),
                    message: "HTTP status 404".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(LoadError::Network { .. })));
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(matches!(
        cache.peek(CacheBucket::Stylesheet, "gone.css"),
        Some(Err(LoadError::Network { .. }))
    ));
}

#[tokio::test]
async fn test_buckets_are_independent() {
    let cache = ResourceCache::new();
    let key = "p { color: red }";

    cache
        .get_or_load(CacheBucket::RawStylesheet, key, || async { Ok(Resource::Data(json!(1))) })
        .await
        .unwrap();

    assert!(cache.contains(CacheBucket::RawStylesheet, key));
    assert!(!cache.contains(CacheBucket::CompiledStylesheet, key));

    let compiled = cache
        .get_or_load(CacheBucket::CompiledStylesheet, key, || async { Ok(Resource::Data(json!(2))) })
        .await
        .unwrap();
    assert_eq!(compiled, Resource::Data(json!(2)));
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_peek_before_and_after_settling() {
    let cache = ResourceCache::new();
    assert!(cache.is_empty());
    assert!(cache.peek(CacheBucket::Script, "late.js").is_none());

    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let pending = cache.get_or_load(CacheBucket::Script, "late.js", move || async move {
        let _ = gate.await;
        Ok(Resource::Data(json!("late")))
    });

    assert!(cache.contains(CacheBucket::Script, "late.js"));
    assert!(cache.peek(CacheBucket::Script, "late.js").is_none());

    release.send(()).unwrap();
    pending.await.unwrap();
    assert_eq!(
        cache.peek(CacheBucket::Script, "late.js"),
        Some(Ok(Resource::Data(json!("late"))))
    );
}

#[tokio::test]
async fn test_separate_caches_do_not_share() {
    let first = ResourceCache::new();
    let second = ResourceCache::new();

    first
        .get_or_load(CacheBucket::Script, "a.js", || async { Ok(Resource::Data(json!("a"))) })
        .await
        .unwrap();

    assert!(first.contains(CacheBucket::Script, "a.js"));
    assert!(!second.contains(CacheBucket::Script, "a.js"));
    assert!(first.clone().contains(CacheBucket::Script, "a.js"));
}
