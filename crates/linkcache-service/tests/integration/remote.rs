use linkcache_service::caching::{CacheError, Content, Template};
use linkcache_service::links::{ContentLink, TemplateLink};
use linkcache_sources::{Address, GroupKey};
use linkcache_test as test;
use serde::Deserialize;

use crate::setup_cache;

#[derive(Debug, Deserialize)]
struct HealthBar {
    max: u32,
    color: String,
}

impl linkcache_service::links::Component for HealthBar {
    const NAME: &'static str = "health_bar";
}

fn addresses(items: &[&str]) -> Vec<Address> {
    items.iter().map(|item| Address::new(*item)).collect()
}

#[tokio::test]
async fn test_preload_group() {
    let (server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    let contents = cache.preload_all(&GroupKey::new("ui")).await.unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(
        server.all_hits(),
        vec![
            ("/bundle/catalog.json".to_owned(), 1),
            ("/bundle/ui/hud.json".to_owned(), 1),
            ("/bundle/ui/popup.json".to_owned(), 1),
        ]
    );

    let health_bar = TemplateLink::<HealthBar>::new("ui/hud")
        .value(&cache)
        .unwrap();
    assert_eq!(health_bar.max, 100);
    assert_eq!(health_bar.color, "red");

    assert!(cache.release_all(&GroupKey::new("ui")));
    assert!(!cache.loaded(&Address::new("ui/hud")));
}

#[tokio::test]
async fn test_downloads_are_reused() {
    let (server, backend) = test::bundle_server().await;
    let (cache, cache_dir) = setup_cache(backend, |_| {});

    let text = ContentLink::<String>::new("text/greeting");
    assert_eq!(text.load(&cache).await.unwrap().as_str(), "hello, world\n");
    assert_eq!(server.accesses(), 2);

    let downloaded = cache_dir
        .path()
        .join("content")
        .join("853ff93762a06ddbf722c4ebe9ddd66d8f63ddaea97f521c3ecc20da7c976020");
    assert!(downloaded.exists());

    // A fresh start only needs the catalog again.
    cache.dispose();
    let text = ContentLink::<String>::new("text/greeting");
    text.load(&cache).await.unwrap();
    assert_eq!(
        server.all_hits(),
        vec![("/bundle/catalog.json".to_owned(), 1)]
    );
}

#[tokio::test]
async fn test_not_found() {
    let (server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    let err = cache
        .load_address(&Address::new("missing/asset"))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("missing/asset".into()));

    // not found is never retried
    let hits = server.all_hits();
    assert!(hits.contains(&("/bundle/missing/asset.bin".to_owned(), 1)));

    let err = cache
        .load_address(&Address::new("not/in/catalog"))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("not/in/catalog".into()));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_partial_group_failure() {
    let (_server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    let err = cache
        .preload_all(&GroupKey::new("partial"))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("missing/asset".into()));

    assert!(!cache.loaded(&Address::new("ui/popup")));
    assert!(cache.active_groups().is_empty());
}

#[tokio::test]
async fn test_hash_mismatch() {
    let (server, backend) = test::bundle_server().await;
    let (cache, cache_dir) = setup_cache(backend, |_| {});

    let err = cache
        .load_address(&Address::new("text/tampered"))
        .await
        .unwrap_err();
    let CacheError::Malformed(message) = &err else {
        panic!("expected a malformed error, got {err:?}");
    };
    assert!(message.starts_with("hash mismatch"));

    // malformed downloads are retried, but never persisted
    let hits = server.all_hits();
    assert!(hits.contains(&("/bundle/text/greeting.txt".to_owned(), 3)));
    let tampered = cache_dir
        .path()
        .join("content")
        .join("0000000000000000000000000000000000000000000000000000000000000001");
    assert!(!tampered.exists());
}

#[tokio::test]
async fn test_invalid_content() {
    let (_server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    let link = ContentLink::<Template>::new("broken/invalid");
    let err = link.load(&cache).await.unwrap_err();
    assert!(matches!(err, CacheError::Malformed(_)));
}

#[tokio::test]
async fn test_reserved_ips_are_blocked() {
    let (server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |config| {
        config.connect_to_reserved_ips = false;
    });

    let err = cache
        .preload_all(&GroupKey::new("ui"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::PermissionDenied(_)));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_download_updates() {
    let (server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    // Without a previous catalog, everything that is not downloaded is an update.
    let updates = cache.check_for_updates().await.unwrap();
    assert_eq!(updates.items.len(), 8);
    assert_eq!(updates.total_size, 331);

    let items = addresses(&["ui/popup", "ui/hud", "config/game"]);
    let size = cache.get_download_size(items.clone()).await.unwrap();
    assert_eq!(size, 203);

    let mut reports = vec![];
    cache
        .download_updates(items.clone(), |downloaded, total| {
            reports.push((downloaded, total))
        })
        .await
        .unwrap();
    assert_eq!(reports.last(), Some(&(203, 203)));

    assert_eq!(cache.get_download_size(items).await.unwrap(), 0);
    let size = cache
        .get_download_size(addresses(&["text/greeting"]))
        .await
        .unwrap();
    assert_eq!(size, 13);

    // Downloaded content loads without touching the network, only the catalog is fetched
    // when the cache initializes.
    server.accesses();
    let content = cache
        .load_address(&Address::new("config/game"))
        .await
        .unwrap();
    assert!(matches!(*content, Content::Record(_)));
    assert_eq!(
        server.all_hits(),
        vec![("/bundle/catalog.json".to_owned(), 1)]
    );

    // Nothing changed since the last check.
    let updates = cache.check_for_updates().await.unwrap();
    assert!(updates.items.is_empty());
    assert_eq!(updates.total_size, 0);
}

#[tokio::test]
async fn test_download_unknown_item() {
    let (_server, backend) = test::bundle_server().await;
    let (cache, _cache_dir) = setup_cache(backend, |_| {});

    let err = cache
        .get_download_size(addresses(&["ui/popup", "not/in/catalog"]))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("not/in/catalog".into()));
}
