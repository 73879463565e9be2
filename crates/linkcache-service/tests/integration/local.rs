use std::sync::Arc;

use linkcache_service::caching::{CacheError, EvictionPolicy};
use linkcache_service::links::{DataRecord, RecordLink, SingletonConvention, TemplateLink};
use linkcache_sources::{Address, BackendConfig, GroupKey, LocalBundleConfig};
use linkcache_test as test;
use serde::Deserialize;

use crate::setup_cache;

#[derive(Debug, Deserialize)]
struct Dialog {
    title: String,
}

impl linkcache_service::links::Component for Dialog {
    const NAME: &'static str = "dialog";
}

#[derive(Debug, Deserialize)]
struct AudioSettings {
    volume: f64,
    muted: bool,
}

impl DataRecord for AudioSettings {
    const TYPE_NAME: &'static str = "AudioSettings";
    const SINGLETON: Option<SingletonConvention> = Some(SingletonConvention::DEFAULT);
}

#[derive(Debug, Deserialize)]
struct GameSettings {
    difficulty: String,
}

impl DataRecord for GameSettings {
    const TYPE_NAME: &'static str = "GameSettings";
}

#[tokio::test]
async fn test_ui_scenario() {
    let (cache, _cache_dir) = setup_cache(test::local_bundle(), |_| {});

    let popup = TemplateLink::<Dialog>::new("ui/popup");
    assert!(popup.value(&cache).is_none());

    let contents = cache.preload_all(&GroupKey::new("ui")).await.unwrap();
    assert_eq!(contents.len(), 2);
    assert!(cache.loaded(&Address::new("ui/popup")));
    assert_eq!(popup.value(&cache).unwrap().title, "Hello");

    assert!(cache.release_all(&GroupKey::new("ui")));
    assert!(!cache.loaded(&Address::new("ui/popup")));
    assert!(!cache.active_groups().contains(&GroupKey::new("ui")));
}

#[tokio::test]
async fn test_settings_group() {
    let (cache, _cache_dir) = setup_cache(test::local_bundle(), |_| {});

    assert!(!cache.is_prewarmed::<AudioSettings>());
    cache.preload_all(&GroupKey::new("settings")).await.unwrap();
    assert!(cache.is_prewarmed::<AudioSettings>());

    let audio = cache.get_singleton::<AudioSettings>().unwrap();
    assert_eq!(audio.volume, 0.8);
    assert!(!audio.muted);

    let game = RecordLink::<GameSettings>::new("config/game")
        .value(&cache)
        .unwrap();
    assert_eq!(game.difficulty, "hard");
}

#[tokio::test]
async fn test_shared_addresses_ref_counted() {
    let (cache, _cache_dir) = setup_cache(test::local_bundle(), |config| {
        config.eviction = EvictionPolicy::RefCounted;
    });

    cache.preload_all(&GroupKey::new("ui")).await.unwrap();
    cache.preload_all(&GroupKey::new("hud")).await.unwrap();

    assert!(cache.release_all(&GroupKey::new("ui")));
    assert!(!cache.loaded(&Address::new("ui/popup")));
    assert!(cache.loaded(&Address::new("ui/hud")));

    assert!(cache.release_all(&GroupKey::new("hud")));
    assert_eq!(cache.loaded_count(), 0);
}

#[tokio::test]
async fn test_broken_group() {
    let (cache, _cache_dir) = setup_cache(test::local_bundle(), |_| {});

    let err = cache
        .preload_all(&GroupKey::new("broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Malformed(_)));

    let err = cache
        .preload_all(&GroupKey::new("partial"))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("missing/asset".into()));
    assert!(!cache.loaded(&Address::new("ui/popup")));
    assert!(cache.active_groups().is_empty());
}

#[tokio::test]
async fn test_updates_are_unsupported() {
    let (cache, _cache_dir) = setup_cache(test::local_bundle(), |_| {});

    let err = cache.check_for_updates().await.unwrap_err();
    insta::assert_snapshot!(err, @"unsupported: checking for updates is not supported by local bundles");

    let err = cache
        .download_updates_if_needed(|_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Unsupported(_)));
}

#[tokio::test]
async fn test_missing_bundle() {
    let cache_dir = test::tempdir();
    let config = LocalBundleConfig::new(cache_dir.path().join("nothing-here"));
    let (cache, _cache_dir) = setup_cache(BackendConfig::Local(Arc::new(config)), |_| {});

    let err = cache
        .preload_all(&GroupKey::new("ui"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound(_)));

    // a failed initialization is tried again
    let err = cache
        .load_address(&Address::new("ui/popup"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound(_)));
}
