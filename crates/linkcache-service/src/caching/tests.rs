use std::sync::Arc;
use std::time::Duration;

use futures::future::Shared;
use linkcache_sources::{Address, GroupKey};

use super::*;
use crate::test;

fn group(key: &str) -> GroupKey {
    GroupKey::new(key)
}

fn address(address: &str) -> Address {
    Address::new(address)
}

#[tokio::test]
async fn test_preload_and_release_group() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let contents = cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(contents.len(), 2);
    assert!(cache.loaded(&address("ui/popup")));
    assert!(cache.loaded(&address("ui/hud")));
    assert_eq!(cache.active_groups(), vec![group("ui")]);
    assert_eq!(
        cache.group_addresses(&group("ui")),
        Some(vec![address("ui/hud"), address("ui/popup")])
    );

    assert!(cache.release_all(&group("ui")));
    assert!(!cache.loaded(&address("ui/popup")));
    assert!(!cache.active_groups().contains(&group("ui")));
    assert_eq!(cache.loaded_count(), 0);
    assert!(backend.resident().is_empty());

    // nothing left to release
    assert!(!cache.release_all(&group("ui")));
}

#[tokio::test]
async fn test_group_load_is_coalesced() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend().with_delay(Duration::from_millis(20)));
    let cache = test::cache(backend.clone());

    let first = cache.preload_all(&group("ui"));
    let second = cache.preload_all(&group("ui"));
    assert!(Shared::ptr_eq(&first, &second));

    let (first, second) = futures::join!(first, second);
    assert_eq!(first.unwrap().len(), 2);
    assert_eq!(second.unwrap().len(), 2);
    assert_eq!(backend.group_calls(), 1);

    // An active group resolves with the stored future.
    let third = cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(third.len(), 2);
    assert_eq!(backend.group_calls(), 1);
}

#[tokio::test]
async fn test_group_reloads_after_release() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.preload_all(&group("ui")).await.unwrap();
    assert!(cache.release_all(&group("ui")));
    cache.preload_all(&group("ui")).await.unwrap();

    assert_eq!(backend.group_calls(), 2);
    assert!(cache.loaded(&address("ui/popup")));
    assert!(cache.is_group_active(&group("ui")));
}

#[tokio::test]
async fn test_group_failure_is_not_cached() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    backend.fail_next_group(CacheError::DownloadError("connection reset".into()));
    let err = cache.preload_all(&group("ui")).await.unwrap_err();
    insta::assert_snapshot!(err, @"download failed: connection reset");
    assert!(!cache.is_group_active(&group("ui")));
    assert_eq!(cache.group_addresses(&group("ui")), None);

    let contents = cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(backend.group_calls(), 2);
}

#[tokio::test]
async fn test_group_failure_mid_batch_rolls_back() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    backend.fail_address("ui/popup", CacheError::Malformed("truncated".into()));
    let err = cache.preload_all(&group("ui")).await.unwrap_err();
    assert_eq!(err, CacheError::Malformed("truncated".into()));

    assert!(!cache.loaded(&address("ui/hud")));
    assert!(!cache.loaded(&address("ui/popup")));
    assert!(cache.active_groups().is_empty());
    // the handle covering `ui/hud` was given back
    assert_eq!(backend.resident().handles(), 0);
    assert!(backend.resident().is_empty());
}

#[tokio::test]
async fn test_unknown_group() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let err = cache.preload_all(&group("missing")).await.unwrap_err();
    insta::assert_snapshot!(err, @"not found: group missing");
    assert!(cache.active_groups().is_empty());
}

#[tokio::test]
async fn test_shared_address_is_inserted_once() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let ui = cache.preload_all(&group("ui")).await.unwrap();
    let hud = cache.preload_all(&group("hud")).await.unwrap();

    // `ui` lists `ui/hud` first
    assert!(Arc::ptr_eq(&ui[0], &hud[0]));
    assert_eq!(cache.loaded_count(), 2);
}

#[tokio::test]
async fn test_eager_eviction() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache_with_eviction(backend.clone(), EvictionPolicy::Eager);

    cache.preload_all(&group("ui")).await.unwrap();
    cache.preload_all(&group("hud")).await.unwrap();

    assert!(cache.release_all(&group("hud")));
    assert!(!cache.loaded(&address("ui/hud")));
    assert!(cache.loaded(&address("ui/popup")));
    assert!(cache.is_group_active(&group("ui")));
}

#[tokio::test]
async fn test_ref_counted_eviction() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache_with_eviction(backend.clone(), EvictionPolicy::RefCounted);

    cache.preload_all(&group("ui")).await.unwrap();
    cache.preload_all(&group("hud")).await.unwrap();

    assert!(cache.release_all(&group("hud")));
    assert!(cache.loaded(&address("ui/hud")));

    assert!(cache.release_all(&group("ui")));
    assert!(!cache.loaded(&address("ui/hud")));
    assert_eq!(cache.loaded_count(), 0);
}

#[tokio::test]
async fn test_group_release_keeps_ad_hoc_loads() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.load_address(&address("ui/popup")).await.unwrap();
    cache.preload_all(&group("ui")).await.unwrap();
    assert!(cache.release_all(&group("ui")));

    assert!(cache.loaded(&address("ui/popup")));
    assert!(!cache.loaded(&address("ui/hud")));
}

#[tokio::test]
async fn test_initializes_once() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.preload_all(&group("ui")).await.unwrap();
    cache.preload_all(&group("hud")).await.unwrap();
    cache.preload_all(&group("settings")).await.unwrap();
    cache.load_address(&address("text/greeting")).await.unwrap();
    assert_eq!(backend.init_calls(), 1);

    cache.dispose();
    cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(backend.init_calls(), 2);
}

#[tokio::test]
async fn test_failed_initialization_is_retried() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    backend.fail_next_init(CacheError::NotFound("catalog.json".into()));
    let err = cache.preload_all(&group("ui")).await.unwrap_err();
    assert_eq!(err, CacheError::NotFound("catalog.json".into()));
    assert_eq!(backend.group_calls(), 0);

    cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(backend.init_calls(), 2);
    assert_eq!(backend.group_calls(), 1);
}

#[tokio::test]
async fn test_load_address() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    assert!(cache.get_content(&address("text/greeting")).is_none());

    let content = cache.load_address(&address("text/greeting")).await.unwrap();
    assert_eq!(*content, test::blob("hello, world\n"));
    assert!(cache.loaded(&address("text/greeting")));

    let text = cache.get::<String>(&address("text/greeting")).unwrap();
    assert_eq!(text.as_str(), "hello, world\n");
    // wrong views are treated as absent
    assert!(cache.get::<Template>(&address("text/greeting")).is_none());

    let again = cache.load_address(&address("text/greeting")).await.unwrap();
    assert!(Arc::ptr_eq(&content, &again));
    assert_eq!(backend.single_calls(), 1);
}

#[tokio::test]
async fn test_load_address_is_coalesced() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend().with_delay(Duration::from_millis(20)));
    let cache = test::cache(backend.clone());

    let first = cache.load_address(&address("config/game"));
    let second = cache.load_address(&address("config/game"));
    assert!(Shared::ptr_eq(&first, &second));

    let (first, second) = futures::join!(first, second);
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(backend.single_calls(), 1);
}

#[tokio::test]
async fn test_group_and_single_load_share_fetch() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend().with_delay(Duration::from_millis(20)));
    let cache = test::cache(backend.clone());

    let (contents, popup) = futures::join!(
        cache.preload_all(&group("ui")),
        cache.load_address(&address("ui/popup")),
    );
    let contents = contents.unwrap();
    let popup = popup.unwrap();

    assert_eq!(backend.fetch_calls("ui/popup"), 1);
    assert_eq!(backend.fetch_calls("ui/hud"), 1);
    assert!(contents.iter().any(|content| Arc::ptr_eq(content, &popup)));
    assert_eq!(cache.loaded_count(), 2);
}

#[tokio::test]
async fn test_load_null_address() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let err = cache.load_address(&Address::null()).await.unwrap_err();
    assert_eq!(err, CacheError::NoValue);
    let err = cache.load_address(&address("")).await.unwrap_err();
    assert_eq!(err, CacheError::NoValue);

    assert_eq!(backend.init_calls(), 0);
    assert_eq!(backend.single_calls(), 0);
}

#[tokio::test]
async fn test_load_failure_is_not_cached() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let err = cache.load_address(&address("ui/missing")).await.unwrap_err();
    insta::assert_snapshot!(err, @"not found: ui/missing");
    let err = cache.load_address(&address("ui/missing")).await.unwrap_err();
    assert_eq!(err, CacheError::NotFound("ui/missing".into()));

    assert_eq!(backend.single_calls(), 2);
    assert_eq!(cache.loaded_count(), 0);
}

#[tokio::test]
async fn test_release_address() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.load_address(&address("config/game")).await.unwrap();
    assert_eq!(backend.resident().handles(), 1);

    assert!(cache.release_address(&address("config/game")));
    assert!(!cache.loaded(&address("config/game")));
    assert!(backend.resident().is_empty());

    assert!(!cache.release_address(&address("config/game")));
}

#[tokio::test]
async fn test_release_address_leaves_groups_alone() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.preload_all(&group("ui")).await.unwrap();
    assert!(!cache.release_address(&address("ui/popup")));
    assert!(cache.loaded(&address("ui/popup")));
}

#[tokio::test]
async fn test_release_while_loading() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend().with_delay(Duration::from_millis(20)));
    let cache = test::cache(backend.clone());

    let pending = cache.load_address(&address("config/game"));
    assert!(cache.release_address(&address("config/game")));

    // waiters still get the content, but the cache does not keep it
    let content = pending.await.unwrap();
    assert!(matches!(*content, Content::Record(_)));
    assert!(!cache.loaded(&address("config/game")));
    assert!(backend.resident().is_empty());
}

#[tokio::test]
async fn test_dispose() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.preload_all(&group("ui")).await.unwrap();
    cache.preload_all(&group("settings")).await.unwrap();
    cache.load_address(&address("text/greeting")).await.unwrap();
    assert_eq!(backend.resident().handles(), 3);

    cache.dispose();
    assert_eq!(backend.release_calls(), 3);
    assert_eq!(cache.loaded_count(), 0);
    assert!(cache.active_groups().is_empty());
    assert!(backend.resident().is_empty());
}

#[tokio::test]
async fn test_dispose_continues_after_failed_release() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    cache.preload_all(&group("ui")).await.unwrap();
    cache.preload_all(&group("settings")).await.unwrap();
    cache.load_address(&address("text/greeting")).await.unwrap();
    assert_eq!(backend.init_calls(), 1);

    // groups are released first, in key order
    backend.fail_next_release(CacheError::InternalError);
    cache.dispose();
    assert_eq!(backend.release_calls(), 3);
    assert_eq!(backend.resident().handles(), 1);
    assert!(backend.resident().get(&address("config/game")).is_some());
    assert_eq!(cache.loaded_count(), 0);
    assert!(cache.active_groups().is_empty());

    // the next load initializes the backend again
    let contents = cache.preload_all(&group("ui")).await.unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(backend.init_calls(), 2);
    assert!(cache.is_group_active(&group("ui")));
}

#[tokio::test]
async fn test_dispose_discards_pending_loads() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend().with_delay(Duration::from_millis(20)));
    let cache = test::cache(backend.clone());

    let pending = cache.preload_all(&group("ui"));
    cache.dispose();

    let contents = pending.await.unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(cache.loaded_count(), 0);
    assert!(!cache.is_group_active(&group("ui")));
    assert_eq!(backend.resident().handles(), 0);
}

#[tokio::test]
async fn test_download_updates() {
    linkcache_test::setup();
    let backend = Arc::new(
        test::ui_backend()
            .with_update("ui/popup", 10)
            .with_update("ui/hud", 20)
            .with_delay(Duration::from_millis(10)),
    );
    let cache = test::cache(backend.clone());

    let updates = cache.check_for_updates().await.unwrap();
    assert_eq!(updates.items, vec![address("ui/hud"), address("ui/popup")]);
    assert_eq!(updates.total_size, 30);

    let size = cache
        .get_download_size(vec![address("ui/popup")])
        .await
        .unwrap();
    assert_eq!(size, 10);

    let mut reports = vec![];
    cache
        .download_updates(updates.items, |downloaded, total| {
            reports.push((downloaded, total))
        })
        .await
        .unwrap();

    assert_eq!(reports.last(), Some(&(30, 30)));
    assert!(reports.windows(2).all(|pair| pair[0].0 <= pair[1].0));
}

#[tokio::test]
async fn test_download_updates_with_zero_interval() {
    linkcache_test::setup();
    let backend = Arc::new(
        test::ui_backend()
            .with_update("ui/popup", 10)
            .with_delay(Duration::from_millis(5)),
    );
    let options = CacheOptions {
        progress_interval: Duration::ZERO,
        ..Default::default()
    };
    let cache = LoadingCache::new(backend, options, tokio::runtime::Handle::current());

    let mut reports = vec![];
    cache
        .download_updates(vec![address("ui/popup")], |downloaded, total| {
            reports.push((downloaded, total))
        })
        .await
        .unwrap();
    assert_eq!(reports.last(), Some(&(10, 10)));
}

#[tokio::test]
async fn test_download_not_needed() {
    linkcache_test::setup();
    let backend = Arc::new(test::ui_backend());
    let cache = test::cache(backend.clone());

    let mut reports = 0;
    cache
        .download_updates_if_needed(|_, _| reports += 1)
        .await
        .unwrap();
    assert_eq!(reports, 0);
}
