use linkcache_service::backend::create_backend;
use linkcache_service::caching::{CacheOptions, LoadingCache};
use linkcache_service::config::Config;
use linkcache_sources::BackendConfig;
use linkcache_test as test;

/// Setup tests and create a loading cache over `backend`.
///
/// This function returns a tuple containing the cache to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`](test::TempDir) instance is
/// dropped. Keep it as guard until the test has finished.
///
/// The cache is configured with `connect_to_reserved_ips = true`. This allows to use a local
/// bundle server to test downloads. The `update_config` closure can modify any default
/// configuration if needed before the backend is created.
pub fn setup_cache(
    backend: BackendConfig,
    update_config: impl FnOnce(&mut Config),
) -> (LoadingCache, test::TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        backend,
        cache_dir: Some(cache_dir.path().to_owned()),
        connect_to_reserved_ips: true,
        ..Default::default()
    };
    update_config(&mut config);

    let backend = create_backend(&config).unwrap();
    let options = CacheOptions::from_config(&config);
    let cache = LoadingCache::new(backend, options, tokio::runtime::Handle::current());

    (cache, cache_dir)
}
