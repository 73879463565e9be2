//! Loads content from a bundle directory on the local file system.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use linkcache_sources::{Address, Catalog, GroupKey, LocalBundleConfig};
use parking_lot::Mutex;

use super::{
    Backend, DownloadProgress, GroupLoad, LoadHandle, ResidentSet, SingleLoad, UpdateInfo,
    unsupported,
};
use crate::caching::{CacheEntry, CacheError, Content};

/// Backend reading a bundle directory with a catalog at its root.
///
/// Bundles ship with the application, so there is nothing to update or download.
#[derive(Debug)]
pub struct LocalBundleBackend {
    config: Arc<LocalBundleConfig>,
    catalog: Mutex<Option<Arc<Catalog>>>,
    resident: ResidentSet,
}

impl LocalBundleBackend {
    pub fn new(config: Arc<LocalBundleConfig>) -> Self {
        Self {
            config,
            catalog: Mutex::new(None),
            resident: ResidentSet::new(),
        }
    }

    /// The content currently held on behalf of load handles.
    pub fn resident(&self) -> &ResidentSet {
        &self.resident
    }

    async fn read_catalog(&self) -> CacheEntry<Arc<Catalog>> {
        let path = self.config.index_path();
        tracing::debug!("Reading bundle catalog from {:?}", path);

        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(path.display().to_string()),
            _ => e.into(),
        })?;
        let catalog = Catalog::from_slice(&bytes)
            .map_err(|err| CacheError::Malformed(format!("invalid bundle catalog: {err}")))?;

        let catalog = Arc::new(catalog);
        *self.catalog.lock() = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    async fn catalog(&self) -> CacheEntry<Arc<Catalog>> {
        let current = self.catalog.lock().clone();
        match current {
            Some(catalog) => Ok(catalog),
            None => self.read_catalog().await,
        }
    }

    async fn fetch(&self, address: Address) -> CacheEntry<Content> {
        let catalog = self.catalog().await?;
        let entry = catalog
            .get(&address)
            .ok_or_else(|| CacheError::NotFound(address.to_string()))?;

        let path = self.config.content_path(&entry.path);
        tracing::debug!("Fetching {} from {:?}", address, path);

        let result = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(address.to_string()),
            _ => e.into(),
        });
        metric!(
            counter("backend.fetch") += 1,
            "backend" => "local",
            "status" => match &result {
                Ok(_) => "ok",
                Err(err) => err.metrics_tag(),
            },
        );

        Content::decode(entry.kind, &address, Bytes::from(result?))
    }
}

impl Backend for LocalBundleBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn initialize(&self) -> BoxFuture<'_, CacheEntry> {
        async move {
            let catalog = self.read_catalog().await?;
            tracing::debug!(
                version = %catalog.version,
                entries = catalog.entries.len(),
                "Loaded bundle catalog"
            );
            Ok(())
        }
        .boxed()
    }

    fn load_single<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, CacheEntry<SingleLoad>> {
        self.resident
            .load_single(address, |address| self.fetch(address))
            .boxed()
    }

    fn load_group<'a>(&'a self, group: &'a GroupKey) -> BoxFuture<'a, CacheEntry<GroupLoad>> {
        async move {
            let addresses = self.catalog().await?.addresses_in(group);
            if addresses.is_empty() {
                return Err(CacheError::NotFound(format!("group {group}")));
            }

            Ok(self
                .resident
                .load_group(addresses, |address| self.fetch(address))
                .await)
        }
        .boxed()
    }

    fn release(&self, handle: LoadHandle) -> CacheEntry {
        self.resident.release(handle)
    }

    fn check_for_updates(&self) -> BoxFuture<'_, CacheEntry<UpdateInfo>> {
        futures::future::ready(unsupported("checking for updates")).boxed()
    }

    fn download(
        &self,
        _items: Vec<Address>,
        _progress: Arc<DownloadProgress>,
    ) -> BoxFuture<'_, CacheEntry> {
        futures::future::ready(unsupported("downloading")).boxed()
    }

    fn get_download_size(&self, _items: Vec<Address>) -> BoxFuture<'_, CacheEntry<u64>> {
        futures::future::ready(unsupported("querying the download size")).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn backend(path: &Path) -> LocalBundleBackend {
        LocalBundleBackend::new(Arc::new(LocalBundleConfig::new(path)))
    }

    #[tokio::test]
    async fn test_load_group() {
        linkcache_test::setup();
        let backend = backend(&linkcache_test::fixture("bundle"));
        backend.initialize().await.unwrap();

        let load = backend.load_group(&GroupKey::new("ui")).await.unwrap();
        let addresses: Vec<_> = load.items.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(addresses, ["ui/hud", "ui/popup"]);
        assert!(load.items.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(backend.resident().len(), 2);

        backend.release(load.handle).unwrap();
        assert!(backend.resident().is_empty());
    }

    #[tokio::test]
    async fn test_missing_content() {
        linkcache_test::setup();
        let backend = backend(&linkcache_test::fixture("bundle"));

        // listed in the catalog, but not part of the bundle
        let err = backend
            .load_single(&Address::new("missing/asset"))
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::NotFound("missing/asset".into()));

        let err = backend
            .load_single(&Address::new("not/listed"))
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::NotFound("not/listed".into()));

        let err = backend
            .load_group(&GroupKey::new("nobody"))
            .await
            .unwrap_err();
        insta::assert_snapshot!(err, @"not found: group nobody");
    }

    #[tokio::test]
    async fn test_resident_content_is_shared() {
        linkcache_test::setup();
        let backend = backend(&linkcache_test::fixture("bundle"));
        let address = Address::new("text/greeting");

        let first = backend.load_single(&address).await.unwrap();
        let second = backend.load_single(&address).await.unwrap();
        assert!(Arc::ptr_eq(&first.content, &second.content));
        assert_ne!(first.handle, second.handle);
    }

    #[tokio::test]
    async fn test_updates_are_unsupported() {
        linkcache_test::setup();
        let backend = backend(&linkcache_test::fixture("bundle"));

        let err = backend.check_for_updates().await.unwrap_err();
        insta::assert_snapshot!(err, @"unsupported: checking for updates is not supported by local bundles");

        let err = backend
            .get_download_size(vec![Address::new("ui/popup")])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_missing_catalog() {
        linkcache_test::setup();
        let dir = linkcache_test::tempdir();
        let backend = backend(dir.path());

        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }
}
