//! Loads content from a catalog served over HTTP.
//!
//! Content files are downloaded into a local directory, named after their SHA-256 hash. Files
//! that are already present are used without touching the network, so only new or changed
//! content is ever downloaded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, TryStreamExt};
use linkcache_sources::{Address, Catalog, CatalogEntry, GroupKey, RemoteCatalogConfig};
use parking_lot::Mutex;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{
    Backend, DownloadProgress, GroupLoad, LoadHandle, ResidentSet, SingleLoad, UpdateInfo, retry,
};
use crate::caching::{CacheEntry, CacheError, Content};
use crate::utils::http::{DownloadTimeouts, create_client, is_allowed_url};

/// The number of files downloaded concurrently by [`Backend::download`].
const CONCURRENT_DOWNLOADS: usize = 4;

/// Counts bytes of one download attempt into the shared progress.
///
/// Bytes of an attempt that is not committed are taken back when this is dropped, so retried
/// or timed out downloads do not count twice.
struct AttemptProgress<'a> {
    progress: Option<&'a DownloadProgress>,
    bytes: u64,
    committed: bool,
}

impl<'a> AttemptProgress<'a> {
    fn new(progress: Option<&'a DownloadProgress>) -> Self {
        Self {
            progress,
            bytes: 0,
            committed: false,
        }
    }

    fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        if let Some(progress) = self.progress {
            progress.add_downloaded(bytes);
        }
    }

    fn commit(mut self) -> u64 {
        self.committed = true;
        self.bytes
    }
}

impl Drop for AttemptProgress<'_> {
    fn drop(&mut self) {
        if let (false, Some(progress)) = (self.committed, self.progress) {
            progress.sub_downloaded(self.bytes);
        }
    }
}

/// Backend for a catalog and its content served over HTTP.
#[derive(Debug)]
pub struct RemoteCatalogBackend {
    config: Arc<RemoteCatalogConfig>,
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
    connect_to_reserved_ips: bool,
    download_dir: PathBuf,
    catalog: Mutex<Option<Arc<Catalog>>>,
    resident: ResidentSet,
}

impl RemoteCatalogBackend {
    /// Creates the backend, downloading into `<cache_dir>/content`.
    ///
    /// Without a cache directory, downloads go to a directory below the system temp dir.
    pub fn new(
        config: Arc<RemoteCatalogConfig>,
        cache_dir: Option<&Path>,
        timeouts: DownloadTimeouts,
        connect_to_reserved_ips: bool,
    ) -> anyhow::Result<Self> {
        let download_dir = match cache_dir {
            Some(cache_dir) => cache_dir.join("content"),
            None => std::env::temp_dir().join("linkcache").join("content"),
        };
        std::fs::create_dir_all(&download_dir).with_context(|| {
            format!(
                "failed to create download directory {}",
                download_dir.display()
            )
        })?;

        let client = create_client(&timeouts, connect_to_reserved_ips, &config.headers)?;

        Ok(Self {
            config,
            client,
            timeouts,
            connect_to_reserved_ips,
            download_dir,
            catalog: Mutex::new(None),
            resident: ResidentSet::new(),
        })
    }

    /// The directory downloaded content is stored in.
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// The content currently held on behalf of load handles.
    pub fn resident(&self) -> &ResidentSet {
        &self.resident
    }

    async fn get(&self, url: &Url) -> CacheEntry<reqwest::Response> {
        if !is_allowed_url(url, self.connect_to_reserved_ips) {
            return Err(CacheError::PermissionDenied(format!(
                "{url} points to a reserved address"
            )));
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::trace!("Success hitting `{}`", url);
            return Ok(response);
        }

        tracing::debug!("Unexpected status code from `{}`: {}", url, status);
        Err(match status {
            StatusCode::NOT_FOUND => CacheError::NotFound(url.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CacheError::PermissionDenied(status.to_string())
            }
            _ => CacheError::DownloadError(status.to_string()),
        })
    }

    async fn fetch_catalog(&self) -> CacheEntry<Catalog> {
        let url = self
            .config
            .catalog_url()
            .map_err(|err| CacheError::DownloadError(err.to_string()))?;
        tracing::debug!("Fetching catalog from {}", url);

        let max_download = self.timeouts.max_download;
        let bytes = retry(|| async {
            let response = self.get(&url).await?;
            match tokio::time::timeout(max_download, response.bytes()).await {
                Ok(bytes) => Ok(bytes?),
                Err(_) => Err(CacheError::Timeout(max_download)),
            }
        })
        .await?;

        Catalog::from_slice(&bytes)
            .map_err(|err| CacheError::Malformed(format!("invalid catalog: {err}")))
    }

    async fn catalog(&self) -> CacheEntry<Arc<Catalog>> {
        let current = self.catalog.lock().clone();
        if let Some(catalog) = current {
            return Ok(catalog);
        }

        let catalog = Arc::new(self.fetch_catalog().await?);
        *self.catalog.lock() = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    fn content_path(&self, address: &Address, entry: &CatalogEntry) -> CacheEntry<PathBuf> {
        let valid = entry.hash.len() == 64 && entry.hash.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(CacheError::Malformed(format!(
                "`{address}` has no valid SHA-256 hash in the catalog"
            )));
        }
        Ok(self.download_dir.join(entry.hash.to_ascii_lowercase()))
    }

    async fn is_downloaded(path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Downloads the content of `entry` once, verifying its hash before persisting it.
    async fn download_once(
        &self,
        url: &Url,
        entry: &CatalogEntry,
        path: &Path,
        progress: Option<&DownloadProgress>,
    ) -> CacheEntry {
        let response = self.get(url).await?;

        let temp_file = tempfile::NamedTempFile::new_in(&self.download_dir)?;
        let mut file = tokio::fs::File::from_std(temp_file.reopen()?);
        let mut hasher = Sha256::new();
        let mut attempt = AttemptProgress::new(progress);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            attempt.add(chunk.len() as u64);
        }
        file.flush().await?;
        drop(file);

        let hash = format!("{:x}", hasher.finalize());
        if !hash.eq_ignore_ascii_case(&entry.hash) {
            return Err(CacheError::Malformed(format!(
                "hash mismatch for {url}: expected {}, got {hash}",
                entry.hash
            )));
        }

        temp_file
            .persist(path)
            .map_err(|err| CacheError::from(err.error))?;

        let bytes = attempt.commit();
        metric!(counter("backend.download.bytes") += bytes as i64, "backend" => "remote");
        Ok(())
    }

    /// Returns the local path of the content at `address`, downloading it if needed.
    async fn ensure_downloaded(
        &self,
        address: &Address,
        entry: &CatalogEntry,
        progress: Option<&DownloadProgress>,
    ) -> CacheEntry<PathBuf> {
        let path = self.content_path(address, entry)?;
        if Self::is_downloaded(&path).await {
            tracing::trace!("Using downloaded {} at {:?}", address, path);
            return Ok(path);
        }

        let url = self
            .config
            .join_url(&entry.path)
            .map_err(|err| CacheError::DownloadError(err.to_string()))?;
        tracing::debug!("Downloading {} from {}", address, url);

        let max_download = self.timeouts.max_download;
        retry(|| async {
            let download = self.download_once(&url, entry, &path, progress);
            match tokio::time::timeout(max_download, download).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(max_download)),
            }
        })
        .await?;

        Ok(path)
    }

    async fn fetch(&self, address: Address) -> CacheEntry<Content> {
        let catalog = self.catalog().await?;
        let entry = catalog
            .get(&address)
            .ok_or_else(|| CacheError::NotFound(address.to_string()))?;

        let result = match self.ensure_downloaded(&address, entry, None).await {
            Ok(path) => tokio::fs::read(&path).await.map_err(CacheError::from),
            Err(CacheError::NotFound(_)) => Err(CacheError::NotFound(address.to_string())),
            Err(err) => Err(err),
        };
        metric!(
            counter("backend.fetch") += 1,
            "backend" => "remote",
            "status" => match &result {
                Ok(_) => "ok",
                Err(err) => err.metrics_tag(),
            },
        );

        Content::decode(entry.kind, &address, Bytes::from(result?))
    }

    /// Downloads one missing entry of [`Backend::download`].
    async fn download_entry(
        &self,
        address: Address,
        entry: CatalogEntry,
        progress: Arc<DownloadProgress>,
    ) -> CacheEntry<PathBuf> {
        self.ensure_downloaded(&address, &entry, Some(&progress)).await
    }

    /// Returns the catalog entries of `items` whose content is not downloaded yet.
    async fn missing(
        &self,
        catalog: &Catalog,
        items: &[Address],
    ) -> CacheEntry<Vec<(Address, CatalogEntry)>> {
        let unique: BTreeSet<_> = items.iter().collect();

        let mut missing = Vec::new();
        for address in unique {
            let entry = catalog
                .get(address)
                .ok_or_else(|| CacheError::NotFound(address.to_string()))?;
            let path = self.content_path(address, entry)?;
            if !Self::is_downloaded(&path).await {
                missing.push((address.clone(), entry.clone()));
            }
        }
        Ok(missing)
    }
}

impl Backend for RemoteCatalogBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn initialize(&self) -> BoxFuture<'_, CacheEntry> {
        async move {
            let catalog = Arc::new(self.fetch_catalog().await?);
            tracing::debug!(
                version = %catalog.version,
                entries = catalog.entries.len(),
                "Fetched remote catalog"
            );
            *self.catalog.lock() = Some(catalog);
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
        async move {
            let fresh = Arc::new(self.fetch_catalog().await?);
            let previous = self.catalog.lock().replace(Arc::clone(&fresh));

            let changed = fresh.changed_since(previous.as_deref());
            let missing = self.missing(&fresh, &changed).await?;

            let items: Vec<_> = missing.into_iter().map(|(address, _)| address).collect();
            let total_size = fresh
                .total_size(&items)
                .map_err(|address| CacheError::NotFound(address.to_string()))?;

            tracing::debug!(
                changed = changed.len(),
                missing = items.len(),
                total_size,
                "Checked remote catalog for updates"
            );
            Ok(UpdateInfo { items, total_size })
        }
        .boxed()
    }

    fn download(
        &self,
        items: Vec<Address>,
        progress: Arc<DownloadProgress>,
    ) -> BoxFuture<'_, CacheEntry> {
        async move {
            let catalog = self.catalog().await?;
            let missing = self.missing(&catalog, &items).await?;

            let total = missing.iter().map(|(_, entry)| entry.size).sum();
            progress.set_total(total);

            let downloads: Vec<_> = missing
                .into_iter()
                .map(|(address, entry)| self.download_entry(address, entry, Arc::clone(&progress)))
                .collect();

            futures::stream::iter(downloads)
                .buffer_unordered(CONCURRENT_DOWNLOADS)
                .try_collect::<Vec<_>>()
                .await?;

            Ok(())
        }
        .boxed()
    }

    fn get_download_size(&self, items: Vec<Address>) -> BoxFuture<'_, CacheEntry<u64>> {
        async move {
            let catalog = self.catalog().await?;
            let missing = self.missing(&catalog, &items).await?;
            Ok(missing.iter().map(|(_, entry)| entry.size).sum())
        }
        .boxed()
    }
}
