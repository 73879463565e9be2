//! The strategies content is loaded with.
//!
//! A [`Backend`] resolves addresses and groups to [`Content`] and hands out a [`LoadHandle`]
//! for every successful load. The handle keeps the content resident in the backend until it is
//! given back through [`Backend::release`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use linkcache_sources::{Address, BackendConfig, GroupKey};

use crate::caching::{CacheEntry, CacheError, Content};
use crate::config::Config;
use crate::utils::http::DownloadTimeouts;

mod local;
mod remote;
mod resident;

pub use local::LocalBundleBackend;
pub use remote::RemoteCatalogBackend;
pub use resident::ResidentSet;

/// An opaque token for the resources a backend holds on behalf of one load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadHandle(u64);

impl LoadHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The result of loading a single address.
#[derive(Debug)]
pub struct SingleLoad {
    pub handle: LoadHandle,
    pub content: Arc<Content>,
}

/// The result of loading a group.
///
/// Items are reported individually. The handle covers every item that loaded successfully.
#[derive(Debug)]
pub struct GroupLoad {
    pub handle: LoadHandle,
    pub items: Vec<(Address, CacheEntry<Arc<Content>>)>,
}

/// Content that is available remotely but not yet downloaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    /// The addresses that need to be downloaded.
    pub items: Vec<Address>,
    /// The sum of their sizes in bytes.
    pub total_size: u64,
}

/// Byte counters of a running download, shared with whoever reports progress.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    total: AtomicU64,
    downloaded: AtomicU64,
}

impl DownloadProgress {
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes back bytes of an attempt that failed and will be retried.
    pub fn sub_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Returns `(downloaded, total)` in bytes.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.downloaded.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// A pluggable way of loading content.
///
/// Backends hold no bookkeeping on behalf of the cache besides the resources behind the
/// [`LoadHandle`]s they returned. All failures are reported as `Err`, never as empty success.
pub trait Backend: fmt::Debug + Send + Sync + 'static {
    /// A short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Prepares the backend, e.g. by fetching its catalog.
    ///
    /// The cache runs this once before the first load, and again after it was disposed.
    fn initialize(&self) -> BoxFuture<'_, CacheEntry>;

    /// Loads the content at `address`.
    fn load_single<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, CacheEntry<SingleLoad>>;

    /// Loads every address tagged with `group`.
    ///
    /// A group without any members is reported as [`CacheError::NotFound`].
    fn load_group<'a>(&'a self, group: &'a GroupKey) -> BoxFuture<'a, CacheEntry<GroupLoad>>;

    /// Gives back the resources of a previous load.
    fn release(&self, handle: LoadHandle) -> CacheEntry;

    /// Checks which content changed since the backend was initialized.
    fn check_for_updates(&self) -> BoxFuture<'_, CacheEntry<UpdateInfo>>;

    /// Downloads `items`, reporting the bytes transferred to `progress`.
    fn download(
        &self,
        items: Vec<Address>,
        progress: Arc<DownloadProgress>,
    ) -> BoxFuture<'_, CacheEntry>;

    /// Returns the number of bytes that still need to be downloaded for `items`.
    fn get_download_size(&self, items: Vec<Address>) -> BoxFuture<'_, CacheEntry<u64>>;
}

/// Creates the backend selected in the configuration.
pub fn create_backend(config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match &config.backend {
        BackendConfig::Local(local) => Arc::new(LocalBundleBackend::new(local.clone())),
        BackendConfig::Remote(remote) => Arc::new(
            RemoteCatalogBackend::new(
                remote.clone(),
                config.cache_dir.as_deref(),
                DownloadTimeouts::from_config(config),
                config.connect_to_reserved_ips,
            )
            .context("failed to create remote catalog backend")?,
        ),
    };

    tracing::debug!(backend = backend.name(), "created backend");
    Ok(backend)
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
pub(crate) async fn retry<G, F, T>(task_gen: G) -> CacheEntry<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheEntry<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_) | Err(CacheError::NotFound(_) | CacheError::PermissionDenied(_))
        );

        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn unsupported<T>(operation: &str) -> CacheEntry<T> {
    Err(CacheError::Unsupported(format!(
        "{operation} is not supported by local bundles"
    )))
}
