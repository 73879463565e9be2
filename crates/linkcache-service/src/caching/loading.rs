use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use linkcache_sources::{Address, GroupKey};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

use super::{CacheEntry, CacheError, Content, FromContent};
use crate::backend::{Backend, DownloadProgress, GroupLoad, LoadHandle, SingleLoad, UpdateInfo};
use crate::config::Config;
use crate::utils::futures::{CallOnDrop, ready_shared};

/// A shared future resolving to loaded content, cloneable by any number of waiters.
pub type LoadFuture<T> = Shared<BoxFuture<'static, CacheEntry<Arc<T>>>>;

/// All contents of a group, in address order.
pub type GroupContents = Arc<[Arc<Content>]>;

/// A shared future resolving to the contents of a group.
pub type GroupFuture = Shared<BoxFuture<'static, CacheEntry<GroupContents>>>;

type InitFuture = Shared<BoxFuture<'static, CacheEntry>>;

/// What happens to content listed by several groups when one of them is released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Releasing a group evicts every address it listed, even if another active group also
    /// lists it.
    #[default]
    Eager,
    /// An address is evicted once the last active group listing it is released.
    RefCounted,
}

/// The shortest interval in which [`LoadingCache::download_updates`] reports progress.
const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(1);

/// Options of a [`LoadingCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    pub eviction: EvictionPolicy,
    /// How often [`LoadingCache::download_updates`] reports progress.
    pub progress_interval: Duration,
}

impl CacheOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            eviction: config.eviction,
            progress_interval: config.progress_interval,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            eviction: EvictionPolicy::default(),
            progress_interval: Duration::from_millis(100),
        }
    }
}

struct Init {
    op: u64,
    channel: InitFuture,
    ready: bool,
}

struct InFlight {
    op: u64,
    channel: LoadFuture<Content>,
}

struct GroupMembers {
    op: u64,
    channel: GroupFuture,
    /// `None` while the group is loading.
    addresses: Option<Vec<Address>>,
}

#[derive(Default)]
struct CacheState {
    /// At most one instance per address, the first writer wins.
    loaded: BTreeMap<Address, Arc<Content>>,
    /// Backend handles of the groups that loaded successfully.
    active_group_ops: BTreeMap<GroupKey, LoadHandle>,
    group_members: BTreeMap<GroupKey, GroupMembers>,
    /// Backend handles of ad hoc single loads.
    single_ops: BTreeMap<Address, LoadHandle>,
    in_flight: BTreeMap<Address, InFlight>,
    /// The number of active groups listing an address.
    memberships: BTreeMap<Address, usize>,
    init: Option<Init>,
    epoch: u64,
    last_op: u64,
}

impl CacheState {
    fn next_op(&mut self) -> u64 {
        self.last_op += 1;
        self.last_op
    }
}

struct CacheInner {
    backend: Arc<dyn Backend>,
    options: CacheOptions,
    runtime: Handle,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn release_handle(&self, handle: LoadHandle) {
        if let Err(err) = self.backend.release(handle) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                %handle,
                "Failed to release load handle"
            );
        }
    }

    fn finish_single(
        &self,
        op: u64,
        epoch: u64,
        address: &Address,
        result: CacheEntry<SingleLoad>,
    ) -> CacheEntry<Arc<Content>> {
        let load = result?;

        let mut state = self.state.lock();
        let attached =
            state.epoch == epoch && state.in_flight.get(address).is_some_and(|f| f.op == op);
        if !attached {
            drop(state);
            tracing::debug!("Discarding detached load of {}", address);
            self.release_handle(load.handle);
            return Ok(load.content);
        }

        state.in_flight.remove(address);
        if let Some(existing) = state.loaded.get(address).cloned() {
            drop(state);
            self.release_handle(load.handle);
            return Ok(existing);
        }

        state
            .loaded
            .insert(address.clone(), Arc::clone(&load.content));
        state.single_ops.insert(address.clone(), load.handle);
        Ok(load.content)
    }

    fn finish_group(
        &self,
        op: u64,
        epoch: u64,
        group: &GroupKey,
        result: CacheEntry<GroupLoad>,
    ) -> CacheEntry<GroupContents> {
        let GroupLoad { handle, items } = result?;

        let mut contents = Vec::with_capacity(items.len());
        let mut failure = None;
        for (address, item) in items {
            match item {
                Ok(content) => contents.push((address, content)),
                Err(err) => {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        "Failed to load {} of group {}",
                        address,
                        group
                    );
                    failure.get_or_insert(err);
                }
            }
        }

        let mut state = self.state.lock();
        let attached =
            state.epoch == epoch && state.group_members.get(group).is_some_and(|m| m.op == op);

        if let Some(err) = failure {
            // Nothing of this group has been inserted yet, dropping the entry is all it takes
            // to roll back and allow a fresh attempt.
            if attached {
                state.group_members.remove(group);
            }
            drop(state);
            self.release_handle(handle);
            return Err(err);
        }

        if !attached {
            drop(state);
            tracing::debug!("Discarding detached load of group {}", group);
            self.release_handle(handle);
            return Ok(contents.into_iter().map(|(_, content)| content).collect());
        }

        let mut addresses = Vec::with_capacity(contents.len());
        let mut resolved = Vec::with_capacity(contents.len());
        for (address, content) in contents {
            let content = Arc::clone(state.loaded.entry(address.clone()).or_insert(content));
            *state.memberships.entry(address.clone()).or_default() += 1;
            addresses.push(address);
            resolved.push(content);
        }

        if let Some(members) = state.group_members.get_mut(group) {
            members.addresses = Some(addresses);
        }
        state.active_group_ops.insert(group.clone(), handle);
        metric!(gauge("caches.loaded") = state.loaded.len() as u64);

        Ok(resolved.into())
    }
}

/// Turns the receiving end of a spawned computation into a shareable future.
fn channel_future<T>(
    receiver: oneshot::Receiver<CacheEntry<T>>,
    name: &'static str,
) -> Shared<BoxFuture<'static, CacheEntry<T>>>
where
    T: Clone + Send + 'static,
{
    receiver
        .map(move |result| {
            result.unwrap_or_else(|_canceled| {
                tracing::error!("{name} channel dropped");
                Err(CacheError::InternalError)
            })
        })
        .boxed()
        .shared()
}

/// Resolves addresses and groups to loaded content through a [`Backend`].
///
/// Loads are spawned eagerly on the runtime the cache was created with, and concurrent requests
/// for the same address or group share a single load. Only successful loads are kept, a failed
/// attempt leaves no state behind.
///
/// Content loaded through a group stays in memory until the group is released with
/// [`release_all`](Self::release_all). Content loaded ad hoc stays until it is released
/// explicitly or the cache is [disposed](Self::dispose).
#[derive(Clone)]
pub struct LoadingCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for LoadingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCache")
            .field("backend", &self.inner.backend.name())
            .field("options", &self.inner.options)
            .field("loaded", &self.loaded_count())
            .finish()
    }
}

impl LoadingCache {
    pub fn new(backend: Arc<dyn Backend>, options: CacheOptions, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                options,
                runtime,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Returns the memoized backend initialization, starting it if needed.
    ///
    /// A failed initialization is forgotten, so the next load tries again.
    fn initialize(&self, state: &mut CacheState) -> InitFuture {
        if let Some(init) = &state.init {
            return init.channel.clone();
        }

        let op = state.next_op();
        let (sender, receiver) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let remove_init_token = CallOnDrop::new(move || {
            let mut state = inner.state.lock();
            if state
                .init
                .as_ref()
                .is_some_and(|init| init.op == op && !init.ready)
            {
                state.init = None;
            }
        });

        let inner = Arc::clone(&self.inner);
        let computation = async move {
            tracing::debug!(backend = inner.backend.name(), "Initializing backend");
            let result = inner.backend.initialize().await;
            match &result {
                Ok(()) => {
                    if let Some(init) = inner.state.lock().init.as_mut().filter(|i| i.op == op) {
                        init.ready = true;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        "Backend initialization failed"
                    );
                }
            }
            // Drop the token first to evict a failed initialization. This ensures that callers
            // either get a channel that will succeed, or they create a new one.
            drop(remove_init_token);
            sender.send(result).ok();
        };
        self.inner.runtime.spawn(computation);

        let channel = channel_future(receiver, "initialization");
        state.init = Some(Init {
            op,
            channel: channel.clone(),
            ready: false,
        });
        channel
    }

    /// Whether the content at `address` is in memory.
    pub fn loaded(&self, address: &Address) -> bool {
        self.inner.state.lock().loaded.contains_key(address)
    }

    /// Returns the loaded content at `address` without loading it.
    pub fn get_content(&self, address: &Address) -> Option<Arc<Content>> {
        self.inner.state.lock().loaded.get(address).cloned()
    }

    /// Returns the loaded content at `address` as `T`, without loading it.
    ///
    /// Content that cannot be viewed as `T` is logged and treated as absent.
    pub fn get<T: FromContent>(&self, address: &Address) -> Option<Arc<T>> {
        let content = self.get_content(address)?;
        match T::from_content(address, &content) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = &err as &dyn std::error::Error, "Failed to view content");
                None
            }
        }
    }

    /// Loads the content at `address`.
    ///
    /// Content that is already loaded resolves right away, a pending load of the same address is
    /// shared. Otherwise the backend is initialized if needed and asked for the content.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the load
    /// on the runtime, even if you don’t explicitly `await` its results.
    pub fn load_address(&self, address: &Address) -> LoadFuture<Content> {
        metric!(counter("caches.access") += 1, "kind" => "single");
        if address.is_null() {
            return ready_shared(Err(CacheError::NoValue));
        }

        let mut state = self.inner.state.lock();
        if let Some(content) = state.loaded.get(address) {
            metric!(counter("caches.memory.hit") += 1, "kind" => "single");
            tracing::trace!("Cache hit for {}", address);
            return ready_shared(Ok(Arc::clone(content)));
        }
        if let Some(in_flight) = state.in_flight.get(address) {
            // A concurrent load was deduplicated.
            metric!(counter("caches.channel.hit") += 1, "kind" => "single");
            return in_flight.channel.clone();
        }
        metric!(counter("caches.channel.miss") += 1, "kind" => "single");

        let init = self.initialize(&mut state);
        let op = state.next_op();
        let epoch = state.epoch;
        let (sender, receiver) = oneshot::channel();

        let remove_load_token = {
            let inner = Arc::clone(&self.inner);
            let address = address.clone();
            CallOnDrop::new(move || {
                let mut state = inner.state.lock();
                if state.in_flight.get(&address).is_some_and(|f| f.op == op) {
                    state.in_flight.remove(&address);
                }
            })
        };

        let inner = Arc::clone(&self.inner);
        let owned_address = address.clone();
        let computation = async move {
            tracing::debug!("Loading {} from {} backend", owned_address, inner.backend.name());
            let result = match init.await {
                Ok(()) => inner.backend.load_single(&owned_address).await,
                Err(err) => Err(err),
            };
            let result = inner.finish_single(op, epoch, &owned_address, result);
            drop(remove_load_token);
            sender.send(result).ok();
        };
        self.inner.runtime.spawn(computation);

        let channel = channel_future(receiver, "load");
        state.in_flight.insert(
            address.clone(),
            InFlight {
                op,
                channel: channel.clone(),
            },
        );
        channel
    }

    /// Releases the ad hoc load of `address`.
    ///
    /// A pending load is detached, its result is discarded once it completes. Content that
    /// belongs to an active group is left alone. Returns whether anything was released.
    pub fn release_address(&self, address: &Address) -> bool {
        let mut state = self.inner.state.lock();
        if state.in_flight.remove(address).is_some() {
            tracing::debug!("Detached pending load of {}", address);
            return true;
        }

        let Some(handle) = state.single_ops.remove(address) else {
            if state.memberships.contains_key(address) {
                tracing::warn!(
                    "{} was loaded through a group, release the group instead",
                    address
                );
            }
            return false;
        };
        if !state.memberships.contains_key(address) {
            state.loaded.remove(address);
        }
        drop(state);

        self.inner.release_handle(handle);
        true
    }

    /// Loads every address tagged with `group` in one batch.
    ///
    /// Concurrent and repeated calls share the same future until the group is released. The
    /// future resolves only once every member is in memory. If any member fails, the whole group
    /// fails and nothing of it is kept.
    pub fn preload_all(&self, group: &GroupKey) -> GroupFuture {
        metric!(counter("caches.access") += 1, "kind" => "group");

        let mut state = self.inner.state.lock();
        if let Some(members) = state.group_members.get(group) {
            if members.addresses.is_some() {
                metric!(counter("caches.memory.hit") += 1, "kind" => "group");
            } else {
                metric!(counter("caches.channel.hit") += 1, "kind" => "group");
            }
            return members.channel.clone();
        }
        metric!(counter("caches.channel.miss") += 1, "kind" => "group");

        let init = self.initialize(&mut state);
        let op = state.next_op();
        let epoch = state.epoch;
        let (sender, receiver) = oneshot::channel();

        let remove_group_token = {
            let inner = Arc::clone(&self.inner);
            let group = group.clone();
            CallOnDrop::new(move || {
                let mut state = inner.state.lock();
                let loading = state
                    .group_members
                    .get(&group)
                    .is_some_and(|m| m.op == op && m.addresses.is_none());
                if loading {
                    state.group_members.remove(&group);
                }
            })
        };

        let inner = Arc::clone(&self.inner);
        let owned_group = group.clone();
        let computation = async move {
            tracing::debug!("Loading group {} from {} backend", owned_group, inner.backend.name());
            let start = Instant::now();
            let result = match init.await {
                Ok(()) => inner.backend.load_group(&owned_group).await,
                Err(err) => Err(err),
            };
            let result = inner.finish_group(op, epoch, &owned_group, result);
            match &result {
                Ok(contents) => {
                    metric!(counter("caches.group.loaded") += 1);
                    metric!(
                        timer("caches.group.duration") = start.elapsed(),
                        "backend" => inner.backend.name(),
                    );
                    tracing::debug!("Loaded group {} with {} items", owned_group, contents.len());
                }
                Err(err) => {
                    metric!(counter("caches.group.failed") += 1, "error" => err.metrics_tag());
                    tracing::warn!(
                        error = err as &dyn std::error::Error,
                        "Failed to load group {}",
                        owned_group
                    );
                }
            }
            drop(remove_group_token);
            sender.send(result).ok();
        };
        self.inner.runtime.spawn(computation);

        let channel = channel_future(receiver, "group load");
        state.group_members.insert(
            group.clone(),
            GroupMembers {
                op,
                channel: channel.clone(),
                addresses: None,
            },
        );
        channel
    }

    /// Releases a loaded group and evicts its contents according to the eviction policy.
    ///
    /// Returns `false` if the group is not active, including while it is still loading.
    pub fn release_all(&self, group: &GroupKey) -> bool {
        let mut state = self.inner.state.lock();
        let Some(handle) = state.active_group_ops.remove(group) else {
            return false;
        };
        let addresses = state
            .group_members
            .remove(group)
            .and_then(|members| members.addresses)
            .unwrap_or_default();

        let eviction = self.inner.options.eviction;
        let mut evicted = 0;
        for address in &addresses {
            let remaining = match state.memberships.get_mut(address) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                state.memberships.remove(address);
            }

            let evict = !state.single_ops.contains_key(address)
                && match eviction {
                    EvictionPolicy::Eager => true,
                    EvictionPolicy::RefCounted => remaining == 0,
                };
            if evict && state.loaded.remove(address).is_some() {
                evicted += 1;
            }
        }
        metric!(gauge("caches.loaded") = state.loaded.len() as u64);
        drop(state);

        self.inner.release_handle(handle);
        metric!(counter("caches.group.released") += 1);
        tracing::debug!(
            "Released group {}, evicted {} of {} items",
            group,
            evicted,
            addresses.len()
        );
        true
    }

    /// Releases everything and resets the cache.
    ///
    /// Every backend handle is released, failures are logged and do not stop the rest. The next
    /// load initializes the backend again, loads still pending are discarded when they complete.
    pub fn dispose(&self) {
        let (groups, singles) = {
            let mut state = self.inner.state.lock();
            let groups = std::mem::take(&mut state.active_group_ops);
            let singles = std::mem::take(&mut state.single_ops);
            state.loaded.clear();
            state.group_members.clear();
            state.in_flight.clear();
            state.memberships.clear();
            state.init = None;
            state.epoch += 1;
            (groups, singles)
        };

        for (group, handle) in groups {
            if let Err(err) = self.inner.backend.release(handle) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to release group {}",
                    group
                );
            }
        }
        for (address, handle) in singles {
            if let Err(err) = self.inner.backend.release(handle) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to release {}",
                    address
                );
            }
        }
        tracing::debug!("Disposed loading cache");
    }

    /// Asks the backend which content changed since it was initialized.
    pub async fn check_for_updates(&self) -> CacheEntry<UpdateInfo> {
        self.inner.backend.check_for_updates().await
    }

    /// Downloads `items`, calling `on_progress(downloaded, total)` periodically.
    ///
    /// A final progress report is made once the backend is done, whether it succeeded or not.
    pub async fn download_updates<F>(&self, items: Vec<Address>, mut on_progress: F) -> CacheEntry
    where
        F: FnMut(u64, u64),
    {
        let progress = Arc::new(DownloadProgress::default());
        let mut download = self.inner.backend.download(items, Arc::clone(&progress));

        let period = self.inner.options.progress_interval.max(MIN_PROGRESS_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                result = &mut download => break result,
                _ = ticker.tick() => {
                    let (downloaded, total) = progress.snapshot();
                    on_progress(downloaded, total);
                }
            }
        };

        let (downloaded, total) = progress.snapshot();
        on_progress(downloaded, total);
        result
    }

    /// Downloads whatever [`check_for_updates`](Self::check_for_updates) reports, if anything.
    pub async fn download_updates_if_needed<F>(&self, on_progress: F) -> CacheEntry
    where
        F: FnMut(u64, u64),
    {
        let updates = self.check_for_updates().await?;
        if updates.total_size == 0 {
            tracing::debug!("No updates to download");
            return Ok(());
        }
        self.download_updates(updates.items, on_progress).await
    }

    /// Returns the number of bytes that still need to be downloaded for `items`.
    pub async fn get_download_size(&self, items: Vec<Address>) -> CacheEntry<u64> {
        self.inner.backend.get_download_size(items).await
    }

    /// The groups that are loaded and not released.
    pub fn active_groups(&self) -> Vec<GroupKey> {
        self.inner
            .state
            .lock()
            .active_group_ops
            .keys()
            .cloned()
            .collect()
    }

    /// The addresses a group loaded, or `None` if it is not loaded.
    pub fn group_addresses(&self, group: &GroupKey) -> Option<Vec<Address>> {
        let state = self.inner.state.lock();
        state.group_members.get(group)?.addresses.clone()
    }

    pub fn is_group_active(&self, group: &GroupKey) -> bool {
        self.inner.state.lock().active_group_ops.contains_key(group)
    }

    /// The number of contents in memory.
    pub fn loaded_count(&self) -> usize {
        self.inner.state.lock().loaded.len()
    }
}
