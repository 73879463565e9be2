use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use linkcache_sources::Address;
use parking_lot::Mutex;

use super::{GroupLoad, LoadHandle, SingleLoad};
use crate::caching::{CacheEntry, CacheError, Content};

#[derive(Debug)]
struct Resident {
    content: Arc<Content>,
    refs: usize,
}

type PendingFetch = Shared<BoxFuture<'static, CacheEntry<Arc<Content>>>>;

#[derive(Default)]
struct Residents {
    contents: BTreeMap<Address, Resident>,
    handles: BTreeMap<LoadHandle, Vec<Address>>,
    /// Fetches that are running or whose result is not acquired yet.
    pending: BTreeMap<Address, PendingFetch>,
}

impl fmt::Debug for Residents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Residents")
            .field("contents", &self.contents)
            .field("handles", &self.handles)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

enum Lookup<'a> {
    Resident(Arc<Content>),
    Pending(PendingFetch),
    Fetch(oneshot::Sender<CacheEntry<Arc<Content>>>, PendingGuard<'a>),
}

/// Removes a pending fetch from its [`ResidentSet`] when dropped.
///
/// It is held until the fetched content has been acquired, so an address is always either
/// resident or pending while its content is on its way.
struct PendingGuard<'a> {
    set: &'a ResidentSet,
    address: Address,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.set.inner.lock().pending.remove(&self.address);
    }
}

/// Reference counted content held by a backend on behalf of its load handles.
///
/// Content stays resident as long as any handle refers to it, so it is never fetched twice
/// while in use. Concurrent loads of the same address share a single fetch.
#[derive(Debug, Default)]
pub struct ResidentSet {
    next_handle: AtomicU64,
    inner: Mutex<Residents>,
}

impl ResidentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resident content at `address`.
    pub fn get(&self, address: &Address) -> Option<Arc<Content>> {
        let inner = self.inner.lock();
        inner.contents.get(address).map(|r| Arc::clone(&r.content))
    }

    /// Makes `contents` resident under a new handle.
    ///
    /// Content that is already resident wins over the passed in instance, the returned list
    /// holds the instances that are actually resident.
    pub fn acquire(
        &self,
        contents: Vec<(Address, Arc<Content>)>,
    ) -> (LoadHandle, Vec<(Address, Arc<Content>)>) {
        let handle = LoadHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);

        let mut inner = self.inner.lock();
        let mut acquired = Vec::with_capacity(contents.len());
        for (address, content) in contents {
            let resident = inner
                .contents
                .entry(address.clone())
                .or_insert(Resident { content, refs: 0 });
            resident.refs += 1;
            acquired.push((address, Arc::clone(&resident.content)));
        }

        let addresses = acquired.iter().map(|(address, _)| address.clone()).collect();
        inner.handles.insert(handle, addresses);
        (handle, acquired)
    }

    /// Drops the references of `handle`, evicting content nobody refers to anymore.
    pub fn release(&self, handle: LoadHandle) -> CacheEntry {
        let mut inner = self.inner.lock();
        let Some(addresses) = inner.handles.remove(&handle) else {
            return Err(CacheError::NotFound(format!("load handle {handle}")));
        };

        for address in addresses {
            let evict = match inner.contents.get_mut(&address) {
                Some(resident) => {
                    resident.refs -= 1;
                    resident.refs == 0
                }
                None => false,
            };
            if evict {
                inner.contents.remove(&address);
            }
        }
        Ok(())
    }

    /// The number of live handles.
    pub fn handles(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// The number of resident contents.
    pub fn len(&self) -> usize {
        self.inner.lock().contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, address: &Address) -> Lookup<'_> {
        let mut inner = self.inner.lock();
        if let Some(resident) = inner.contents.get(address) {
            return Lookup::Resident(Arc::clone(&resident.content));
        }
        if let Some(pending) = inner.pending.get(address) {
            return Lookup::Pending(pending.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let pending = receiver
            .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
            .boxed()
            .shared();
        inner.pending.insert(address.clone(), pending);

        let guard = PendingGuard {
            set: self,
            address: address.clone(),
        };
        Lookup::Fetch(sender, guard)
    }

    /// Returns the content at `address`, joining a pending fetch or starting one with `fetch`.
    ///
    /// A started fetch stays pending until the returned guard is dropped.
    async fn fetch_shared<F, Fut>(
        &self,
        address: &Address,
        fetch: F,
    ) -> (CacheEntry<Arc<Content>>, Option<PendingGuard<'_>>)
    where
        F: FnOnce(Address) -> Fut,
        Fut: Future<Output = CacheEntry<Content>>,
    {
        match self.lookup(address) {
            Lookup::Resident(content) => (Ok(content), None),
            Lookup::Pending(pending) => (pending.await, None),
            Lookup::Fetch(sender, guard) => {
                let result = fetch(address.clone()).await.map(Arc::new);
                // nobody may be waiting
                sender.send(result.clone()).ok();
                (result, Some(guard))
            }
        }
    }

    /// Loads `address`, fetching it with `fetch` unless it is already resident or pending.
    pub async fn load_single<F, Fut>(&self, address: &Address, fetch: F) -> CacheEntry<SingleLoad>
    where
        F: FnOnce(Address) -> Fut,
        Fut: Future<Output = CacheEntry<Content>>,
    {
        let (result, _pending) = self.fetch_shared(address, fetch).await;
        let content = result?;

        let (handle, mut acquired) = self.acquire(vec![(address.clone(), content)]);
        let (_, content) = acquired.pop().ok_or(CacheError::InternalError)?;
        Ok(SingleLoad { handle, content })
    }

    /// Loads all `addresses` concurrently, fetching the ones that are not resident or pending.
    ///
    /// Every address that loaded successfully is acquired under the returned handle, failures
    /// are reported per item.
    pub async fn load_group<F, Fut>(&self, addresses: Vec<Address>, fetch: F) -> GroupLoad
    where
        F: Fn(Address) -> Fut,
        Fut: Future<Output = CacheEntry<Content>>,
    {
        let fetches = addresses
            .iter()
            .map(|address| self.fetch_shared(address, &fetch));
        let (results, _pending): (Vec<_>, Vec<_>) =
            future::join_all(fetches).await.into_iter().unzip();

        let loaded = addresses
            .iter()
            .zip(&results)
            .filter_map(|(address, result)| {
                let content = result.as_ref().ok()?;
                Some((address.clone(), Arc::clone(content)))
            })
            .collect();
        let (handle, acquired) = self.acquire(loaded);
        let mut acquired = acquired.into_iter();

        let items = addresses
            .into_iter()
            .zip(results)
            .map(|(address, result)| {
                let result = match result {
                    Ok(_) => acquired
                        .next()
                        .map(|(_, content)| content)
                        .ok_or(CacheError::InternalError),
                    Err(err) => Err(err),
                };
                (address, result)
            })
            .collect();

        GroupLoad { handle, items }
    }
}
