use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::FutureExt;
use linkcache_sources::Address;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Link, SingletonConvention};
use crate::caching::{
    CacheEntry, CacheError, Content, FromContent, LoadFuture, LoadingCache, type_mismatch,
};
use crate::utils::futures::ready_shared;

/// A named component of a template, e.g. the `dialog` of a popup.
pub trait Component: DeserializeOwned + Send + Sync + 'static {
    /// The name of the component within its template.
    const NAME: &'static str;
}

/// A typed data record.
pub trait DataRecord: DeserializeOwned + Send + Sync + 'static {
    /// The type name the record content must carry.
    const TYPE_NAME: &'static str;

    /// Where the single instance of this record lives, if there is one.
    ///
    /// See [`resolve_singleton_address`](super::resolve_singleton_address).
    const SINGLETON: Option<SingletonConvention> = None;
}

/// How a typed link gets its value out of loaded content.
pub trait Extract: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn extract(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self::Output>>;
}

/// Uses the content itself, see [`FromContent`].
pub struct AsContent<T>(PhantomData<fn() -> T>);

impl<T: FromContent> Extract for AsContent<T> {
    type Output = T;

    fn extract(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<T>> {
        T::from_content(address, content)
    }
}

/// Uses the component `T::NAME` of a template.
pub struct AsComponent<T>(PhantomData<fn() -> T>);

impl<T: Component> Extract for AsComponent<T> {
    type Output = T;

    fn extract(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<T>> {
        let Content::Template(template) = content.as_ref() else {
            return Err(type_mismatch(address, "template", content));
        };
        let raw = template
            .component(T::NAME)
            .ok_or_else(|| CacheError::MissingSubComponent {
                address: address.clone(),
                component: T::NAME,
            })?;

        let component = T::deserialize(raw).map_err(|err| {
            CacheError::Malformed(format!(
                "invalid component `{}` of `{address}`: {err}",
                T::NAME
            ))
        })?;
        Ok(Arc::new(component))
    }
}

/// Uses the data of a record whose type is `T::TYPE_NAME`.
pub struct AsRecord<T>(PhantomData<fn() -> T>);

impl<T: DataRecord> Extract for AsRecord<T> {
    type Output = T;

    fn extract(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<T>> {
        let record = match content.as_ref() {
            Content::Record(record) if record.type_name == T::TYPE_NAME => record,
            other => {
                let expected = format!("record `{}`", T::TYPE_NAME);
                return Err(type_mismatch(address, &expected, other));
            }
        };

        let data = T::deserialize(&record.data).map_err(|err| {
            CacheError::Malformed(format!("invalid `{}` at `{address}`: {err}", T::TYPE_NAME))
        })?;
        Ok(Arc::new(data))
    }
}

/// A link to content used as is, e.g. `ContentLink<String>` for text.
pub type ContentLink<T> = TypedLink<AsContent<T>>;

/// A link to a template, resolving to its component `T`.
pub type TemplateLink<T> = TypedLink<AsComponent<T>>;

/// A link to a data record of type `T`.
pub type RecordLink<T> = TypedLink<AsRecord<T>>;

struct Memo<T> {
    resolved: Option<Arc<T>>,
    in_flight: Option<LoadFuture<T>>,
    /// Bumped on release, so loads started before are not remembered.
    generation: u64,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            resolved: None,
            in_flight: None,
            generation: 0,
        }
    }
}

/// A [`Link`] that resolves to a `T` and remembers it.
///
/// The resolved value is transient. It is neither serialized nor compared, and clones start out
/// with whatever the original had resolved at the time.
pub struct TypedLink<X: Extract> {
    link: Link,
    memo: Arc<Mutex<Memo<X::Output>>>,
}

impl<X: Extract> TypedLink<X> {
    pub fn new(address: impl Into<Address>) -> Self {
        Self::from(Link::new(address))
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn address(&self) -> &Address {
        self.link.address()
    }

    pub fn has_value(&self) -> bool {
        self.link.has_value()
    }

    /// Returns the value if its content is already loaded.
    ///
    /// Accessing content that was not loaded before is a mistake of the caller. It is logged and
    /// `None` is returned.
    pub fn value(&self, cache: &LoadingCache) -> Option<Arc<X::Output>> {
        let mut memo = self.memo.lock();
        if let Some(resolved) = &memo.resolved {
            return Some(Arc::clone(resolved));
        }
        if !self.has_value() {
            return None;
        }

        let address = self.address();
        let Some(content) = cache.get_content(address) else {
            let err = CacheError::NotLoadedYet(address.clone());
            metric!(counter("links.not_loaded") += 1);
            tracing::warn!(error = &err as &dyn std::error::Error);
            return None;
        };

        match X::extract(address, &content) {
            Ok(value) => {
                memo.resolved = Some(Arc::clone(&value));
                Some(value)
            }
            Err(err) => {
                tracing::warn!(error = &err as &dyn std::error::Error, "Failed to resolve link");
                None
            }
        }
    }

    /// Loads the value through `cache`.
    ///
    /// Repeated calls share one load until it completes. Only a successful result is remembered.
    pub fn load(&self, cache: &LoadingCache) -> LoadFuture<X::Output> {
        if !self.has_value() {
            return ready_shared(Err(CacheError::NoValue));
        }

        let mut memo = self.memo.lock();
        if let Some(resolved) = &memo.resolved {
            return ready_shared(Ok(Arc::clone(resolved)));
        }
        if let Some(in_flight) = &memo.in_flight {
            return in_flight.clone();
        }

        let address = self.address().clone();
        if let Some(content) = cache.get_content(&address) {
            let result = X::extract(&address, &content);
            if let Ok(value) = &result {
                memo.resolved = Some(Arc::clone(value));
            }
            return ready_shared(result);
        }

        let load = cache.load_address(&address);
        let generation = memo.generation;
        let weak_memo = Arc::downgrade(&self.memo);
        let future = async move {
            let result = load
                .await
                .and_then(|content| X::extract(&address, &content));

            if let Some(memo) = weak_memo.upgrade() {
                let mut memo = memo.lock();
                if memo.generation == generation {
                    memo.in_flight = None;
                    if let Ok(value) = &result {
                        memo.resolved = Some(Arc::clone(value));
                    }
                }
            }
            result
        }
        .boxed()
        .shared();

        memo.in_flight = Some(future.clone());
        future
    }

    /// Forgets the resolved value and releases the ad hoc load of the content.
    ///
    /// Content that was loaded through a group stays loaded. Returns whether anything was
    /// released in the cache.
    pub fn release(&self, cache: &LoadingCache) -> bool {
        {
            let mut memo = self.memo.lock();
            memo.resolved = None;
            memo.in_flight = None;
            memo.generation += 1;
        }

        self.has_value() && cache.release_address(self.address())
    }
}

impl<X: Extract> From<Link> for TypedLink<X> {
    fn from(link: Link) -> Self {
        Self {
            link,
            memo: Default::default(),
        }
    }
}

impl<X: Extract> Default for TypedLink<X> {
    fn default() -> Self {
        Self::from(Link::null())
    }
}

impl<X: Extract> Clone for TypedLink<X> {
    fn clone(&self) -> Self {
        let memo = self.memo.lock();
        Self {
            link: self.link.clone(),
            memo: Arc::new(Mutex::new(Memo {
                resolved: memo.resolved.clone(),
                in_flight: memo.in_flight.clone(),
                generation: memo.generation,
            })),
        }
    }
}

impl<X: Extract> fmt::Debug for TypedLink<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedLink")
            .field("address", self.address())
            .field("resolved", &self.memo.lock().resolved.is_some())
            .finish()
    }
}

impl<X: Extract> PartialEq for TypedLink<X> {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link
    }
}

impl<X: Extract> Eq for TypedLink<X> {}

impl<X: Extract> Hash for TypedLink<X> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.link.hash(state);
    }
}

impl<X: Extract> Serialize for TypedLink<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.link.serialize(serializer)
    }
}

impl<'de, X: Extract> Deserialize<'de> for TypedLink<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Link::deserialize(deserializer).map(Self::from)
    }
}
