use std::sync::Arc;

use linkcache_sources::Address;

use super::{DataRecord, RecordLink};
use crate::caching::{CacheError, LoadFuture, LoadingCache};
use crate::utils::futures::ready_shared;

/// The folder singleton records live in, unless their convention says otherwise.
pub const DEFAULT_SINGLETON_FOLDER: &str = "singletons";

/// Marks a [`DataRecord`] as having exactly one instance at a well-known address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SingletonConvention {
    /// Overrides [`DEFAULT_SINGLETON_FOLDER`].
    pub folder: Option<&'static str>,
}

impl SingletonConvention {
    /// A singleton in the default folder.
    pub const DEFAULT: Self = Self { folder: None };

    /// A singleton in `folder`.
    pub const fn in_folder(folder: &'static str) -> Self {
        Self {
            folder: Some(folder),
        }
    }

    pub fn folder(&self) -> &'static str {
        self.folder.unwrap_or(DEFAULT_SINGLETON_FOLDER)
    }
}

/// Returns the address of the single instance of `T`, i.e. `<folder>/<type name>`.
///
/// Returns `None` for records without a [`SingletonConvention`].
pub fn resolve_singleton_address<T: DataRecord>() -> Option<Address> {
    let convention = T::SINGLETON?;
    Some(Address::new(format!(
        "{}/{}",
        convention.folder(),
        T::TYPE_NAME
    )))
}

fn singleton_address<T: DataRecord>() -> Option<Address> {
    let address = resolve_singleton_address::<T>();
    if address.is_none() {
        let err = CacheError::NoSingletonConvention(T::TYPE_NAME);
        tracing::error!(error = &err as &dyn std::error::Error);
    }
    address
}

impl LoadingCache {
    /// Returns the singleton `T` if it is loaded.
    pub fn get_singleton<T: DataRecord>(&self) -> Option<Arc<T>> {
        let address = singleton_address::<T>()?;
        RecordLink::<T>::new(address).value(self)
    }

    /// Loads the singleton `T`.
    pub fn load_singleton<T: DataRecord>(&self) -> LoadFuture<T> {
        match singleton_address::<T>() {
            Some(address) => RecordLink::<T>::new(address).load(self),
            None => ready_shared(Err(CacheError::NoSingletonConvention(T::TYPE_NAME))),
        }
    }

    /// Whether the singleton `T` is loaded.
    pub fn is_prewarmed<T: DataRecord>(&self) -> bool {
        singleton_address::<T>().is_some_and(|address| self.loaded(&address))
    }
}
