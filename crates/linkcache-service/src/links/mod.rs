//! Serializable references to content.
//!
//! A [`Link`] is nothing but an address. The typed variants in this module add lazy resolution
//! through a [`LoadingCache`](crate::caching::LoadingCache) and remember what they resolved.

use linkcache_sources::Address;
use serde::{Deserialize, Serialize};

mod singleton;
mod typed;

pub use singleton::*;
pub use typed::*;

/// A reference to the content at an address.
///
/// Links compare, hash and serialize by their address only.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Link {
    address: Address,
}

impl Link {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// A link that intentionally points to nothing.
    pub fn null() -> Self {
        Self::new(Address::null())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Whether the link points at anything.
    pub fn has_value(&self) -> bool {
        !self.address.is_null()
    }
}

impl From<Address> for Link {
    fn from(address: Address) -> Self {
        Self { address }
    }
}

impl From<&str> for Link {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}
