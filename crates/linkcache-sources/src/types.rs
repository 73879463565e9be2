use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The path naming a piece of content.
///
/// Addresses are compared case-sensitively, byte by byte. The empty string and
/// [`Address::NULL`] both mean "unset".
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The reserved sentinel that intentionally points to nothing.
    pub const NULL: &'static str = "00000000000000000000000000000000";

    /// Creates a new [`Address`].
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Returns an address set to the [`NULL`](Self::NULL) sentinel.
    pub fn null() -> Self {
        Self(Self::NULL.to_owned())
    }

    /// Whether this address is empty or the sentinel.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == Self::NULL
    }

    /// Deref the [`Address`] to a `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Address {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl Borrow<str> for Address {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A label under which several addresses are loaded and released together.
///
/// This is essentially a newtype for a string.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    /// Creates a new [`GroupKey`].
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Deref the [`GroupKey`] to a `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for GroupKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
