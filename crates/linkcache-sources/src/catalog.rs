//! The index a backend uses to resolve addresses and groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Address, GroupKey};

/// How the bytes of a catalog entry are turned into loaded content.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Opaque bytes, handed out as they are.
    #[default]
    Blob,
    /// A JSON template with named components.
    Template,
    /// A JSON data record tagged with its type name.
    Record,
}

impl ContentKind {
    /// The name of this kind, as used in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Template => "template",
            Self::Record => "record",
        }
    }
}

/// A single piece of content listed in a [`Catalog`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CatalogEntry {
    /// Path of the content, relative to the root of the backend.
    pub path: String,

    /// How the content is decoded.
    #[serde(default)]
    pub kind: ContentKind,

    /// Size of the content in bytes.
    #[serde(default)]
    pub size: u64,

    /// Lowercase hex SHA-256 of the content.
    ///
    /// Remote backends verify downloads against it and use it to name downloaded files.
    #[serde(default)]
    pub hash: String,

    /// The groups this content is tagged with.
    #[serde(default)]
    pub groups: Vec<GroupKey>,
}

/// The index of all content a backend can load.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Catalog {
    /// An opaque version string of this catalog.
    #[serde(default)]
    pub version: String,

    /// All known entries, keyed by address.
    #[serde(default)]
    pub entries: BTreeMap<Address, CatalogEntry>,
}

impl Catalog {
    /// Parses a catalog from its JSON representation.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Looks up the entry for `address`.
    pub fn get(&self, address: &Address) -> Option<&CatalogEntry> {
        self.entries.get(address)
    }

    /// Returns all addresses tagged with `group`, in address order.
    pub fn addresses_in(&self, group: &GroupKey) -> Vec<Address> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.groups.contains(group))
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Returns the addresses that are new or whose content changed compared to `previous`.
    ///
    /// Without a previous catalog, every address counts as changed.
    pub fn changed_since(&self, previous: Option<&Catalog>) -> Vec<Address> {
        self.entries
            .iter()
            .filter(|(address, entry)| {
                previous
                    .and_then(|previous| previous.get(address))
                    .is_none_or(|old| old.hash != entry.hash)
            })
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Sums up the sizes of the given addresses.
    ///
    /// Returns the first address that is not part of this catalog as error.
    pub fn total_size<'a>(
        &self,
        items: impl IntoIterator<Item = &'a Address>,
    ) -> Result<u64, &'a Address> {
        items.into_iter().try_fold(0, |sum, address| {
            self.get(address)
                .map(|entry| sum + entry.size)
                .ok_or(address)
        })
    }
}
