use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use linkcache_sources::{Address, ContentKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CacheEntry, CacheError};

/// An instantiable template made of named components.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Template {
    /// The name of the template.
    pub name: String,
    /// The components of the template, keyed by component name.
    #[serde(default)]
    pub components: BTreeMap<String, Value>,
}

impl Template {
    /// Returns the raw data of the component named `name`.
    pub fn component(&self, name: &str) -> Option<&Value> {
        self.components.get(name)
    }
}

/// A data record tagged with the name of its type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Record {
    /// The type the data belongs to.
    #[serde(rename = "type")]
    pub type_name: String,
    /// The record data.
    #[serde(default)]
    pub data: Value,
}

/// A loaded content object.
///
/// There is at most one instance per address in the cache, shared by every link
/// that resolved it.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Blob(Bytes),
    Template(Template),
    Record(Record),
}

impl Content {
    /// Decodes the bytes of the content at `address` according to its catalog kind.
    pub fn decode(kind: ContentKind, address: &Address, bytes: Bytes) -> CacheEntry<Self> {
        let malformed = |err: serde_json::Error| {
            CacheError::Malformed(format!("failed to decode `{address}`: {err}"))
        };

        Ok(match kind {
            ContentKind::Blob => Self::Blob(bytes),
            ContentKind::Template => Self::Template(serde_json::from_slice(&bytes).map_err(malformed)?),
            ContentKind::Record => Self::Record(serde_json::from_slice(&bytes).map_err(malformed)?),
        })
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Blob(_) => ContentKind::Blob,
            Self::Template(_) => ContentKind::Template,
            Self::Record(_) => ContentKind::Record,
        }
    }

    /// A human readable description of the content, used in type mismatch errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Blob(bytes) => format!("blob of {} bytes", bytes.len()),
            Self::Template(template) => format!("template `{}`", template.name),
            Self::Record(record) => format!("record `{}`", record.type_name),
        }
    }
}

/// Types that a piece of content can be viewed as directly.
pub trait FromContent: Send + Sync + 'static {
    /// Describes the expected content in errors.
    const EXPECTED: &'static str;

    /// Converts the content at `address`.
    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>>;
}

pub(crate) fn type_mismatch(address: &Address, expected: &str, content: &Content) -> CacheError {
    CacheError::TypeMismatch {
        address: address.clone(),
        expected: expected.to_owned(),
        found: content.describe(),
    }
}

impl FromContent for Content {
    const EXPECTED: &'static str = "content";

    fn from_content(_address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        Ok(Arc::clone(content))
    }
}

impl FromContent for Bytes {
    const EXPECTED: &'static str = "blob";

    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        match content.as_ref() {
            Content::Blob(bytes) => Ok(Arc::new(bytes.clone())),
            other => Err(type_mismatch(address, Self::EXPECTED, other)),
        }
    }
}

impl FromContent for String {
    const EXPECTED: &'static str = "text blob";

    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        match content.as_ref() {
            Content::Blob(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Ok(Arc::new(text.to_owned())),
                Err(err) => Err(CacheError::Malformed(format!("`{address}` is not text: {err}"))),
            },
            other => Err(type_mismatch(address, Self::EXPECTED, other)),
        }
    }
}

impl FromContent for Value {
    const EXPECTED: &'static str = "JSON";

    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        let value = match content.as_ref() {
            Content::Blob(bytes) => serde_json::from_slice(bytes).map_err(|err| {
                CacheError::Malformed(format!("`{address}` is not JSON: {err}"))
            })?,
            Content::Template(template) => {
                serde_json::to_value(template).map_err(CacheError::from_std_error)?
            }
            Content::Record(record) => record.data.clone(),
        };
        Ok(Arc::new(value))
    }
}

impl FromContent for Template {
    const EXPECTED: &'static str = "template";

    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        match content.as_ref() {
            Content::Template(template) => Ok(Arc::new(template.clone())),
            other => Err(type_mismatch(address, Self::EXPECTED, other)),
        }
    }
}

impl FromContent for Record {
    const EXPECTED: &'static str = "record";

    fn from_content(address: &Address, content: &Arc<Content>) -> CacheEntry<Arc<Self>> {
        match content.as_ref() {
            Content::Record(record) => Ok(Arc::new(record.clone())),
            other => Err(type_mismatch(address, Self::EXPECTED, other)),
        }
    }
}
