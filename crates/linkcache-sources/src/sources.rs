//! Configuration of the places content is loaded from.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod local;
mod remote;
pub use local::*;
pub use remote::*;

/// The name of the catalog file, unless configured otherwise.
pub const DEFAULT_CATALOG_NAME: &str = "catalog.json";

fn default_catalog_name() -> String {
    DEFAULT_CATALOG_NAME.to_owned()
}

/// Configuration of the backend content is loaded from.
///
/// Exactly one backend is active per process. It is picked once at startup.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A bundle directory on the local file system.
    Local(Arc<LocalBundleConfig>),
    /// A catalog served over HTTP, downloaded incrementally.
    Remote(Arc<RemoteCatalogConfig>),
}

impl BackendConfig {
    /// Returns the short name of the backend type, used in logs and metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local(..) => "local",
            Self::Remote(..) => "remote",
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local(Arc::new(LocalBundleConfig::default()))
    }
}
