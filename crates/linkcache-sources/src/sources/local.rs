use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::default_catalog_name;

/// Configuration for loading content from a bundle directory on disk.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocalBundleConfig {
    /// Path to the bundle directory.
    #[serde(default)]
    pub path: PathBuf,

    /// Name of the catalog file inside the bundle directory.
    #[serde(default = "default_catalog_name")]
    pub index_name: String,
}

impl LocalBundleConfig {
    /// Creates a config for the bundle at `path` with the default index name.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index_name: default_catalog_name(),
        }
    }

    /// Returns the path of the catalog file.
    pub fn index_path(&self) -> PathBuf {
        self.path.join(&self.index_name)
    }

    /// Returns the path of a file listed in the catalog.
    ///
    /// Catalog paths are always relative to the bundle, leading slashes are ignored.
    pub fn content_path(&self, relative: &str) -> PathBuf {
        self.path.join(Path::new(relative.trim_start_matches('/')))
    }
}

impl Default for LocalBundleConfig {
    fn default() -> Self {
        Self::new(".")
    }
}
