use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use super::default_catalog_name;

/// Configuration for a content catalog served over HTTP.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RemoteCatalogConfig {
    /// Absolute base URL of the catalog and its content.
    pub url: Url,

    /// Name of the catalog file, relative to `url`.
    #[serde(default = "default_catalog_name")]
    pub catalog_name: String,

    /// Additional headers to be sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RemoteCatalogConfig {
    /// Creates a config for the catalog served at `url` with no extra headers.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            catalog_name: default_catalog_name(),
            headers: Default::default(),
        }
    }

    /// Returns the URL of the catalog file.
    pub fn catalog_url(&self) -> anyhow::Result<Url> {
        self.join_url(&self.catalog_name)
    }

    /// Joins a catalog path onto the base URL.
    ///
    /// A trailing slash on the base URL is not required. Returns `Err` if the base
    /// URL is cannot-be-a-base.
    pub fn join_url(&self, path: &str) -> anyhow::Result<Url> {
        let mut joined = self.url.clone();
        joined
            .path_segments_mut()
            .map_err(|_| anyhow::Error::msg("URL cannot-be-a-base"))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(joined)
    }
}
