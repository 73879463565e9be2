use std::time::Duration;

use linkcache_sources::Address;
use thiserror::Error;

/// An error that happens when resolving content.
///
/// Errors are cloned to every waiter of a shared load, so they carry owned strings only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The address or group is not known to the backend.
    #[error("not found: {0}")]
    NotFound(String),
    /// The link does not point at anything.
    #[error("link has no address")]
    NoValue,
    /// Content was accessed synchronously before it was loaded.
    ///
    /// This is only ever logged, synchronous accessors return `None` instead.
    #[error("`{0}` was accessed before it was loaded")]
    NotLoadedYet(Address),
    /// The template at `address` has no component named `component`.
    #[error("template `{address}` has no component `{component}`")]
    MissingSubComponent {
        address: Address,
        component: &'static str,
    },
    /// The content at `address` is not what the link expects.
    #[error("`{address}` is a {found}, expected {expected}")]
    TypeMismatch {
        address: Address,
        expected: String,
        found: String,
    },
    /// A singleton operation was used on a type that has no singleton address.
    #[error("`{0}` is not a singleton")]
    NoSingletonConvention(&'static str),
    /// The backend does not implement the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The content could not be fetched from the remote due to missing
    /// permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The content could not be fetched from the remote due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The content could not be fetched from the remote due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the remote's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The content was fetched successfully, but is invalid in some way.
    ///
    /// For example, it could not be decoded, or its hash does not match the catalog.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            tracing::debug!(error = &err as &dyn std::error::Error, "request timed out");
        }
        Self::DownloadError(err.to_string())
    }
}

impl CacheError {
    /// Logs `e` and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NoValue => "no_value",
            Self::NotLoadedYet(_) => "not_loaded",
            Self::MissingSubComponent { .. } => "missing_component",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::NoSingletonConvention(_) => "no_singleton",
            Self::Unsupported(_) => "unsupported",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "download_error",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal",
        }
    }
}

/// The result of resolving content, containing either `Ok(T)` or the reason why the
/// content could not be loaded or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
