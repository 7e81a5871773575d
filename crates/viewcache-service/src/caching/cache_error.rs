use thiserror::Error;

use crate::types::UniqueId;

/// An error raised by the view execution caches.
///
/// Only [`InvalidArgument`](Self::InvalidArgument) ever reaches callers of the cache facade.
/// Everything else originates in the shared tier and is turned into a cache miss there.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The caller passed something that can never be valid, like a key without provider hints.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A shared cache entry was written by a cache instance that no longer exists.
    #[error("stale cache reference")]
    StaleCacheReference,
    /// A shared cache entry is corrupt or was written with an unknown schema.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
    /// A reference embedded in a shared cache entry does not resolve anymore.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(UniqueId),
    /// The underlying key/value store failed.
    #[error("store error")]
    Store(#[source] anyhow::Error),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailure(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.into())
    }
}

impl CacheError {
    /// Whether this error only means that the cache "forgot" an entry.
    ///
    /// These are expected during normal operation and do not deserve a warning.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::StaleCacheReference | Self::UnresolvedReference(_)
        )
    }
}

/// The result of a fallible cache operation.
pub type CacheResult<T> = Result<T, CacheError>;
