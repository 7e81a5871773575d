use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemSharedCacheConfig {
    /// The directory holding one file per cached plan.
    pub path: PathBuf,
}

/// The store backing the shared cache.
///
/// ```yaml
/// shared_cache:
///   backend: filesystem
///   path: /var/lib/viewcache
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SharedCacheConfig {
    /// A process-local map, which is only shared between caches of the same process.
    Memory,
    Filesystem(FilesystemSharedCacheConfig),
}
