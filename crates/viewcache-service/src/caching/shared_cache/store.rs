use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::config::SharedCacheConfig;
use crate::caching::CacheError;

/// A byte oriented key/value store backing the shared cache.
///
/// Keys are relative, `/`-separated paths. Any persistent or distributed store that can map
/// those to bytes can back the cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Fetches the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// A failed put must leave the previous value untouched.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError>;

    /// Removes every stored value.
    async fn remove_all(&self) -> Result<(), CacheError>;
}

/// Creates the store configured for the shared cache.
pub fn store_from_config(config: &SharedCacheConfig) -> Arc<dyn KeyValueStore> {
    match config {
        SharedCacheConfig::Memory => Arc::new(InMemoryStore::default()),
        SharedCacheConfig::Filesystem(cfg) => Arc::new(FilesystemStore::new(cfg.path.clone())),
    }
}

/// A [`KeyValueStore`] in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Bytes>,
}

impl InMemoryStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove_all(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}

/// A [`KeyValueStore`] keeping one file per key below a directory.
///
/// Values are written to a temporary file first, which is then atomically moved into place.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    path: PathBuf,
}

impl FilesystemStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_dir(&self) -> PathBuf {
        self.path.join(".tmp")
    }
}

#[async_trait]
impl KeyValueStore for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let abspath = self.path.join(key);
        tracing::trace!("Fetching plan from {}", abspath.display());
        match fs::read(&abspath).await {
            Ok(contents) => Ok(Some(contents.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::Store(
                Error::new(err).context("Failed to read file from shared cache"),
            )),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        let abspath = self.path.join(key);
        let parent_dir = abspath
            .parent()
            .ok_or_else(|| Error::msg("Shared cache directory not found"))
            .map_err(CacheError::Store)?;
        fs::create_dir_all(parent_dir)
            .await
            .context("Failed to create parent directories")
            .map_err(CacheError::Store)?;

        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir)
            .await
            .context("Failed to create tempdir")
            .map_err(CacheError::Store)?;
        let temp_file = NamedTempFile::new_in(&temp_dir)
            .context("Failed to create tempfile")
            .map_err(CacheError::Store)?;
        let dup_file = temp_file
            .reopen()
            .context("Failed to dup filedescriptor")
            .map_err(CacheError::Store)?;

        let mut dest = File::from_std(dup_file);
        dest.write_all(&value)
            .await
            .context("Failed to write data into file")
            .map_err(CacheError::Store)?;
        dest.flush().await?;

        temp_file
            .persist(&abspath)
            .context("Failed to save file in shared cache")
            .map_err(CacheError::Store)?;
        Ok(())
    }

    async fn remove_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::Store(
                Error::new(err).context("Failed to clear shared cache directory"),
            )),
        }
    }
}
