//! The second tier of the view execution cache, shared through an external key/value store.
//!
//! Plans are written as serialized [envelopes](envelope) and need to be rehydrated when read
//! back: the views and portfolios they reference are resolved again through the live
//! [`TargetResolver`] of the cache instance that wrote them. Every [`SharedCache`] registers
//! itself under a random instance id for this, which is embedded in every envelope it writes.
//! Once that instance is gone, its envelopes can not be read anymore and count as misses.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock, Weak};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use sentry::Hub;
use sentry::protocol::Context;
use uuid::Uuid;

use crate::plan::CompiledPlan;
use crate::resolver::TargetResolver;

use super::{CacheError, ViewExecutionCacheKey};

pub mod config;
mod envelope;
pub mod store;

pub use config::{FilesystemSharedCacheConfig, SharedCacheConfig};
pub use envelope::PlanEnvelope;
pub use store::{FilesystemStore, InMemoryStore, KeyValueStore, store_from_config};

/// The version of the store layout, part of every store key.
///
/// Bump this to make all existing entries invisible.
pub const PLAN_STORE_VERSION: u32 = 1;

/// The live shared cache instances of this process, by instance id.
static INSTANCES: LazyLock<RwLock<FxHashMap<Uuid, Weak<SharedCacheInner>>>> =
    LazyLock::new(Default::default);

struct SharedCacheInner {
    id: Uuid,
    store: Arc<dyn KeyValueStore>,
    resolver: Arc<dyn TargetResolver>,
}

impl Drop for SharedCacheInner {
    fn drop(&mut self) {
        INSTANCES.write().unwrap().remove(&self.id);
    }
}

/// Finds the live cache instance that wrote an envelope.
fn lookup_instance(id: &Uuid) -> Result<Arc<SharedCacheInner>, CacheError> {
    INSTANCES
        .read()
        .unwrap()
        .get(id)
        .and_then(Weak::upgrade)
        .ok_or(CacheError::StaleCacheReference)
}

/// A view execution cache tier backed by a [`KeyValueStore`].
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<SharedCacheInner>,
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("id", &self.inner.id)
            .field("store", &self.inner.store)
            .finish()
    }
}

impl SharedCache {
    /// Creates a shared cache over `store` and registers it for rehydration.
    pub fn new(store: Arc<dyn KeyValueStore>, resolver: Arc<dyn TargetResolver>) -> Self {
        let inner = Arc::new(SharedCacheInner {
            id: Uuid::new_v4(),
            store,
            resolver,
        });
        INSTANCES
            .write()
            .unwrap()
            .insert(inner.id, Arc::downgrade(&inner));
        tracing::debug!(instance = %inner.id, "Registered shared cache instance");
        Self { inner }
    }

    /// The process-local id embedded in all envelopes written by this cache.
    pub fn instance_id(&self) -> Uuid {
        self.inner.id
    }

    /// Fetches and rehydrates the plan stored under `key`.
    ///
    /// Errors are transparently hidden, a plan is either available or it is not.
    #[tracing::instrument(name = "fetch_shared_cache", skip_all, fields(key = %key))]
    pub async fn get(&self, key: &ViewExecutionCacheKey) -> Option<Arc<CompiledPlan>> {
        let _guard = Hub::current().push_scope();
        let path = key.cache_path(PLAN_STORE_VERSION);
        sentry::configure_scope(|scope| {
            let mut map = BTreeMap::new();
            map.insert("path".to_string(), path.clone().into());
            map.insert("key".to_string(), key.metadata().into());
            scope.set_context("Shared Cache", Context::Other(map));
        });

        let res = match self.inner.store.get(&path).await {
            Ok(Some(bytes)) => rehydrate(&bytes).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };

        match res {
            Ok(Some(plan)) => {
                metric!(counter("caches.shared.fetch") += 1, "hit" => "true", "status" => "ok");
                tracing::debug!("Shared cache hit");
                Some(Arc::new(plan))
            }
            Ok(None) => {
                metric!(counter("caches.shared.fetch") += 1, "hit" => "false", "status" => "ok");
                tracing::debug!("Shared cache miss");
                None
            }
            Err(err) if err.is_stale() => {
                metric!(counter("caches.stale") += 1);
                tracing::debug!(error = %err, "Shared cache entry is stale");
                None
            }
            Err(CacheError::Store(err)) => {
                metric!(counter("caches.shared.fetch") += 1, "status" => "error");
                let stderr: &dyn std::error::Error = err.as_ref();
                tracing::error!(stderr, "Error fetching plan from shared cache");
                None
            }
            Err(err) => {
                metric!(counter("caches.shared.fetch") += 1, "status" => "corrupt");
                tracing::warn!(error = %err, "Discarding corrupt shared cache entry");
                None
            }
        }
    }

    /// Serializes `plan` into the store under `key`.
    ///
    /// Errors are logged and otherwise ignored. A failed store leaves the previous entry for
    /// `key` untouched.
    pub async fn put(&self, key: &ViewExecutionCacheKey, plan: &CompiledPlan) {
        let path = key.cache_path(PLAN_STORE_VERSION);
        let res = match PlanEnvelope::new(self.inner.id, plan).to_bytes() {
            Ok(bytes) => {
                let size = bytes.len();
                self.inner
                    .store
                    .put(&path, Bytes::from(bytes))
                    .await
                    .map(|_| size)
            }
            Err(err) => Err(err),
        };

        match res {
            Ok(size) => {
                metric!(counter("caches.shared.store") += 1, "status" => "ok");
                metric!(histogram("caches.shared.store.bytes") = size as u64);
                tracing::info!(
                    %key,
                    %path,
                    size,
                    nodes = plan.node_count(),
                    "Stored plan in shared cache"
                );
            }
            Err(err) => {
                metric!(counter("caches.shared.store") += 1, "status" => "error");
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, %key, "Error storing plan in shared cache");
            }
        }
    }

    /// Removes all entries from the store.
    pub async fn clear(&self) {
        if let Err(err) = self.inner.store.remove_all().await {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Error clearing shared cache");
        }
    }
}

/// Turns stored bytes back into a live plan.
fn rehydrate(bytes: &[u8]) -> Result<CompiledPlan, CacheError> {
    let envelope = PlanEnvelope::from_bytes(bytes)?;
    let origin = lookup_instance(&envelope.instance)?;
    let resolver = &origin.resolver;
    let vc = envelope.version_correction;

    let view = resolver
        .resolve_view(&envelope.view_id, &vc)
        .ok_or_else(|| CacheError::UnresolvedReference(envelope.view_id.clone()))?;
    let portfolio = match envelope.portfolio_id {
        Some(ref id) => Some(
            resolver
                .resolve_portfolio(id, &vc)
                .ok_or_else(|| CacheError::UnresolvedReference(id.clone()))?,
        ),
        None => None,
    };

    envelope.into_plan(view, portfolio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn shared_cache(store: &Arc<InMemoryStore>) -> SharedCache {
        SharedCache::new(store.clone(), test::resolver())
    }

    #[tokio::test]
    async fn test_roundtrip() {
        test::setup();
        let store = Arc::new(InMemoryStore::default());
        let cache = shared_cache(&store);
        let key = test::key("view-1", &["provider-x"]);
        let plan = test::plan("view-1");

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, &plan).await;
        assert_eq!(store.len(), 1);

        let restored = cache.get(&key).await.unwrap();
        assert_eq!(*restored, plan);

        cache.clear().await;
        assert!(store.is_empty());
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_other_live_instance_rehydrates() {
        test::setup();
        let store = Arc::new(InMemoryStore::default());
        let writer = shared_cache(&store);
        let reader = shared_cache(&store);
        assert_ne!(writer.instance_id(), reader.instance_id());

        let key = test::key("view-1", &["provider-x"]);
        writer.put(&key, &test::plan("view-1")).await;
        assert!(reader.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_instance_is_a_miss() {
        test::setup();
        let store = Arc::new(InMemoryStore::default());
        let key = test::key("view-1", &["provider-x"]);

        let writer = shared_cache(&store);
        let instance = writer.instance_id();
        writer.put(&key, &test::plan("view-1")).await;
        drop(writer);

        assert!(matches!(
            lookup_instance(&instance),
            Err(CacheError::StaleCacheReference)
        ));
        let bytes = store.get(&key.cache_path(PLAN_STORE_VERSION)).await.unwrap();
        let err = rehydrate(&bytes.unwrap()).unwrap_err();
        assert!(matches!(err, CacheError::StaleCacheReference));

        let reader = shared_cache(&store);
        assert!(reader.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_unresolved_view_is_a_miss() {
        test::setup();
        let store = Arc::new(InMemoryStore::default());
        let resolver = test::resolver();
        let cache = SharedCache::new(store.clone(), resolver.clone());
        let key = test::key("view-1", &["provider-x"]);

        cache.put(&key, &test::plan("view-1")).await;
        resolver.remove_view(&test::view_id("view-1"));

        let bytes = store.get(&key.cache_path(PLAN_STORE_VERSION)).await.unwrap();
        let err = rehydrate(&bytes.unwrap()).unwrap_err();
        assert!(matches!(err, CacheError::UnresolvedReference(_)));
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        test::setup();
        let store = Arc::new(InMemoryStore::default());
        let cache = shared_cache(&store);
        let key = test::key("view-1", &["provider-x"]);

        store
            .put(
                &key.cache_path(PLAN_STORE_VERSION),
                Bytes::from_static(b"VECP\x01\x00not zstd"),
            )
            .await
            .unwrap();
        assert!(cache.get(&key).await.is_none());
    }
}
