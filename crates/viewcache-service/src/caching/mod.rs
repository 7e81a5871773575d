//! # View execution caching
//!
//! Compiling a view into an executable plan is expensive: the dependency graph has to be built,
//! every referenced target resolved and every function compiled. The caches in this module let
//! equivalent compilation requests reuse a previously compiled [`CompiledPlan`].
//!
//! ## Cache Layers
//!
//! - The [`FrontCache`] keeps plans in memory, weighted by their size. It also deduplicates
//!   concurrent reads of the shared layer.
//! - The [`SharedCache`] serializes plans into an external [`KeyValueStore`], which can be shared
//!   between cache instances. Plans read from it are rehydrated through the live
//!   [`TargetResolver`](crate::resolver::TargetResolver) and promoted into the front cache.
//!
//! A lookup goes through the front cache first and falls back to the shared cache, if one is
//! configured. Anything going wrong in the shared cache is logged and treated as a miss. A cache
//! is always allowed to forget.
//!
//! ## Keys and locks
//!
//! Plans are keyed by a [`ViewExecutionCacheKey`]: the view plus the ordered list of market data
//! provider hints it was compiled against.
//!
//! The caches do not serialize concurrent access to the same key. To make sure a plan is
//! compiled at most once, callers acquire the key's lock from the [`KeyLockRegistry`] around
//! their `get`, compile and `put`. The
//! [`CompilationCoordinator`](crate::compile::CompilationCoordinator) does exactly that.
//!
//! Cached plans are shared. Whoever intends to annotate a plan retrieved from a cache needs to
//! [deep clone](CompiledPlan::deep_clone) it first.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.shared.fetch(hit:true)`: Accesses served by the shared layer.
//! - `caches.shared.store(status)`: Writes to the shared layer.
//! - `caches.stale`: Shared entries that could not be rehydrated anymore.
//! - `caches.computation`: Actual compilations, not served by any of the layers.
//!
//! ### Configuration
//!
//! Caching can be disabled altogether with `caches.enabled`, in which case a [`NullCache`] is
//! used. `caches.in_memory` configures the capacity and time-to-idle of the front cache. The
//! [`SharedCacheConfig`] is optional, and no shared cache is used when it is absent.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::plan::CompiledPlan;
use crate::resolver::TargetResolver;

mod cache_error;
mod cache_key;
mod locks;
mod memory;
pub mod shared_cache;
mod tiered;

pub use cache_error::{CacheError, CacheResult};
pub use cache_key::ViewExecutionCacheKey;
pub use locks::{KeyLock, KeyLockGuard, KeyLockRegistry};
pub use memory::FrontCache;
pub use shared_cache::{KeyValueStore, SharedCache, SharedCacheConfig};
pub use tiered::{NullCache, TieredCache};

/// A cache of compiled plans.
///
/// Implementations are safe to use concurrently, but do not serialize accesses to the same key.
/// Combine with a [`KeyLockRegistry`] to compile a plan at most once.
#[async_trait]
pub trait ViewExecutionCache: Send + Sync + fmt::Debug {
    /// Looks up the plan cached under `key`.
    ///
    /// A miss is `None` and never an error.
    async fn get(&self, key: &ViewExecutionCacheKey) -> Option<Arc<CompiledPlan>>;

    /// Caches `plan` under `key`, replacing whatever was cached before.
    async fn put(&self, key: &ViewExecutionCacheKey, plan: Arc<CompiledPlan>);

    /// Forgets all cached plans.
    async fn clear(&self);
}

/// The caches and locks used to coordinate compilations.
#[derive(Debug, Clone)]
pub struct Caches {
    pub plans: Arc<dyn ViewExecutionCache>,
    pub locks: KeyLockRegistry,
}

impl Caches {
    /// Creates the caches as configured.
    ///
    /// `resolver` is used to rehydrate plans read from the shared cache.
    pub fn from_config(config: &Config, resolver: Arc<dyn TargetResolver>) -> Self {
        let plans: Arc<dyn ViewExecutionCache> = if config.caches.enabled {
            let in_memory = &config.caches.in_memory;
            let front = FrontCache::new(in_memory.plan_capacity, in_memory.time_to_idle);
            let shared = config.shared_cache.as_ref().map(|cfg| {
                tracing::info!(?cfg, "Using shared plan cache");
                SharedCache::new(shared_cache::store_from_config(cfg), resolver)
            });
            Arc::new(TieredCache::new(front, shared))
        } else {
            tracing::info!("Plan caching is disabled");
            Arc::new(NullCache)
        };

        Self {
            plans,
            locks: KeyLockRegistry::new(),
        }
    }
}
