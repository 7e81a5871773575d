use std::sync::Arc;

use async_trait::async_trait;

use crate::plan::CompiledPlan;

use super::{FrontCache, SharedCache, ViewExecutionCache, ViewExecutionCacheKey};

/// The view execution cache: a [`FrontCache`], optionally backed by a [`SharedCache`].
///
/// Lookups that miss the front tier go to the shared tier, and plans found there are promoted
/// into the front tier. Writes go to both tiers, the shared one first, so a promotion racing a
/// write can not leave an older plan in the front tier once the write is done.
#[derive(Debug, Clone)]
pub struct TieredCache {
    front: FrontCache,
    shared: Option<SharedCache>,
}

impl TieredCache {
    pub fn new(front: FrontCache, shared: Option<SharedCache>) -> Self {
        Self { front, shared }
    }

    pub fn front(&self) -> &FrontCache {
        &self.front
    }
}

#[async_trait]
impl ViewExecutionCache for TieredCache {
    async fn get(&self, key: &ViewExecutionCacheKey) -> Option<Arc<CompiledPlan>> {
        metric!(counter("caches.access") += 1);

        if let Some(plan) = self.front.get(key).await {
            metric!(counter("caches.memory.hit") += 1);
            tracing::debug!(%key, "Plan cache hit");
            return Some(plan);
        }

        let plan = match self.shared {
            Some(ref shared) => self.front.get_or_fetch(key, shared.get(key)).await,
            None => None,
        };
        if plan.is_none() {
            tracing::debug!(%key, "Plan cache miss");
        }
        plan
    }

    async fn put(&self, key: &ViewExecutionCacheKey, plan: Arc<CompiledPlan>) {
        if self.front.holds(key, &plan).await {
            tracing::trace!(%key, "Plan is already cached");
            return;
        }
        tracing::info!(
            %key,
            compilation_id = plan.compilation_id(),
            nodes = plan.node_count(),
            "Caching compiled plan"
        );

        if let Some(ref shared) = self.shared {
            shared.put(key, &plan).await;
        }
        self.front.put(key, plan).await;
    }

    async fn clear(&self) {
        tracing::info!("Clearing plan cache");
        self.front.clear();
        if let Some(ref shared) = self.shared {
            shared.clear().await;
            // drops plans promoted from the store before it was wiped
            self.front.clear();
        }
    }
}

/// A [`ViewExecutionCache`] that never caches anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl ViewExecutionCache for NullCache {
    async fn get(&self, _key: &ViewExecutionCacheKey) -> Option<Arc<CompiledPlan>> {
        None
    }

    async fn put(&self, _key: &ViewExecutionCacheKey, _plan: Arc<CompiledPlan>) {}

    async fn clear(&self) {}
}
