use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};

use crate::plan::CompiledPlan;

use super::ViewExecutionCacheKey;

type InMemoryCache = moka::future::Cache<ViewExecutionCacheKey, Arc<CompiledPlan>>;

/// The fast, in-process tier of the view execution cache.
///
/// Entries are weighed by the size of their plan and evicted once the configured capacity is
/// exceeded, or once they were not accessed for `time_to_idle`. A lookup after an eviction is
/// just a miss.
///
/// All writes to a key are serialized with each other. A plan fetched from elsewhere is only
/// published if the cache was not cleared while the fetch was running.
#[derive(Clone)]
pub struct FrontCache {
    cache: InMemoryCache,
    /// Bumped by every [`clear`](Self::clear).
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for FrontCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontCache")
            .field("in-memory items", &self.cache.entry_count())
            .field("weighted size", &self.cache.weighted_size())
            .finish()
    }
}

impl FrontCache {
    /// Creates a cache holding plans with a total [weight](CompiledPlan::weight) of up to
    /// `capacity`.
    pub fn new(capacity: u64, time_to_idle: Option<Duration>) -> Self {
        let mut builder = InMemoryCache::builder()
            .name("view-execution-plans")
            .max_capacity(capacity)
            .weigher(|_k, plan: &Arc<CompiledPlan>| plan.weight());
        if let Some(time_to_idle) = time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }
        Self {
            cache: builder.build(),
            generation: Default::default(),
        }
    }

    pub async fn get(&self, key: &ViewExecutionCacheKey) -> Option<Arc<CompiledPlan>> {
        self.cache.get(key).await
    }

    /// Looks up `key`, falling back to `fetch` on a miss.
    ///
    /// A plan returned by `fetch` is inserted, unless the cache is cleared before the insert
    /// lands, in which case the plan is dropped and this returns `None`. `fetch` holds the write
    /// lock of `key`: concurrent lookups wait for it and then read its result, and a concurrent
    /// [`put`](Self::put) is applied after it.
    pub async fn get_or_fetch<F>(
        &self,
        key: &ViewExecutionCacheKey,
        fetch: F,
    ) -> Option<Arc<CompiledPlan>>
    where
        F: Future<Output = Option<Arc<CompiledPlan>>>,
    {
        let generation = self.generation.load(Ordering::SeqCst);
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| async move {
                if entry.is_some() {
                    return Op::Nop;
                }
                match fetch.await {
                    Some(plan) if self.generation.load(Ordering::SeqCst) == generation => {
                        Op::Put(plan)
                    }
                    _ => Op::Nop,
                }
            })
            .await;

        let plan = match result {
            CompResult::Unchanged(entry) => return Some(entry.into_value()),
            CompResult::Inserted(entry) => entry.into_value(),
            _ => return None,
        };

        // a clear may have run between the check above and the insert
        if self.generation.load(Ordering::SeqCst) != generation {
            self.remove_instance(key, &plan).await;
            return None;
        }
        Some(plan)
    }

    /// Stores `plan` under `key`.
    ///
    /// Storing the very plan instance that is already cached is a no-op, in which case this
    /// returns `false`.
    pub async fn put(&self, key: &ViewExecutionCacheKey, plan: Arc<CompiledPlan>) -> bool {
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| async move {
                match entry {
                    Some(existing) if Arc::ptr_eq(existing.value(), &plan) => Op::Nop,
                    _ => Op::Put(plan),
                }
            })
            .await;
        !matches!(result, CompResult::Unchanged(_))
    }

    /// Whether `plan` is the very instance cached under `key`.
    pub async fn holds(&self, key: &ViewExecutionCacheKey, plan: &Arc<CompiledPlan>) -> bool {
        self.cache
            .get(key)
            .await
            .is_some_and(|existing| Arc::ptr_eq(&existing, plan))
    }

    /// Removes all plans, including ones fetched by lookups that are still running.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate_all();
    }

    async fn remove_instance(&self, key: &ViewExecutionCacheKey, plan: &Arc<CompiledPlan>) {
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|entry| async move {
                match entry {
                    Some(existing) if Arc::ptr_eq(existing.value(), plan) => Op::Remove,
                    _ => Op::Nop,
                }
            })
            .await;
    }

    /// Performs pending evictions right away.
    ///
    /// Mostly useful to make the reported entry count exact.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test;

    #[tokio::test]
    async fn test_put_get_clear() {
        let cache = FrontCache::new(1024, None);
        let a = test::key("view-1", &["provider-x"]);
        let b = test::key("view-1", &["provider-y"]);
        let plan = Arc::new(test::plan("view-1"));

        cache.put(&a, plan.clone()).await;
        assert!(cache.get(&b).await.is_none());
        let cached = cache.get(&a).await.unwrap();
        assert!(Arc::ptr_eq(&cached, &plan));

        cache.clear();
        assert!(cache.get(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_different_instance() {
        let cache = FrontCache::new(1024, None);
        let key = test::key("view-1", &["provider-x"]);
        let first = Arc::new(test::plan("view-1"));
        let second = Arc::new(test::plan("view-1"));

        assert!(cache.put(&key, first.clone()).await);
        assert!(!cache.put(&key, first.clone()).await);
        assert!(Arc::ptr_eq(&cache.get(&key).await.unwrap(), &first));

        assert!(cache.put(&key, second.clone()).await);
        assert!(Arc::ptr_eq(&cache.get(&key).await.unwrap(), &second));
    }

    #[tokio::test]
    async fn test_fetch_only_inserts_found_plans() {
        let cache = FrontCache::new(1024, None);
        let key = test::key("view-1", &["provider-x"]);
        let fetches = AtomicUsize::new(0);

        let missing = cache
            .get_or_fetch(&key, async {
                fetches.fetch_add(1, Ordering::Relaxed);
                None
            })
            .await;
        assert!(missing.is_none());
        assert!(cache.get(&key).await.is_none());

        let plan = Arc::new(test::plan("view-1"));
        let fetched = cache
            .get_or_fetch(&key, async {
                fetches.fetch_add(1, Ordering::Relaxed);
                Some(plan.clone())
            })
            .await;
        assert!(Arc::ptr_eq(&fetched.unwrap(), &plan));

        // served from memory now
        let cached = cache
            .get_or_fetch(&key, async {
                fetches.fetch_add(1, Ordering::Relaxed);
                None
            })
            .await;
        assert!(cached.is_some());
        assert_eq!(fetches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_clear_discards_running_fetch() {
        let cache = FrontCache::new(1024, None);
        let key = test::key("view-1", &["provider-x"]);
        let plan = Arc::new(test::plan("view-1"));

        let fetched = cache
            .get_or_fetch(&key, async {
                cache.clear();
                Some(plan.clone())
            })
            .await;
        assert!(fetched.is_none());
        assert!(cache.get(&key).await.is_none());

        // the next fetch is published again
        let fetched = cache.get_or_fetch(&key, async { Some(plan.clone()) }).await;
        assert!(Arc::ptr_eq(&fetched.unwrap(), &plan));
        assert!(cache.holds(&key, &plan).await);
    }

    #[tokio::test]
    async fn test_put_waits_for_running_fetch() {
        let cache = FrontCache::new(1024, None);
        let key = test::key("view-1", &["provider-x"]);
        let stale = Arc::new(test::plan("view-1"));
        let fresh = Arc::new(test::plan("view-1").with_function_init_id(2));

        let fetch = cache.get_or_fetch(&key, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some(stale.clone())
        });
        let put = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.put(&key, fresh.clone()).await
        };
        let (fetched, replaced) = tokio::join!(fetch, put);

        assert!(Arc::ptr_eq(&fetched.unwrap(), &stale));
        assert!(replaced);
        assert!(cache.holds(&key, &fresh).await);
    }

    #[tokio::test]
    async fn test_capacity_evicts() {
        // each fixture plan weighs 8, so only a single one fits
        let cache = FrontCache::new(10, None);
        for i in 0..20 {
            let hint = format!("provider-{i}");
            let key = test::key("view-1", &[hint.as_str()]);
            cache.put(&key, Arc::new(test::plan("view-1"))).await;
        }
        cache.run_pending_tasks().await;
        assert!(cache.entry_count() <= 1);
    }
}
