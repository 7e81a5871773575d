//! Compiling views at most once.
//!
//! The [`CompilationCoordinator`] wraps the only correct way of using the plan caches: acquire the
//! key's lock, look the plan up, compile and store it on a miss, and release the lock.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::caching::{Caches, KeyLockRegistry, ViewExecutionCache, ViewExecutionCacheKey};
use crate::plan::CompiledPlan;
use crate::types::VersionCorrection;

/// A request to compile a view for one valuation time.
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    pub key: ViewExecutionCacheKey,
    /// The valuation time the plan is going to be executed for.
    pub valuation_time: DateTime<Utc>,
    /// The resolution time identifiers are resolved at.
    pub version_correction: VersionCorrection,
    /// The current generation of the function repository.
    pub function_init_id: u64,
}

/// Compiles views into plans.
pub trait PlanCompiler: Send + Sync {
    /// Compiles the plan for `request`.
    ///
    /// The returned plan should be stamped with the request's function init id and the window of
    /// valuation times it is valid for.
    fn compile<'a>(
        &'a self,
        request: &'a CompilationRequest,
    ) -> BoxFuture<'a, anyhow::Result<CompiledPlan>>;
}

/// Coordinates concurrent compilations through the plan cache.
#[derive(Debug, Clone)]
pub struct CompilationCoordinator {
    cache: Arc<dyn ViewExecutionCache>,
    locks: KeyLockRegistry,
}

impl CompilationCoordinator {
    pub fn new(caches: Caches) -> Self {
        Self {
            cache: caches.plans,
            locks: caches.locks,
        }
    }

    pub fn cache(&self) -> &Arc<dyn ViewExecutionCache> {
        &self.cache
    }

    pub fn locks(&self) -> &KeyLockRegistry {
        &self.locks
    }

    /// Returns a plan for `request`, compiling it only if no usable plan is cached.
    ///
    /// The key's broad lock is held throughout, so concurrent requests for the same key compile
    /// at most once, and all others observe the cached plan. The returned plan is a private copy
    /// the caller may annotate.
    #[tracing::instrument(skip_all, fields(key = %request.key))]
    pub async fn get_or_compile<C>(
        &self,
        request: &CompilationRequest,
        compiler: &C,
    ) -> anyhow::Result<CompiledPlan>
    where
        C: PlanCompiler + ?Sized,
    {
        let _guard = self.locks.broad_lock(&request.key).lock().await;

        if let Some(plan) = self.lookup(request).await {
            return Ok(plan.deep_clone());
        }

        let plan = self.compile(request, compiler).await?;
        self.cache.put(&request.key, plan.clone()).await;
        Ok(plan.deep_clone())
    }

    /// Returns a plan for `request`, serializing compilations per temporal instance only.
    ///
    /// Only the fine lock of the request's resolution and valuation time is held while
    /// compiling. The broad lock is taken just around the cache accesses, so different temporal
    /// instances of the same key can compile concurrently.
    #[tracing::instrument(skip_all, fields(key = %request.key, valuation_time = %request.valuation_time))]
    pub async fn get_or_compile_at<C>(
        &self,
        request: &CompilationRequest,
        compiler: &C,
    ) -> anyhow::Result<CompiledPlan>
    where
        C: PlanCompiler + ?Sized,
    {
        let (broad, fine) = self.locks.locks(
            &request.key,
            request.valuation_time,
            request.version_correction,
        );
        let _fine_guard = fine.lock().await;

        {
            let _broad_guard = broad.lock().await;
            if let Some(plan) = self.lookup(request).await {
                return Ok(plan.deep_clone());
            }
        }

        let plan = self.compile(request, compiler).await?;

        let _broad_guard = broad.lock().await;
        self.cache.put(&request.key, plan.clone()).await;
        Ok(plan.deep_clone())
    }

    /// Looks up a cached plan that is usable for `request`.
    async fn lookup(&self, request: &CompilationRequest) -> Option<Arc<CompiledPlan>> {
        let plan = self.cache.get(&request.key).await?;

        if plan.function_init_id() != request.function_init_id {
            tracing::debug!(
                cached = plan.function_init_id(),
                current = request.function_init_id,
                "Cached plan was compiled against outdated functions"
            );
            return None;
        }
        if !plan.is_valid_for(request.valuation_time) {
            tracing::debug!(
                valid_from = ?plan.valid_from(),
                valid_to = ?plan.valid_to(),
                "Cached plan is not valid for the valuation time"
            );
            return None;
        }

        tracing::debug!(compilation_id = plan.compilation_id(), "Reusing cached plan");
        Some(plan)
    }

    async fn compile<C>(
        &self,
        request: &CompilationRequest,
        compiler: &C,
    ) -> anyhow::Result<Arc<CompiledPlan>>
    where
        C: PlanCompiler + ?Sized,
    {
        metric!(counter("caches.computation") += 1);
        let start = Instant::now();

        let plan = compiler.compile(request).await;

        metric!(
            timer("caches.computation.duration") = start.elapsed(),
            "status" => if plan.is_ok() { "ok" } else { "error" },
        );
        let plan = plan?;
        tracing::debug!(
            compilation_id = plan.compilation_id(),
            nodes = plan.node_count(),
            elapsed = ?start.elapsed(),
            "Compiled plan"
        );
        Ok(Arc::new(plan))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;
    use tokio::sync::Barrier;

    use super::*;
    use crate::caching::{FrontCache, NullCache, TieredCache};
    use crate::test;

    struct TestCompiler {
        compilations: AtomicUsize,
        delay: Duration,
        /// When set, plans are only valid for an hour starting at their valuation time.
        narrow_validity: bool,
        barrier: Option<Barrier>,
        fail: bool,
    }

    impl TestCompiler {
        fn new(delay: Duration) -> Self {
            Self {
                compilations: AtomicUsize::new(0),
                delay,
                narrow_validity: false,
                barrier: None,
                fail: false,
            }
        }

        fn count(&self) -> usize {
            self.compilations.load(Ordering::SeqCst)
        }
    }

    impl PlanCompiler for TestCompiler {
        fn compile<'a>(
            &'a self,
            request: &'a CompilationRequest,
        ) -> BoxFuture<'a, anyhow::Result<CompiledPlan>> {
            Box::pin(async move {
                self.compilations.fetch_add(1, Ordering::SeqCst);
                if let Some(ref barrier) = self.barrier {
                    barrier.wait().await;
                }
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    anyhow::bail!("compilation failed");
                }

                let mut plan =
                    test::plan("view-1").with_function_init_id(request.function_init_id);
                if self.narrow_validity {
                    let from = request.valuation_time;
                    plan = plan.with_validity(Some(from), Some(from + chrono::Duration::hours(1)));
                }
                Ok(plan)
            })
        }
    }

    fn coordinator() -> CompilationCoordinator {
        let front = FrontCache::new(1024, None);
        CompilationCoordinator::new(Caches {
            plans: Arc::new(TieredCache::new(front, None)),
            locks: KeyLockRegistry::new(),
        })
    }

    fn valuation_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2013, 2, 1, 12, 0, 0).unwrap()
    }

    fn request(function_init_id: u64) -> CompilationRequest {
        CompilationRequest {
            key: test::key("view-1", &["provider-x"]),
            valuation_time: valuation_time(),
            version_correction: VersionCorrection::LATEST,
            function_init_id,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_compile_once() {
        test::setup();
        let coordinator = coordinator();
        let compiler = Arc::new(TestCompiler::new(Duration::from_millis(50)));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                let compiler = compiler.clone();
                tokio::spawn(async move {
                    coordinator
                        .get_or_compile(&request(1), compiler.as_ref())
                        .await
                })
            })
            .collect();

        let mut plans = Vec::new();
        for task in tasks {
            plans.push(task.await.unwrap().unwrap());
        }

        assert_eq!(compiler.count(), 1);
        let expected = test::plan("view-1");
        assert!(plans.iter().all(|plan| *plan == expected));

        // everybody got a private copy
        let first = &plans[0].graphs()[0].nodes()[0];
        let second = &plans[1].graphs()[0].nodes()[0];
        assert!(!Arc::ptr_eq(first, second));
        let cached = coordinator.cache().get(&request(1).key).await.unwrap();
        assert!(!Arc::ptr_eq(first, &cached.graphs()[0].nodes()[0]));

        assert!(coordinator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_outdated_functions_recompile() {
        let coordinator = coordinator();
        let compiler = TestCompiler::new(Duration::ZERO);

        coordinator.get_or_compile(&request(1), &compiler).await.unwrap();
        coordinator.get_or_compile(&request(1), &compiler).await.unwrap();
        assert_eq!(compiler.count(), 1);

        let plan = coordinator.get_or_compile(&request(2), &compiler).await.unwrap();
        assert_eq!(plan.function_init_id(), 2);
        assert_eq!(compiler.count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_plans_recompile() {
        let coordinator = coordinator();
        let mut compiler = TestCompiler::new(Duration::ZERO);
        compiler.narrow_validity = true;

        let mut req = request(1);
        coordinator.get_or_compile(&req, &compiler).await.unwrap();

        req.valuation_time += chrono::Duration::minutes(30);
        coordinator.get_or_compile(&req, &compiler).await.unwrap();
        assert_eq!(compiler.count(), 1);

        req.valuation_time += chrono::Duration::hours(1);
        coordinator.get_or_compile(&req, &compiler).await.unwrap();
        assert_eq!(compiler.count(), 2);
    }

    #[tokio::test]
    async fn test_failed_compilation_is_not_cached() {
        let coordinator = coordinator();
        let mut compiler = TestCompiler::new(Duration::ZERO);
        compiler.fail = true;

        let err = coordinator
            .get_or_compile(&request(1), &compiler)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "compilation failed");
        assert!(coordinator.cache().get(&request(1).key).await.is_none());
        // the lock was released on the error path
        assert!(coordinator.locks().is_empty());

        compiler.fail = false;
        coordinator.get_or_compile(&request(1), &compiler).await.unwrap();
        assert_eq!(compiler.count(), 2);
    }

    #[tokio::test]
    async fn test_null_cache_always_compiles() {
        let coordinator = CompilationCoordinator::new(Caches {
            plans: Arc::new(NullCache),
            locks: KeyLockRegistry::new(),
        });
        let compiler = TestCompiler::new(Duration::ZERO);

        coordinator.get_or_compile(&request(1), &compiler).await.unwrap();
        coordinator.get_or_compile(&request(1), &compiler).await.unwrap();
        assert_eq!(compiler.count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_instances_compile_concurrently() {
        test::setup();
        let coordinator = coordinator();
        let mut compiler = TestCompiler::new(Duration::ZERO);
        compiler.narrow_validity = true;
        // both compilations have to be in flight at the same time to get past this
        compiler.barrier = Some(Barrier::new(2));
        let compiler = Arc::new(compiler);

        let tasks: Vec<_> = [0, 1]
            .into_iter()
            .map(|day| {
                let coordinator = coordinator.clone();
                let compiler = compiler.clone();
                let mut req = request(1);
                req.valuation_time += chrono::Duration::days(day);
                tokio::spawn(async move {
                    coordinator
                        .get_or_compile_at(&req, compiler.as_ref())
                        .await
                })
            })
            .collect();

        let all = futures::future::join_all(tasks);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("compilations of distinct instances must not block each other");
        for result in results {
            result.unwrap().unwrap();
        }
        assert_eq!(compiler.count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_instance_compiles_once() {
        test::setup();
        let coordinator = coordinator();
        let compiler = Arc::new(TestCompiler::new(Duration::from_millis(50)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let compiler = compiler.clone();
                tokio::spawn(async move {
                    coordinator
                        .get_or_compile_at(&request(1), compiler.as_ref())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(compiler.count(), 1);
        assert!(coordinator.locks().is_empty());
    }
}
