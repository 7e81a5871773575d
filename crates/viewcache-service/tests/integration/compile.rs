use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use viewcache_service::caching::Caches;
use viewcache_service::compile::{CompilationCoordinator, CompilationRequest, PlanCompiler};
use viewcache_service::config::Config;
use viewcache_service::plan::CompiledPlan;
use viewcache_service::types::VersionCorrection;
use viewcache_test::setup;

use crate::utils;

#[derive(Default)]
struct SlowCompiler {
    compilations: AtomicUsize,
}

impl PlanCompiler for SlowCompiler {
    fn compile<'a>(
        &'a self,
        request: &'a CompilationRequest,
    ) -> BoxFuture<'a, anyhow::Result<CompiledPlan>> {
        Box::pin(async move {
            self.compilations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(utils::plan("view-1", request.function_init_id))
        })
    }
}

fn request() -> CompilationRequest {
    CompilationRequest {
        key: utils::key("view-1", &["provider-x"]),
        valuation_time: Utc.with_ymd_and_hms(2013, 2, 1, 12, 0, 0).unwrap(),
        version_correction: VersionCorrection::LATEST,
        function_init_id: 1,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_compilation() {
    setup();
    let config = Config::from_reader("shared_cache:\n  backend: memory\n".as_bytes()).unwrap();
    let caches = Caches::from_config(&config, utils::resolver(&["view-1"]));
    let coordinator = CompilationCoordinator::new(caches);
    let compiler = Arc::new(SlowCompiler::default());

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let coordinator = coordinator.clone();
            let compiler = compiler.clone();
            tokio::spawn(async move {
                coordinator
                    .get_or_compile(&request(), compiler.as_ref())
                    .await
            })
        })
        .collect();

    let mut plans = Vec::new();
    for task in tasks {
        plans.push(task.await.unwrap().unwrap());
    }
    assert_eq!(compiler.compilations.load(Ordering::SeqCst), 1);

    // every caller may annotate their copy without affecting anybody else
    let total = |plan: &CompiledPlan| plan.graph("Default").unwrap().nodes().last().cloned();
    total(&plans[0]).unwrap().annotate("result", "42");
    assert_eq!(
        total(&plans[0]).unwrap().annotation("result").as_deref(),
        Some("42")
    );
    for plan in &plans[1..] {
        assert_eq!(total(plan).unwrap().annotation("result"), None);
    }
    let cached = coordinator.cache().get(&request().key).await.unwrap();
    assert_eq!(total(&cached).unwrap().annotation("result"), None);
}
