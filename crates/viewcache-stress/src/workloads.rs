use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;

use viewcache_service::caching::ViewExecutionCacheKey;
use viewcache_service::compile::{CompilationCoordinator, CompilationRequest, PlanCompiler};
use viewcache_service::plan::{CompiledPlan, DependencyGraph, NodeSpec, ValueSpecification};
use viewcache_service::resolver::{InMemoryTargetResolver, TargetResolver};
use viewcache_service::types::{
    Portfolio, ProviderHint, TargetReference, TargetType, UniqueId, VersionCorrection,
    ViewDefinition,
};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct views requested round-robin.
    #[serde(default = "default_views")]
    pub views: usize,
    /// The provider hints every view is requested with.
    pub hints: Vec<String>,
    /// How long a single compilation takes.
    #[serde(default, with = "humantime_serde")]
    pub compile_duration: Duration,
    /// The number of positions priced by every graph.
    #[serde(default = "default_graph_size")]
    pub graph_size: usize,
    /// The number of distinct valuation times requested.
    ///
    /// With more than one, compilations only lock the temporal instance they compile for.
    #[serde(default = "default_valuation_times")]
    pub valuation_times: usize,
}

fn default_views() -> usize {
    1
}

fn default_graph_size() -> usize {
    100
}

fn default_valuation_times() -> usize {
    1
}

/// A compiler that takes a fixed time to produce a plan of a fixed size.
#[derive(Debug)]
pub struct SyntheticCompiler {
    resolver: Arc<InMemoryTargetResolver>,
    portfolio: Arc<Portfolio>,
    compile_duration: Duration,
    graph_size: usize,
    compilations: AtomicUsize,
}

impl SyntheticCompiler {
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    fn build(&self, request: &CompilationRequest) -> Result<CompiledPlan> {
        let view = self
            .resolver
            .resolve_view(request.key.view_id(), &request.version_correction)
            .with_context(|| format!("unknown view `{}`", request.key.view_id()))?;

        let id = self.compilations.fetch_add(1, Ordering::Relaxed);
        let mut plan = CompiledPlan::new(
            view.clone(),
            request.version_correction,
            &format!("stress-{id}"),
        )
        .with_portfolio(self.portfolio.clone())
        .with_function_init_id(request.function_init_id);

        for calculation_configuration in &view.calculation_configurations {
            plan = plan.with_graph(pricing_graph(calculation_configuration, self.graph_size)?);
        }
        for i in 0..self.graph_size {
            let position = format!("pos-{i}");
            plan = plan.with_resolved_identifier(
                TargetReference::new(TargetType::Position, &position),
                UniqueId::of("DbPos", &position).with_version("1"),
            );
        }
        Ok(plan)
    }
}

impl PlanCompiler for SyntheticCompiler {
    fn compile<'a>(&'a self, request: &'a CompilationRequest) -> BoxFuture<'a, Result<CompiledPlan>> {
        async move {
            tokio::time::sleep(self.compile_duration).await;
            self.build(request)
        }
        .boxed()
    }
}

fn node_spec(function: &str, target: &str) -> NodeSpec {
    let target = TargetReference::new(TargetType::Position, target);
    NodeSpec {
        function_id: function.into(),
        target: target.clone(),
        outputs: vec![ValueSpecification::new(function, target)],
    }
}

/// Prices `positions` positions off a single market data node and sums them up.
fn pricing_graph(calculation_configuration: &str, positions: usize) -> Result<DependencyGraph> {
    let mut builder = DependencyGraph::builder(calculation_configuration);
    let market_data = builder.add_node(node_spec("MarketData", "all"), &[])?;
    let values = (0..positions)
        .map(|i| builder.add_node(node_spec("PresentValue", &format!("pos-{i}")), &[market_data]))
        .collect::<Result<Vec<_>, _>>()?;
    let total = node_spec("Sum", "total");
    let output = total.outputs[0].clone();
    let total = builder.add_node(total, &values)?;
    builder.add_terminal_output(total, output, ["Sum[total]"])?;
    Ok(builder.build())
}

/// A workload ready to be run against a [`CompilationCoordinator`].
#[derive(Debug)]
pub struct PreparedWorkload {
    keys: Vec<ViewExecutionCacheKey>,
    valuation_times: Vec<DateTime<Utc>>,
    compiler: SyntheticCompiler,
    next: AtomicUsize,
}

impl PreparedWorkload {
    pub fn compilations(&self) -> usize {
        self.compiler.compilations()
    }

    /// The number of distinct plans this workload needs.
    pub fn distinct_keys(&self) -> usize {
        self.keys.len()
    }

    /// Requests the next view in line, compiling it if necessary.
    pub async fn run_once(&self, coordinator: &CompilationCoordinator) -> Result<()> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let key = &self.keys[n % self.keys.len()];
        let valuation_time = self.valuation_times[(n / self.keys.len()) % self.valuation_times.len()];

        let request = CompilationRequest {
            key: key.clone(),
            valuation_time,
            version_correction: VersionCorrection::LATEST,
            function_init_id: 1,
        };

        let plan = if self.valuation_times.len() > 1 {
            coordinator.get_or_compile_at(&request, &self.compiler).await?
        } else {
            coordinator.get_or_compile(&request, &self.compiler).await?
        };

        // executors annotate their private copy
        if let Some(node) = plan.graphs().first().and_then(|graph| graph.nodes().first()) {
            node.annotate("execution", n.to_string());
        }
        Ok(())
    }
}

/// Registers the views of `workload` with `resolver` and builds its keys.
pub fn prepare_workload(
    index: usize,
    workload: Workload,
    resolver: &Arc<InMemoryTargetResolver>,
) -> Result<PreparedWorkload> {
    let portfolio = Arc::new(Portfolio {
        unique_id: UniqueId::of("DbPrt", "stress"),
        name: "Stress".to_owned(),
    });
    resolver.add_portfolio(portfolio.clone());

    let hints: Vec<_> = workload
        .hints
        .iter()
        .map(|hint| ProviderHint::from(hint.as_str()))
        .collect();

    let mut keys = Vec::with_capacity(workload.views);
    for i in 0..workload.views.max(1) {
        let name = format!("workload-{index}-view-{i}");
        let view = Arc::new(ViewDefinition {
            unique_id: UniqueId::of("DbCfg", &name),
            name,
            market_data_user: "stress".to_owned(),
            portfolio_id: Some(portfolio.unique_id.clone()),
            calculation_configurations: vec!["Default".to_owned()],
        });
        let key = ViewExecutionCacheKey::of(view.unique_id.clone(), hints.clone())
            .with_context(|| format!("invalid key for workload {index}"))?;
        resolver.add_view(view);
        keys.push(key);
    }

    let start = Utc::now();
    let valuation_times = (0..workload.valuation_times.max(1))
        .map(|i| start + TimeDelta::minutes(i as i64))
        .collect();

    Ok(PreparedWorkload {
        keys,
        valuation_times,
        compiler: SyntheticCompiler {
            resolver: resolver.clone(),
            portfolio,
            compile_duration: workload.compile_duration,
            graph_size: workload.graph_size,
            compilations: AtomicUsize::new(0),
        },
        next: AtomicUsize::new(0),
    })
}
