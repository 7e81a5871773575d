use std::sync::Arc;

use viewcache_service::caching::ViewExecutionCacheKey;
use viewcache_service::plan::{CompiledPlan, DependencyGraph, NodeSpec, ValueSpecification};
use viewcache_service::resolver::InMemoryTargetResolver;
use viewcache_service::types::{
    Portfolio, ProviderHint, TargetReference, TargetType, UniqueId, VersionCorrection,
    ViewDefinition,
};

pub fn view(name: &str) -> Arc<ViewDefinition> {
    Arc::new(ViewDefinition {
        unique_id: UniqueId::of("DbCfg", name),
        name: name.to_owned(),
        market_data_user: "integration".to_owned(),
        portfolio_id: Some(portfolio().unique_id.clone()),
        calculation_configurations: vec!["Default".to_owned(), "Stressed".to_owned()],
    })
}

pub fn portfolio() -> Arc<Portfolio> {
    Arc::new(Portfolio {
        unique_id: UniqueId::of("DbPrt", "equities"),
        name: "Equities".to_owned(),
    })
}

pub fn resolver(views: &[&str]) -> Arc<InMemoryTargetResolver> {
    let resolver = InMemoryTargetResolver::default();
    for name in views {
        resolver.add_view(view(name));
    }
    resolver.add_portfolio(portfolio());
    Arc::new(resolver)
}

pub fn key(view_name: &str, hints: &[&str]) -> ViewExecutionCacheKey {
    let hints = hints.iter().map(|&hint| ProviderHint::from(hint)).collect();
    ViewExecutionCacheKey::of(UniqueId::of("DbCfg", view_name), hints).unwrap()
}

fn spec(function: &str, target: &str) -> NodeSpec {
    let target = TargetReference::new(TargetType::Position, target);
    NodeSpec {
        function_id: function.into(),
        target: target.clone(),
        outputs: vec![ValueSpecification::new(function, target)],
    }
}

/// A graph pricing `positions` positions, each from a shared market data node.
pub fn graph(calculation_configuration: &str, positions: usize) -> DependencyGraph {
    let mut builder = DependencyGraph::builder(calculation_configuration);
    let market_data = builder.add_node(spec("MarketData", "all"), &[]).unwrap();
    let mut values = Vec::with_capacity(positions);
    for i in 0..positions {
        let position = format!("pos-{i}");
        let value = builder
            .add_node(spec("PresentValue", &position), &[market_data])
            .unwrap();
        values.push(value);
    }
    let total = builder.add_node(spec("Sum", "total"), &values).unwrap();
    let output = spec("Sum", "total").outputs[0].clone();
    builder
        .add_terminal_output(total, output, ["Sum[total]"])
        .unwrap();
    builder.build()
}

pub fn plan(view_name: &str, function_init_id: u64) -> CompiledPlan {
    let mut plan = CompiledPlan::new(view(view_name), VersionCorrection::LATEST, "integration")
        .with_portfolio(portfolio())
        .with_graph(graph("Default", 10))
        .with_graph(graph("Stressed", 3))
        .with_function_init_id(function_init_id);
    for i in 0..10 {
        let position = format!("pos-{i}");
        plan = plan.with_resolved_identifier(
            TargetReference::new(TargetType::Position, &position),
            UniqueId::of("DbPos", &position).with_version("1"),
        );
    }
    plan
}
