//! The persisted format of plans in the shared cache.
//!
//! An envelope starts with a 4 byte magic and a little endian `u16` schema version, followed by
//! the zstd compressed JSON of a [`PlanEnvelope`].
//!
//! Views and portfolios are only stored by reference and need to be resolved again when reading
//! an envelope back. Graph nodes are stored in topological order with their inputs as
//! [`NodeId`]s, and are rebuilt through [`DependencyGraph::builder`], which re-validates the
//! edges. Execution annotations are not persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::caching::CacheError;
use crate::plan::{CompiledPlan, DependencyGraph, NodeId, NodeSpec, ValueSpecification};
use crate::types::{Portfolio, TargetReference, UniqueId, VersionCorrection, ViewDefinition};

const MAGIC: &[u8; 4] = b"VECP";
const SCHEMA_VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    spec: NodeSpec,
    inputs: Vec<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TerminalRecord {
    node: NodeId,
    value: ValueSpecification,
    requirements: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphRecord {
    calculation_configuration: String,
    nodes: Vec<NodeRecord>,
    terminal_outputs: Vec<TerminalRecord>,
}

/// A serialized [`CompiledPlan`], before rehydration.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanEnvelope {
    /// The shared cache instance that wrote this envelope.
    pub instance: Uuid,
    pub version_correction: VersionCorrection,
    pub compilation_id: String,
    pub view_id: UniqueId,
    pub portfolio_id: Option<UniqueId>,
    graphs: Vec<GraphRecord>,
    resolved_identifiers: Vec<(TargetReference, UniqueId)>,
    function_init_id: u64,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
}

impl PlanEnvelope {
    pub fn new(instance: Uuid, plan: &CompiledPlan) -> Self {
        let graphs = plan
            .graphs()
            .iter()
            .map(|graph| GraphRecord {
                calculation_configuration: graph.calculation_configuration().to_owned(),
                nodes: graph
                    .nodes()
                    .iter()
                    .map(|node| NodeRecord {
                        spec: node.spec().clone(),
                        inputs: node.inputs().iter().map(|input| input.id()).collect(),
                    })
                    .collect(),
                terminal_outputs: graph
                    .terminal_outputs()
                    .iter()
                    .map(|terminal| TerminalRecord {
                        node: terminal.node.id(),
                        value: terminal.value.clone(),
                        requirements: terminal.requirements.clone(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            instance,
            version_correction: plan.version_correction(),
            compilation_id: plan.compilation_id().to_owned(),
            view_id: plan.view().unique_id.clone(),
            portfolio_id: plan.portfolio().map(|p| p.unique_id.clone()),
            graphs,
            resolved_identifiers: plan
                .resolved_identifiers()
                .iter()
                .map(|(reference, id)| (reference.clone(), id.clone()))
                .collect(),
            function_init_id: plan.function_init_id(),
            valid_from: plan.valid_from(),
            valid_to: plan.valid_to(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let json = serde_json::to_vec(self)?;
        let compressed = zstd::bulk::compress(&json, COMPRESSION_LEVEL)
            .map_err(|e| CacheError::SerializationFailure(e.to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + compressed.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&compressed);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let Some(payload) = bytes.strip_prefix(MAGIC) else {
            return Err(CacheError::SerializationFailure(
                "not a plan envelope".into(),
            ));
        };
        let Some((version, payload)) = payload.split_first_chunk::<2>() else {
            return Err(CacheError::SerializationFailure(
                "truncated plan envelope".into(),
            ));
        };
        let version = u16::from_le_bytes(*version);
        if version != SCHEMA_VERSION {
            return Err(CacheError::SerializationFailure(format!(
                "unsupported plan envelope version {version}"
            )));
        }

        let json = zstd::stream::decode_all(payload)
            .map_err(|e| CacheError::SerializationFailure(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Rebuilds the plan, given the freshly resolved view and portfolio.
    pub fn into_plan(
        self,
        view: Arc<ViewDefinition>,
        portfolio: Option<Arc<Portfolio>>,
    ) -> Result<CompiledPlan, CacheError> {
        let mut plan = CompiledPlan::new(view, self.version_correction, &self.compilation_id)
            .with_function_init_id(self.function_init_id)
            .with_validity(self.valid_from, self.valid_to);
        if let Some(portfolio) = portfolio {
            plan = plan.with_portfolio(portfolio);
        }
        for (reference, id) in self.resolved_identifiers {
            plan = plan.with_resolved_identifier(reference, id);
        }
        for graph in self.graphs {
            plan = plan.with_graph(rebuild_graph(graph).map_err(|err| match err {
                CacheError::InvalidArgument(msg) => CacheError::SerializationFailure(msg),
                err => err,
            })?);
        }
        Ok(plan)
    }
}

fn rebuild_graph(record: GraphRecord) -> Result<DependencyGraph, CacheError> {
    let mut builder = DependencyGraph::builder(&record.calculation_configuration);
    for node in record.nodes {
        builder.add_node(node.spec, &node.inputs)?;
    }
    for terminal in record.terminal_outputs {
        builder.add_terminal_output(terminal.node, terminal.value, terminal.requirements)?;
    }
    Ok(builder.build())
}
