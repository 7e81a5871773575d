//! The compiled plan model.
//!
//! A [`CompiledPlan`] is what the view compiler produces and what the caches store: one
//! [`DependencyGraph`] per calculation configuration, the identifier resolutions that went into
//! it, and the window of valuation times it is valid for.
//!
//! Graph nodes are shared, reference counted objects. A node references its inputs directly, so
//! a graph forms a DAG with internal sharing. Nodes carry a small mutable annotation map which
//! executors use to record per-execution state. This is exactly why a plan handed out by a cache
//! must be [deep cloned](CompiledPlan::deep_clone) before anyone writes to it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::caching::CacheError;
use crate::types::{Portfolio, TargetReference, UniqueId, VersionCorrection, ViewDefinition};

mod clone;

/// A shared reference to a node of a [`DependencyGraph`].
pub type NodeRef = Arc<DependencyNode>;

/// The position of a node within its [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value produced by a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub value_name: Arc<str>,
    pub target: TargetReference,
}

impl ValueSpecification {
    pub fn new(value_name: &str, target: TargetReference) -> Self {
        Self {
            value_name: value_name.into(),
            target,
        }
    }
}

/// Everything about a node except its position and its input edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub function_id: Arc<str>,
    pub target: TargetReference,
    pub outputs: Vec<ValueSpecification>,
}

/// A single function application within a [`DependencyGraph`].
pub struct DependencyNode {
    id: NodeId,
    spec: NodeSpec,
    inputs: Vec<NodeRef>,
    annotations: Mutex<BTreeMap<String, String>>,
}

impl DependencyNode {
    fn new(id: NodeId, spec: NodeSpec, inputs: Vec<NodeRef>) -> Self {
        Self {
            id,
            spec,
            inputs,
            annotations: Default::default(),
        }
    }

    /// Creates a copy of this node that is wired to the given inputs instead.
    fn copy_with_inputs(&self, inputs: Vec<NodeRef>) -> Self {
        Self {
            id: self.id,
            spec: self.spec.clone(),
            inputs,
            annotations: Mutex::new(self.annotations()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn function_id(&self) -> &str {
        &self.spec.function_id
    }

    pub fn target(&self) -> &TargetReference {
        &self.spec.target
    }

    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.spec.outputs
    }

    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    /// Records a piece of execution state on this node.
    pub fn annotate(&self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.annotations.lock().unwrap().get(key).cloned()
    }

    /// Returns a snapshot of all execution annotations.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.annotations.lock().unwrap().clone()
    }

    /// Compares two nodes by content, looking at input edges by [`NodeId`] only.
    ///
    /// Annotations are execution state and do not count as content.
    fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.spec == other.spec
            && self.inputs.len() == other.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&other.inputs)
                .all(|(a, b)| a.id == b.id)
    }
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // inputs are printed as ids, the whole DAG below a node can be huge
        let inputs: Vec<_> = self.inputs.iter().map(|n| n.id).collect();
        f.debug_struct("DependencyNode")
            .field("id", &self.id)
            .field("function_id", &self.spec.function_id)
            .field("target", &self.spec.target)
            .field("outputs", &self.spec.outputs)
            .field("inputs", &inputs)
            .finish()
    }
}

/// A value the view asked for, together with the node that produces it.
#[derive(Clone)]
pub struct TerminalOutput {
    pub node: NodeRef,
    pub value: ValueSpecification,
    pub requirements: BTreeSet<String>,
}

impl fmt::Debug for TerminalOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalOutput")
            .field("node", &self.node.id)
            .field("value", &self.value)
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// The dependency graph of one calculation configuration.
///
/// Nodes are kept in topological order: every input of a node appears before it.
#[derive(Debug)]
pub struct DependencyGraph {
    calculation_configuration: Arc<str>,
    nodes: Vec<NodeRef>,
    terminal_outputs: Vec<TerminalOutput>,
}

impl DependencyGraph {
    pub fn builder(calculation_configuration: &str) -> DependencyGraphBuilder {
        DependencyGraphBuilder {
            calculation_configuration: calculation_configuration.into(),
            nodes: Vec::new(),
            terminal_outputs: Vec::new(),
        }
    }

    pub fn calculation_configuration(&self) -> &str {
        &self.calculation_configuration
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRef> {
        self.nodes.get(id.0 as usize)
    }

    pub fn terminal_outputs(&self) -> &[TerminalOutput] {
        &self.terminal_outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The number of input edges over all nodes.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.inputs.len()).sum()
    }
}

impl Drop for DependencyGraph {
    fn drop(&mut self) {
        self.terminal_outputs.clear();
        drop_nodes(&mut self.nodes);
    }
}

/// Releases nodes dependents-first.
///
/// Dropping in insertion order would let the last node recursively drop the whole chain of
/// inputs below it, which overflows the stack for deep graphs.
fn drop_nodes(nodes: &mut Vec<NodeRef>) {
    while let Some(node) = nodes.pop() {
        drop(node);
    }
}

impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.calculation_configuration == other.calculation_configuration
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.same_content(b))
            && self.terminal_outputs.len() == other.terminal_outputs.len()
            && self
                .terminal_outputs
                .iter()
                .zip(&other.terminal_outputs)
                .all(|(a, b)| {
                    a.node.id == b.node.id
                        && a.value == b.value
                        && a.requirements == b.requirements
                })
    }
}

/// Incrementally assembles a [`DependencyGraph`].
///
/// Inputs are referenced by the [`NodeId`] returned from [`add_node`](Self::add_node), which
/// makes it impossible to construct a cycle or to wire in a node of another graph.
#[derive(Debug)]
pub struct DependencyGraphBuilder {
    calculation_configuration: Arc<str>,
    nodes: Vec<NodeRef>,
    terminal_outputs: Vec<TerminalOutput>,
}

impl DependencyGraphBuilder {
    fn get(&self, id: NodeId) -> Result<&NodeRef, CacheError> {
        self.nodes.get(id.0 as usize).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "node {id} is not part of graph `{}`",
                self.calculation_configuration
            ))
        })
    }

    /// Adds a node consuming the outputs of the given, already added, nodes.
    pub fn add_node(&mut self, spec: NodeSpec, inputs: &[NodeId]) -> Result<NodeId, CacheError> {
        let inputs = inputs
            .iter()
            .map(|&id| self.get(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes
            .push(Arc::new(DependencyNode::new(id, spec, inputs)));
        Ok(id)
    }

    /// Marks a value of the given node as a terminal output satisfying `requirements`.
    pub fn add_terminal_output<I, S>(
        &mut self,
        node: NodeId,
        value: ValueSpecification,
        requirements: I,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.get(node)?.clone();
        if !node.outputs().contains(&value) {
            return Err(CacheError::InvalidArgument(format!(
                "node {} does not produce `{}`",
                node.id, value.value_name
            )));
        }
        self.terminal_outputs.push(TerminalOutput {
            node,
            value,
            requirements: requirements.into_iter().map(Into::into).collect(),
        });
        Ok(())
    }

    pub fn build(mut self) -> DependencyGraph {
        DependencyGraph {
            calculation_configuration: self.calculation_configuration.clone(),
            nodes: std::mem::take(&mut self.nodes),
            terminal_outputs: std::mem::take(&mut self.terminal_outputs),
        }
    }
}

impl Drop for DependencyGraphBuilder {
    fn drop(&mut self) {
        self.terminal_outputs.clear();
        drop_nodes(&mut self.nodes);
    }
}

/// A compiled, fully resolved execution plan for a view.
///
/// Cached plans are shared between consumers behind an [`Arc`] and must be treated as
/// immutable. Use [`deep_clone`](Self::deep_clone) to obtain an instance that may be annotated.
#[derive(Debug, PartialEq)]
pub struct CompiledPlan {
    version_correction: VersionCorrection,
    compilation_id: Arc<str>,
    view: Arc<ViewDefinition>,
    portfolio: Option<Arc<Portfolio>>,
    graphs: Vec<DependencyGraph>,
    resolved_identifiers: BTreeMap<TargetReference, UniqueId>,
    function_init_id: u64,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
}

impl CompiledPlan {
    pub fn new(
        view: Arc<ViewDefinition>,
        version_correction: VersionCorrection,
        compilation_id: &str,
    ) -> Self {
        Self {
            version_correction,
            compilation_id: compilation_id.into(),
            view,
            portfolio: None,
            graphs: Vec::new(),
            resolved_identifiers: BTreeMap::new(),
            function_init_id: 0,
            valid_from: None,
            valid_to: None,
        }
    }

    pub fn with_portfolio(mut self, portfolio: Arc<Portfolio>) -> Self {
        self.portfolio = Some(portfolio);
        self
    }

    pub fn with_graph(mut self, graph: DependencyGraph) -> Self {
        self.graphs.push(graph);
        self
    }

    pub fn with_resolved_identifier(mut self, reference: TargetReference, id: UniqueId) -> Self {
        self.resolved_identifiers.insert(reference, id);
        self
    }

    pub fn with_function_init_id(mut self, function_init_id: u64) -> Self {
        self.function_init_id = function_init_id;
        self
    }

    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    /// The resolution-time context the identifiers of this plan were resolved at.
    pub fn version_correction(&self) -> VersionCorrection {
        self.version_correction
    }

    pub fn compilation_id(&self) -> &str {
        &self.compilation_id
    }

    pub fn view(&self) -> &Arc<ViewDefinition> {
        &self.view
    }

    pub fn portfolio(&self) -> Option<&Arc<Portfolio>> {
        self.portfolio.as_ref()
    }

    pub fn graphs(&self) -> &[DependencyGraph] {
        &self.graphs
    }

    /// Looks up the graph of the given calculation configuration.
    pub fn graph(&self, calculation_configuration: &str) -> Option<&DependencyGraph> {
        self.graphs
            .iter()
            .find(|g| g.calculation_configuration() == calculation_configuration)
    }

    pub fn resolved_identifiers(&self) -> &BTreeMap<TargetReference, UniqueId> {
        &self.resolved_identifiers
    }

    /// The generation of the function repository this plan was compiled against.
    pub fn function_init_id(&self) -> u64 {
        self.function_init_id
    }

    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    /// Whether `valuation_time` falls into `[valid_from, valid_to)`.
    ///
    /// Missing bounds are unbounded.
    pub fn is_valid_for(&self, valuation_time: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| valuation_time >= from)
            && self.valid_to.is_none_or(|to| valuation_time < to)
    }

    /// The total number of nodes over all graphs.
    pub fn node_count(&self) -> usize {
        self.graphs.iter().map(DependencyGraph::len).sum()
    }

    /// The approximate in-memory "cost" of this plan, counting nodes and edges.
    pub fn weight(&self) -> u32 {
        let edges: usize = self.graphs.iter().map(DependencyGraph::edge_count).sum();
        (self.node_count() + edges).try_into().unwrap_or(u32::MAX)
    }

    /// Creates a plan identical to this one, except for its graphs.
    fn with_graphs_replaced(&self, graphs: Vec<DependencyGraph>) -> Self {
        Self {
            version_correction: self.version_correction,
            compilation_id: self.compilation_id.clone(),
            view: self.view.clone(),
            portfolio: self.portfolio.clone(),
            graphs,
            resolved_identifiers: self.resolved_identifiers.clone(),
            function_init_id: self.function_init_id,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }
}
