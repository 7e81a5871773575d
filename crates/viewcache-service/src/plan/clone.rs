use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{CompiledPlan, DependencyGraph, DependencyNode, NodeRef, TerminalOutput};

impl CompiledPlan {
    /// Creates a structurally identical plan that shares no graph node with `self`.
    ///
    /// Sharing *within* the copy is preserved: two edges pointing at the same node of the
    /// original point at the same node of the copy. The view definition and portfolio are
    /// immutable and remain shared.
    ///
    /// This must be used whenever a plan that came out of a cache is handed to a consumer which
    /// may annotate its nodes. A freshly compiled plan with a single owner needs no copy.
    pub fn deep_clone(&self) -> Self {
        let graphs = self.graphs.iter().map(clone_graph).collect();
        self.with_graphs_replaced(graphs)
    }
}

fn clone_graph(graph: &DependencyGraph) -> DependencyGraph {
    let mut cloner = NodeCloner::default();

    let nodes = graph
        .nodes
        .iter()
        .map(|node| cloner.clone_node(node))
        .collect();
    let terminal_outputs = graph
        .terminal_outputs
        .iter()
        .map(|terminal| TerminalOutput {
            node: cloner.clone_node(&terminal.node),
            value: terminal.value.clone(),
            requirements: terminal.requirements.clone(),
        })
        .collect();

    DependencyGraph {
        calculation_configuration: graph.calculation_configuration.clone(),
        nodes,
        terminal_outputs,
    }
}

/// A memoized copy of a node DAG, keyed by the identity of the original nodes.
#[derive(Default)]
struct NodeCloner {
    cloned: FxHashMap<*const DependencyNode, NodeRef>,
}

impl NodeCloner {
    /// Returns the copy of `root`, copying it and everything it depends on first if needed.
    ///
    /// This is a depth-first walk with an explicit stack, so deep graphs can not overflow the
    /// call stack. A node is only copied after all of its inputs have been.
    fn clone_node(&mut self, root: &NodeRef) -> NodeRef {
        if let Some(copy) = self.cloned.get(&Arc::as_ptr(root)) {
            return copy.clone();
        }

        let mut stack: Vec<(&NodeRef, bool)> = vec![(root, false)];
        while let Some((node, inputs_done)) = stack.pop() {
            let ptr = Arc::as_ptr(node);
            if self.cloned.contains_key(&ptr) {
                continue;
            }

            if !inputs_done {
                stack.push((node, true));
                for input in node.inputs.iter().rev() {
                    if !self.cloned.contains_key(&Arc::as_ptr(input)) {
                        stack.push((input, false));
                    }
                }
                continue;
            }

            let inputs = node
                .inputs
                .iter()
                .map(|input| self.cloned[&Arc::as_ptr(input)].clone())
                .collect();
            self.cloned
                .insert(ptr, Arc::new(node.copy_with_inputs(inputs)));
        }

        self.cloned[&Arc::as_ptr(root)].clone()
    }
}
