//! Validated, index-based view of a workflow graph.

use loomcore::{
    Edge, ErrorHandling, FailurePolicy, NodeId, NodeSpec, ValidationError, WorkflowGraph,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Dependency graph of one workflow. Node weights are node ids, edge weights
/// index into `WorkflowGraph::edges`.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    workflow: WorkflowGraph,
    graph: DiGraph<NodeId, usize>,
    index: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl ExecutionGraph {
    /// Build the dependency graph, rejecting empty graphs, duplicate ids,
    /// dangling edges, self loops and cycles.
    pub fn build(workflow: WorkflowGraph) -> Result<Self, ValidationError> {
        if workflow.nodes.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for spec in &workflow.nodes {
            if index.contains_key(&spec.id) {
                return Err(ValidationError::DuplicateNode(spec.id.clone()));
            }
            let idx = graph.add_node(spec.id.clone());
            index.insert(spec.id.clone(), idx);
        }

        for (position, edge) in workflow.edges.iter().enumerate() {
            let from = index
                .get(&edge.source)
                .ok_or_else(|| ValidationError::UnknownEndpoint(edge.source.clone()))?;
            let to = index
                .get(&edge.target)
                .ok_or_else(|| ValidationError::UnknownEndpoint(edge.target.clone()))?;
            if from == to {
                return Err(ValidationError::SelfLoop(edge.source.clone()));
            }
            graph.add_edge(*from, *to, position);
        }

        toposort(&graph, None)
            .map_err(|cycle| ValidationError::CyclicDependency(graph[cycle.node_id()].clone()))?;
        let order = declaration_order(&graph);

        Ok(Self {
            workflow,
            graph,
            index,
            order,
        })
    }

    pub fn workflow(&self) -> &WorkflowGraph {
        &self.workflow
    }

    pub fn spec(&self, node_id: &str) -> Option<&NodeSpec> {
        self.workflow.find_node(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    /// Node ids in a dependency-respecting order
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Edges pointing at `node_id`
    pub fn inbound(&self, node_id: &str) -> Vec<&Edge> {
        let Some(idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<&Edge> = self
            .graph
            .edges_directed(*idx, Direction::Incoming)
            .map(|e| &self.workflow.edges[*e.weight()])
            .collect();
        edges.sort_by(|a, b| a.source.cmp(&b.source));
        edges
    }

    /// Distinct source nodes of `node_id`'s inbound edges
    pub fn dependencies(&self, node_id: &str) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self.inbound(node_id).iter().map(|e| e.source.clone()).collect();
        deps.dedup();
        deps
    }

    pub fn is_entry(&self, node_id: &str) -> bool {
        self.index.get(node_id).is_some_and(|idx| {
            self.graph
                .neighbors_directed(*idx, Direction::Incoming)
                .next()
                .is_none()
        })
    }

    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.order.iter().filter(|id| self.is_entry(id)).cloned().collect()
    }

    /// Every node reachable from `node_id`, excluding itself
    pub fn descendants(&self, node_id: &str) -> HashSet<NodeId> {
        let mut found = HashSet::new();
        let Some(start) = self.index.get(node_id) else {
            return found;
        };
        let mut dfs = Dfs::new(&self.graph, *start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != *start {
                found.insert(self.graph[idx].clone());
            }
        }
        found
    }

    /// Effective failure policy: the node's own, else the workflow default.
    pub fn failure_policy(&self, node_id: &str) -> FailurePolicy {
        self.spec(node_id)
            .and_then(|s| s.on_failure)
            .unwrap_or(match self.workflow.settings.on_error {
                ErrorHandling::StopWorkflow => FailurePolicy::Fail,
                ErrorHandling::ContinueOnError => FailurePolicy::Continue,
            })
    }

    pub fn max_attempts(&self, node_id: &str, default: u32) -> u32 {
        self.spec(node_id)
            .and_then(|s| s.retry)
            .map(|r| r.max_attempts)
            .unwrap_or(default)
            .max(1)
    }
}

/// Kahn's algorithm breaking ties by declaration order, so that dispatch
/// order is stable across runs. The graph must be acyclic.
fn declaration_order(graph: &DiGraph<NodeId, usize>) -> Vec<NodeId> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();
    let mut frontier: BTreeSet<NodeIndex> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| *idx)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = frontier.pop_first() {
        order.push(graph[idx].clone());
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    frontier.insert(next);
                }
            }
        }
    }
    order
}
