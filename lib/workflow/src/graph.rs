//! Workflow graph implementation using petgraph.
//!
//! Nodes live in petgraph's arena and edges refer to them by `NodeIndex`, so
//! the graph has no owning references between nodes. A side map gives O(1)
//! lookup from `NodeId` to index.

use crate::edge::{Branch, Edge};
use crate::error::GraphError;
use crate::node::Node;
use flowgate_core::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A directed acyclic graph of workflow nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "GraphRepr", try_from = "GraphRepr")]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let node_id = node.id;
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        node_id
    }

    /// Adds a dependency from `source_id` to `target_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if either node is missing, or if the branch label
    /// does not fit the source node's kind.
    pub fn add_edge(
        &mut self,
        source_id: NodeId,
        target_id: NodeId,
        edge: Edge,
    ) -> Result<(), GraphError> {
        let source = self.index_of(source_id)?;
        let target = self.index_of(target_id)?;

        let source_is_condition = self.graph[source].is_condition();
        match (source_is_condition, edge.branch) {
            (true, None) => return Err(GraphError::MissingBranch { source: source_id }),
            (false, Some(_)) => return Err(GraphError::UnexpectedBranch { source: source_id }),
            _ => {}
        }

        self.graph.add_edge(source, target, edge);
        Ok(())
    }

    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight(*index)
    }

    /// Finds a node by its unique name.
    #[must_use]
    pub fn node_named(&self, name: &str) -> Option<&Node> {
        self.nodes().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// `node_id` and every node reachable from it.
    #[must_use]
    pub fn downstream_closure(&self, node_id: NodeId) -> HashSet<NodeId> {
        let mut reached = HashSet::new();
        let Some(&start) = self.node_index_map.get(&node_id) else {
            return reached;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            reached.insert(self.graph[idx].id);
        }
        reached
    }

    /// Node ids in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` if the graph is not a DAG.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].id).collect())
            .map_err(|_| GraphError::CycleDetected)
    }

    /// Validates the graph.
    ///
    /// Checks:
    /// - Node names are unique
    /// - Edges leaving condition nodes are labelled, others are not
    /// - No cycles
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut names = HashSet::new();
        for node in self.nodes() {
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNodeName {
                    name: node.name.clone(),
                });
            }
        }

        for edge in self.graph.edge_references() {
            let source = &self.graph[edge.source()];
            match (source.is_condition(), edge.weight().branch) {
                (true, None) => return Err(GraphError::MissingBranch { source: source.id }),
                (false, Some(_)) => {
                    return Err(GraphError::UnexpectedBranch { source: source.id });
                }
                _ => {}
            }
        }

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(GraphError::CycleDetected);
        }
        Ok(())
    }

    /// Read access to the arena, for executors that track per-index state.
    pub(crate) fn arena(&self) -> &DiGraph<Node, Edge> {
        &self.graph
    }

    pub(crate) fn index(&self, node_id: NodeId) -> Option<NodeIndex> {
        self.node_index_map.get(&node_id).copied()
    }

    fn index_of(&self, node_id: NodeId) -> Result<NodeIndex, GraphError> {
        self.index(node_id)
            .ok_or(GraphError::NodeNotFound { node_id })
    }
}

/// Serialized form: a node list plus id-addressed edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphRepr {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<EdgeRepr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRepr {
    source: NodeId,
    target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<Branch>,
}

impl From<WorkflowGraph> for GraphRepr {
    fn from(graph: WorkflowGraph) -> Self {
        let edges = graph
            .graph
            .edge_references()
            .map(|e| EdgeRepr {
                source: graph.graph[e.source()].id,
                target: graph.graph[e.target()].id,
                branch: e.weight().branch,
            })
            .collect();
        let (nodes, _) = graph.graph.into_nodes_edges();
        Self {
            nodes: nodes.into_iter().map(|n| n.weight).collect(),
            edges,
        }
    }
}

impl TryFrom<GraphRepr> for WorkflowGraph {
    type Error = GraphError;

    fn try_from(repr: GraphRepr) -> Result<Self, Self::Error> {
        let mut graph = WorkflowGraph::new();
        for node in repr.nodes {
            graph.add_node(node);
        }
        for e in repr.edges {
            graph.add_edge(e.source, e.target, Edge { branch: e.branch })?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, Operator};
    use serde_json::json;

    fn call(name: &str) -> Node {
        Node::connector(name, "echo", "echo")
    }

    fn branch(name: &str) -> Node {
        Node::condition(name, Condition::new(json!(5), Operator::GreaterThan, json!(3)))
    }

    #[test]
    fn add_nodes_and_edges() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(call("a"));
        let b = graph.add_node(call("b"));
        graph.add_edge(a, b, Edge::new()).expect("add edge");

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.downstream_closure(a), HashSet::from([a, b]));
    }

    #[test]
    fn edge_to_missing_node_fails() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(call("a"));
        let ghost = NodeId::new();
        assert_eq!(
            graph.add_edge(a, ghost, Edge::new()),
            Err(GraphError::NodeNotFound { node_id: ghost })
        );
    }

    #[test]
    fn branch_labels_must_match_source_kind() {
        let mut graph = WorkflowGraph::new();
        let cond = graph.add_node(branch("check"));
        let plain = graph.add_node(call("plain"));
        let other = graph.add_node(call("other"));

        assert!(matches!(
            graph.add_edge(cond, plain, Edge::new()),
            Err(GraphError::MissingBranch { .. })
        ));
        assert!(matches!(
            graph.add_edge(plain, other, Edge::on_true()),
            Err(GraphError::UnexpectedBranch { .. })
        ));
        assert!(graph.add_edge(cond, plain, Edge::on_true()).is_ok());
    }

    #[test]
    fn detects_cycles() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(call("a"));
        let b = graph.add_node(call("b"));
        graph.add_edge(a, b, Edge::new()).expect("a->b");
        graph.add_edge(b, a, Edge::new()).expect("b->a");

        assert_eq!(graph.validate(), Err(GraphError::CycleDetected));
        assert_eq!(graph.topological_order(), Err(GraphError::CycleDetected));
    }

    #[test]
    fn detects_duplicate_names() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(call("same"));
        graph.add_node(call("same"));
        assert!(matches!(
            graph.validate(),
            Err(GraphError::DuplicateNodeName { .. })
        ));
    }

    #[test]
    fn topological_order_respects_edges() {
        let mut graph = WorkflowGraph::new();
        let c = graph.add_node(call("c"));
        let a = graph.add_node(call("a"));
        let b = graph.add_node(call("b"));
        graph.add_edge(a, b, Edge::new()).expect("a->b");
        graph.add_edge(b, c, Edge::new()).expect("b->c");

        let order = graph.topological_order().expect("dag");
        let pos = |id| order.iter().position(|n| *n == id).expect("present");
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn downstream_closure_includes_start() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(call("a"));
        let b = graph.add_node(call("b"));
        let c = graph.add_node(call("c"));
        let d = graph.add_node(call("d"));
        graph.add_edge(a, b, Edge::new()).expect("a->b");
        graph.add_edge(b, c, Edge::new()).expect("b->c");
        graph.add_edge(a, d, Edge::new()).expect("a->d");

        let closure = graph.downstream_closure(b);
        assert_eq!(closure, HashSet::from([b, c]));
    }

    #[test]
    fn serde_preserves_structure_and_lookup() {
        let mut graph = WorkflowGraph::new();
        let cond = graph.add_node(branch("check"));
        let yes = graph.add_node(call("yes"));
        graph.add_edge(cond, yes, Edge::on_true()).expect("edge");

        let json = serde_json::to_value(&graph).expect("serialize");
        assert_eq!(json["edges"][0]["branch"], json!("true"));

        let parsed: WorkflowGraph = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.node_count(), 2);
        assert!(parsed.get_node(yes).is_some());
        assert_eq!(parsed.edge_count(), 1);
        assert_eq!(parsed.downstream_closure(cond), HashSet::from([cond, yes]));
    }

    #[test]
    fn deserializing_dangling_edge_fails() {
        let json = json!({
            "nodes": [],
            "edges": [{"source": NodeId::new(), "target": NodeId::new()}]
        });
        assert!(serde_json::from_value::<WorkflowGraph>(json).is_err());
    }
}
