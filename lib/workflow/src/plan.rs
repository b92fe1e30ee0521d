//! Scheduling state for one run.
//!
//! The plan keeps one state per node, indexed by the graph's `NodeIndex`.
//! An incoming edge is *resolved* once its source is terminal, and *live*
//! when the source succeeded and emitted the edge's branch (or the edge is
//! unconditional). A waiting node becomes ready when every incoming edge is
//! resolved and at least one is live; it is skipped when every incoming edge
//! is resolved and none is live.
//!
//! Nodes are visited in topological order, so one sweep settles every
//! node whose fate is already decided.

use crate::edge::{Branch, Edge};
use crate::graph::WorkflowGraph;
use crate::node::FailurePolicy;
use flowgate_core::NodeId;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Waiting,
    Running,
    Succeeded(Option<Branch>),
    Failed(FailurePolicy),
    Skipped,
    Cancelled,
}

impl NodeState {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeStatus {
    Unresolved,
    Live,
    Dead,
}

/// How a finished plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlanOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub(crate) struct ExecutionPlan<'g> {
    graph: &'g WorkflowGraph,
    order: Vec<NodeIndex>,
    states: Vec<NodeState>,
    /// Set when a `fail_run` node failed. No further nodes are handed out.
    halted: bool,
}

impl<'g> ExecutionPlan<'g> {
    pub(crate) fn new(graph: &'g WorkflowGraph) -> Self {
        // Graphs are validated before a run starts; arena order is only a
        // fallback for a graph that slipped through.
        let order = graph
            .topological_order()
            .map(|ids| ids.into_iter().filter_map(|id| graph.index(id)).collect())
            .unwrap_or_else(|_| graph.arena().node_indices().collect());
        Self {
            graph,
            order,
            states: vec![NodeState::Waiting; graph.arena().node_count()],
            halted: false,
        }
    }

    /// Marks a node as already succeeded, for outputs reused by a replay.
    pub(crate) fn restore_succeeded(&mut self, node_id: NodeId, branch: Option<Branch>) {
        self.set(node_id, NodeState::Succeeded(branch));
    }

    /// Marks a node as already skipped, for steps reused by a replay.
    pub(crate) fn restore_skipped(&mut self, node_id: NodeId) {
        self.set(node_id, NodeState::Skipped);
    }

    /// Marks a node as already failed without stopping the run, for a
    /// `skip_downstream` failure reused by a replay.
    pub(crate) fn restore_tolerated_failure(&mut self, node_id: NodeId) {
        self.set(node_id, NodeState::Failed(FailurePolicy::SkipDownstream));
    }

    /// Skips every waiting node that can no longer run. Returns the nodes
    /// skipped by this call. A halted plan skips nothing; its leftovers are
    /// cancelled by the runner.
    pub(crate) fn settle(&mut self) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        if self.halted {
            return skipped;
        }
        let graph = self.graph;
        let arena = graph.arena();
        for position in 0..self.order.len() {
            let idx = self.order[position];
            if self.states[idx.index()] != NodeState::Waiting {
                continue;
            }
            let (resolved, live) = self.incoming_summary(idx);
            if resolved && !live && self.has_incoming(idx) {
                self.states[idx.index()] = NodeState::Skipped;
                skipped.push(arena[idx].id);
            }
        }
        skipped
    }

    /// Hands out up to `max` ready nodes and marks them running.
    pub(crate) fn take_ready(&mut self, max: usize) -> Vec<NodeId> {
        if self.halted || max == 0 {
            return Vec::new();
        }
        let graph = self.graph;
        let arena = graph.arena();
        let mut ready = Vec::new();
        for position in 0..self.order.len() {
            let idx = self.order[position];
            if ready.len() == max {
                break;
            }
            if self.states[idx.index()] != NodeState::Waiting {
                continue;
            }
            let (resolved, live) = self.incoming_summary(idx);
            if resolved && (live || !self.has_incoming(idx)) {
                self.states[idx.index()] = NodeState::Running;
                ready.push(arena[idx].id);
            }
        }
        ready
    }

    /// Records a success. Returns the nodes that became skipped.
    pub(crate) fn complete(&mut self, node_id: NodeId, branch: Option<Branch>) -> Vec<NodeId> {
        self.set(node_id, NodeState::Succeeded(branch));
        self.settle()
    }

    /// Records a permanent failure. Returns the nodes that became skipped.
    pub(crate) fn fail(&mut self, node_id: NodeId, policy: FailurePolicy) -> Vec<NodeId> {
        self.set(node_id, NodeState::Failed(policy));
        if policy == FailurePolicy::FailRun {
            self.halted = true;
            return Vec::new();
        }
        self.settle()
    }

    pub(crate) fn cancel(&mut self, node_id: NodeId) {
        self.set(node_id, NodeState::Cancelled);
    }

    #[must_use]
    pub(crate) fn running_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == NodeState::Running)
            .count()
    }

    #[must_use]
    pub(crate) fn is_halted(&self) -> bool {
        self.halted
    }

    /// Nothing is running and nothing more will be handed out.
    #[must_use]
    pub(crate) fn is_finished(&self) -> bool {
        if self.running_count() > 0 {
            return false;
        }
        self.halted || self.states.iter().all(|s| s.is_terminal())
    }

    #[must_use]
    pub(crate) fn outcome(&self) -> PlanOutcome {
        let all_terminal = self.states.iter().all(|s| s.is_terminal());
        let any_cancelled = self.states.contains(&NodeState::Cancelled);
        if self.halted || !all_terminal || any_cancelled {
            PlanOutcome::Failed
        } else {
            PlanOutcome::Succeeded
        }
    }

    /// Nodes that never reached a terminal state.
    #[must_use]
    pub(crate) fn unfinished(&self) -> Vec<NodeId> {
        let arena = self.graph.arena();
        arena
            .node_indices()
            .filter(|idx| !self.states[idx.index()].is_terminal())
            .map(|idx| arena[idx].id)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn state(&self, node_id: NodeId) -> Option<NodeState> {
        self.graph
            .index(node_id)
            .map(|idx| self.states[idx.index()])
    }

    fn set(&mut self, node_id: NodeId, state: NodeState) {
        if let Some(idx) = self.graph.index(node_id) {
            self.states[idx.index()] = state;
        }
    }

    fn has_incoming(&self, idx: NodeIndex) -> bool {
        self.graph
            .arena()
            .edges_directed(idx, Direction::Incoming)
            .next()
            .is_some()
    }

    /// Whether every incoming edge is resolved, and whether any is live.
    fn incoming_summary(&self, idx: NodeIndex) -> (bool, bool) {
        let mut resolved = true;
        let mut live = false;
        for edge in self.graph.arena().edges_directed(idx, Direction::Incoming) {
            match self.edge_status(edge.source(), edge.weight()) {
                EdgeStatus::Unresolved => resolved = false,
                EdgeStatus::Live => live = true,
                EdgeStatus::Dead => {}
            }
        }
        (resolved, live)
    }

    fn edge_status(&self, source: NodeIndex, edge: &Edge) -> EdgeStatus {
        match self.states[source.index()] {
            NodeState::Waiting | NodeState::Running => EdgeStatus::Unresolved,
            NodeState::Succeeded(branch) if edge.follows(branch) => EdgeStatus::Live,
            NodeState::Succeeded(_)
            | NodeState::Failed(_)
            | NodeState::Skipped
            | NodeState::Cancelled => EdgeStatus::Dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, Operator};
    use crate::node::Node;
    use serde_json::json;
    use std::collections::HashSet;

    struct Diamond {
        graph: WorkflowGraph,
        check: NodeId,
        yes: NodeId,
        no: NodeId,
        after_no: NodeId,
    }

    fn branching() -> Diamond {
        let mut graph = WorkflowGraph::new();
        let check = graph.add_node(Node::condition(
            "check",
            Condition::new(json!(5), Operator::GreaterThan, json!(3)),
        ));
        let yes = graph.add_node(Node::connector("yes", "echo", "echo"));
        let no = graph.add_node(Node::connector("no", "echo", "echo"));
        let after_no = graph.add_node(Node::connector("after_no", "echo", "echo"));
        graph.add_edge(check, yes, Edge::on_true()).expect("edge");
        graph.add_edge(check, no, Edge::on_false()).expect("edge");
        graph.add_edge(no, after_no, Edge::new()).expect("edge");
        Diamond {
            graph,
            check,
            yes,
            no,
            after_no,
        }
    }

    #[test]
    fn entry_nodes_are_ready_first() {
        let d = branching();
        let mut plan = ExecutionPlan::new(&d.graph);
        assert_eq!(plan.take_ready(10), vec![d.check]);
        assert!(plan.take_ready(10).is_empty());
    }

    #[test]
    fn untaken_branch_is_skipped_transitively() {
        let d = branching();
        let mut plan = ExecutionPlan::new(&d.graph);
        plan.take_ready(10);

        let skipped = plan.complete(d.check, Some(Branch::True));
        assert_eq!(skipped, vec![d.no, d.after_no]);
        assert_eq!(plan.take_ready(10), vec![d.yes]);

        plan.complete(d.yes, None);
        assert!(plan.is_finished());
        assert_eq!(plan.outcome(), PlanOutcome::Succeeded);
    }

    #[test]
    fn fail_run_halts_scheduling() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(Node::connector("a", "echo", "echo"));
        let b = graph.add_node(Node::connector("b", "echo", "echo"));
        let c = graph.add_node(Node::connector("c", "echo", "echo"));
        graph.add_edge(a, c, Edge::new()).expect("edge");
        let mut plan = ExecutionPlan::new(&graph);

        let ready: HashSet<NodeId> = plan.take_ready(10).into_iter().collect();
        assert_eq!(ready, HashSet::from([a, b]));
        plan.fail(a, FailurePolicy::FailRun);
        assert!(!plan.is_finished(), "b is still running");

        plan.complete(b, None);
        assert!(plan.take_ready(10).is_empty());
        assert!(plan.is_finished());
        assert_eq!(plan.outcome(), PlanOutcome::Failed);
        assert_eq!(plan.unfinished(), vec![c]);
    }

    #[test]
    fn skip_downstream_failure_lets_the_run_succeed() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(
            Node::connector("a", "echo", "echo").with_on_failure(FailurePolicy::SkipDownstream),
        );
        let b = graph.add_node(Node::connector("b", "echo", "echo"));
        let c = graph.add_node(Node::connector("c", "echo", "echo"));
        graph.add_edge(a, b, Edge::new()).expect("edge");
        let mut plan = ExecutionPlan::new(&graph);

        plan.take_ready(10);
        assert_eq!(plan.fail(a, FailurePolicy::SkipDownstream), vec![b]);
        plan.complete(c, None);

        assert!(plan.is_finished());
        assert_eq!(plan.outcome(), PlanOutcome::Succeeded);
    }

    #[test]
    fn join_runs_when_one_input_is_live() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(
            Node::connector("a", "echo", "echo").with_on_failure(FailurePolicy::SkipDownstream),
        );
        let b = graph.add_node(Node::connector("b", "echo", "echo"));
        let join = graph.add_node(Node::connector("join", "echo", "echo"));
        graph.add_edge(a, join, Edge::new()).expect("edge");
        graph.add_edge(b, join, Edge::new()).expect("edge");
        let mut plan = ExecutionPlan::new(&graph);

        plan.take_ready(10);
        plan.fail(a, FailurePolicy::SkipDownstream);
        assert!(plan.take_ready(10).is_empty(), "join waits for b");
        plan.complete(b, None);
        assert_eq!(plan.take_ready(10), vec![join]);
    }

    #[test]
    fn take_ready_respects_the_limit() {
        let mut graph = WorkflowGraph::new();
        for name in ["a", "b", "c"] {
            graph.add_node(Node::connector(name, "echo", "echo"));
        }
        let mut plan = ExecutionPlan::new(&graph);
        assert_eq!(plan.take_ready(2).len(), 2);
        assert_eq!(plan.running_count(), 2);
        assert_eq!(plan.take_ready(2).len(), 1);
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let mut graph = WorkflowGraph::new();
        let last = graph.add_node(Node::connector("last", "echo", "echo"));
        let first = graph.add_node(Node::connector("first", "echo", "echo"));
        graph.add_edge(first, last, Edge::new()).expect("edge");
        let mut plan = ExecutionPlan::new(&graph);

        assert_eq!(plan.take_ready(10), vec![first]);
        plan.fail(first, FailurePolicy::SkipDownstream);
        assert_eq!(plan.state(last), Some(NodeState::Skipped));
    }

    #[test]
    fn restored_tolerated_failure_skips_its_dependents() {
        let mut graph = WorkflowGraph::new();
        let a = graph.add_node(
            Node::connector("a", "echo", "echo").with_on_failure(FailurePolicy::SkipDownstream),
        );
        let b = graph.add_node(Node::connector("b", "echo", "echo"));
        let c = graph.add_node(Node::connector("c", "echo", "echo"));
        graph.add_edge(a, b, Edge::new()).expect("edge");
        let mut plan = ExecutionPlan::new(&graph);

        plan.restore_tolerated_failure(a);
        assert_eq!(plan.settle(), vec![b]);
        assert!(!plan.is_halted());
        assert_eq!(plan.take_ready(10), vec![c]);
    }

    #[test]
    fn restored_nodes_are_not_handed_out() {
        let d = branching();
        let mut plan = ExecutionPlan::new(&d.graph);
        plan.restore_succeeded(d.check, Some(Branch::False));
        plan.restore_skipped(d.yes);
        assert!(plan.settle().is_empty());

        assert_eq!(plan.take_ready(10), vec![d.no]);
        assert_eq!(plan.state(d.check), Some(NodeState::Succeeded(Some(Branch::False))));
    }
}
