//! Workflow node types.
//!
//! A node either invokes a connector action or evaluates a condition that
//! picks one of two outgoing branches.

use crate::condition::Condition;
use crate::retry::RetryPolicy;
use flowgate_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What a failed node does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The run stops scheduling and ends `failed`.
    #[default]
    FailRun,
    /// Dependents reachable only through this node are skipped; the run
    /// carries on.
    SkipDownstream,
}

/// The work a node performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke one action of a registered connector.
    Connector {
        connector_id: String,
        action_id: String,
        /// Action inputs. String values of the form `$trigger.path` or
        /// `$upstream.<node>.path` are resolved before execution.
        #[serde(default = "empty_object")]
        parameters: JsonValue,
    },
    /// Evaluate a condition and emit `true` or `false`.
    Condition(Condition),
}

fn empty_object() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Unique within a graph; upstream outputs are addressed by this name.
    pub name: String,
    pub kind: NodeKind,
    /// Overrides the workflow's retry policy for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl Node {
    /// Creates a connector node with no parameters.
    #[must_use]
    pub fn connector(
        name: impl Into<String>,
        connector_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            kind: NodeKind::Connector {
                connector_id: connector_id.into(),
                action_id: action_id.into(),
                parameters: empty_object(),
            },
            retry: None,
            on_failure: FailurePolicy::default(),
        }
    }

    /// Creates a condition node.
    #[must_use]
    pub fn condition(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            kind: NodeKind::Condition(condition),
            retry: None,
            on_failure: FailurePolicy::default(),
        }
    }

    /// Sets the parameters of a connector node. No effect on condition nodes.
    #[must_use]
    pub fn with_parameters(mut self, value: JsonValue) -> Self {
        if let NodeKind::Connector { parameters, .. } = &mut self.kind {
            *parameters = value;
        }
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn with_on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    #[must_use]
    pub fn is_condition(&self) -> bool {
        matches!(self.kind, NodeKind::Condition(_))
    }

    /// Connector and action ids, for connector nodes.
    #[must_use]
    pub fn connector_action(&self) -> Option<(&str, &str)> {
        match &self.kind {
            NodeKind::Connector {
                connector_id,
                action_id,
                ..
            } => Some((connector_id, action_id)),
            NodeKind::Condition(_) => None,
        }
    }
}
