//! Workflow definition types.
//!
//! A workflow version is an immutable snapshot of a workflow:
//! - Identity (workflow id, version id, version number)
//! - A directed graph of nodes
//! - Execution settings that override engine defaults

use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use flowgate_admission::RateLimitPolicy;
use flowgate_core::{WorkflowId, WorkflowVersionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-workflow execution settings. Unset fields fall back to engine and
/// admission defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Maximum steps of one run executing at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_concurrency: Option<usize>,
    /// Maximum runs of this workflow executing at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Default retry policy for nodes without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl WorkflowSettings {
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// An immutable, executable version of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: WorkflowVersionId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    /// Creates version 1 of a new workflow.
    #[must_use]
    pub fn new(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            id: WorkflowVersionId::new(),
            workflow_id: WorkflowId::new(),
            name: name.into(),
            version: 1,
            graph,
            settings: WorkflowSettings::default(),
            created_at: Utc::now(),
        }
    }

    /// Creates the version after this one, sharing the workflow id.
    #[must_use]
    pub fn next_version(&self, graph: WorkflowGraph) -> Self {
        Self {
            id: WorkflowVersionId::new(),
            workflow_id: self.workflow_id,
            name: self.name.clone(),
            version: self.version + 1,
            graph,
            settings: self.settings.clone(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_workflow_id(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validates the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow graph is invalid.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.graph.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use serde_json::json;

    #[test]
    fn next_version_keeps_workflow_identity() {
        let v1 = WorkflowVersion::new("Orders", WorkflowGraph::new());
        let v2 = v1.next_version(WorkflowGraph::new());

        assert_eq!(v2.workflow_id, v1.workflow_id);
        assert_ne!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn settings_default_to_unset() {
        let settings: WorkflowSettings = serde_json::from_value(json!({})).expect("parse");
        assert_eq!(settings, WorkflowSettings::default());
        assert_eq!(settings.timeout(), None);
    }

    #[test]
    fn version_deserializes_with_graph() {
        let mut graph = WorkflowGraph::new();
        graph.add_node(Node::connector("send", "echo", "echo"));
        let version = WorkflowVersion::new("Notify", graph).with_settings(WorkflowSettings {
            timeout_seconds: Some(30),
            ..WorkflowSettings::default()
        });

        let json = serde_json::to_string(&version).expect("serialize");
        let parsed: WorkflowVersion = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.id, version.id);
        assert_eq!(parsed.graph.node_count(), 1);
        assert!(parsed.graph.node_named("send").is_some());
        assert_eq!(parsed.settings.timeout(), Some(Duration::from_secs(30)));
    }
}
