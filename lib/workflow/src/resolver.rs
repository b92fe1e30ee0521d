//! Connector configuration lookup.

use async_trait::async_trait;
use flowgate_connector::ConnectorConfig;
use flowgate_core::WorkflowId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, PoisonError};

/// Configuration for a connector could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Credentials are held somewhere that could not be reached.
    Unavailable { connector_id: String, message: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable {
                connector_id,
                message,
            } => write!(f, "configuration for {connector_id} unavailable: {message}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Produces the configuration a connector is initialized with.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(
        &self,
        workflow_id: WorkflowId,
        connector_id: &str,
    ) -> Result<ConnectorConfig, ResolveError>;
}

/// Fixed per-connector configuration with optional per-workflow overrides.
#[derive(Debug, Default)]
pub struct StaticConfigResolver {
    connectors: RwLock<HashMap<String, ConnectorConfig>>,
    overrides: RwLock<HashMap<(WorkflowId, String), ConnectorConfig>>,
}

impl StaticConfigResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base configuration of a connector.
    #[must_use]
    pub fn with_connector(self, connector_id: impl Into<String>, config: ConnectorConfig) -> Self {
        self.set_connector(connector_id, config);
        self
    }

    pub fn set_connector(&self, connector_id: impl Into<String>, config: ConnectorConfig) {
        self.connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connector_id.into(), config);
    }

    /// Entries here win over the base configuration for one workflow.
    pub fn set_override(
        &self,
        workflow_id: WorkflowId,
        connector_id: impl Into<String>,
        config: ConnectorConfig,
    ) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((workflow_id, connector_id.into()), config);
    }
}

#[async_trait]
impl ConfigResolver for StaticConfigResolver {
    async fn resolve(
        &self,
        workflow_id: WorkflowId,
        connector_id: &str,
    ) -> Result<ConnectorConfig, ResolveError> {
        let mut config = self
            .connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connector_id)
            .cloned()
            .unwrap_or_default();
        if let Some(extra) = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(workflow_id, connector_id.to_string()))
        {
            config.merge(extra);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_connector_resolves_empty() {
        let resolver = StaticConfigResolver::new();
        let config = resolver
            .resolve(WorkflowId::new(), "slack")
            .await
            .expect("resolve");
        assert_eq!(config, ConnectorConfig::new());
    }

    #[tokio::test]
    async fn workflow_override_wins() {
        let wf = WorkflowId::new();
        let resolver = StaticConfigResolver::new().with_connector(
            "slack",
            ConnectorConfig::new()
                .with("token", json!("base"))
                .with("channel", json!("#ops")),
        );
        resolver.set_override(wf, "slack", ConnectorConfig::new().with("token", json!("team")));

        let config = resolver.resolve(wf, "slack").await.expect("resolve");
        assert_eq!(config.get("token"), Some(&json!("team")));
        assert_eq!(config.get("channel"), Some(&json!("#ops")));

        let other = resolver
            .resolve(WorkflowId::new(), "slack")
            .await
            .expect("resolve");
        assert_eq!(other.get("token"), Some(&json!("base")));
    }
}
