//! The connector contract.
//!
//! Every executable node in a workflow is backed by a connector. The engine
//! only ever talks to connectors through this trait, so HTTP clients, LLM
//! providers and memory stores all look the same to it.

use crate::error::{ExecutionError, InitError};
use crate::manifest::{ConnectorConfig, ConnectorManifest};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use serde_json::map::Map;

/// Named outputs produced by a successful action.
pub type OutputMap = Map<String, JsonValue>;

/// A pluggable integration.
///
/// Instances are created per step execution and never shared between steps,
/// since configuration may differ per node.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the static description of this connector. Must be pure.
    fn manifest(&self) -> ConnectorManifest;

    /// Prepares the instance. Called exactly once, before any `execute`.
    ///
    /// # Errors
    ///
    /// Returns an error when required configuration is missing or a
    /// dependency cannot be reached.
    async fn initialize(&mut self, config: &ConnectorConfig) -> Result<(), InitError>;

    /// Runs one action.
    ///
    /// # Errors
    ///
    /// Returns an `ExecutionError` whose kind tells the engine whether the
    /// failure is worth retrying.
    async fn execute(&self, action_id: &str, inputs: &JsonValue)
    -> Result<OutputMap, ExecutionError>;
}
