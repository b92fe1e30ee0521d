//! Error types for the connector crate.
//!
//! - `InitError`: a connector instance could not be set up
//! - `ExecutionError`: an action failed, classified by `ExecutionErrorKind`
//! - `RegistryError`: lookup, registration and boundary validation failures

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors from `Connector::initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitError {
    /// A configuration value the connector requires was not resolved.
    MissingConfig { key: String },
    /// A dependency of the connector could not be reached.
    Unreachable { reason: String },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingConfig { key } => write!(f, "missing configuration: {key}"),
            Self::Unreachable { reason } => write!(f, "dependency unreachable: {reason}"),
        }
    }
}

impl std::error::Error for InitError {}

/// Classification of an action failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    InvalidInput,
    UnsupportedAction,
    UpstreamTimeout,
    UpstreamError,
}

impl ExecutionErrorKind {
    /// Whether a failure of this kind may succeed when attempted again.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::UpstreamTimeout | Self::UpstreamError)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::UnsupportedAction => "unsupported_action",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError => "upstream_error",
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from `Connector::execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    #[must_use]
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::InvalidInput, message)
    }

    #[must_use]
    pub fn unsupported_action(action_id: &str) -> Self {
        Self::new(
            ExecutionErrorKind::UnsupportedAction,
            format!("action '{action_id}' is not supported"),
        )
    }

    #[must_use]
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::UpstreamTimeout, message)
    }

    #[must_use]
    pub fn upstream_error(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::UpstreamError, message)
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Errors from the connector registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No factory is registered under this id.
    NotFound { connector_id: String },
    /// The connector's manifest does not declare the action.
    UnsupportedAction {
        connector_id: String,
        action_id: String,
    },
    /// A manifest schema could not be compiled.
    InvalidSchema {
        connector_id: String,
        action_id: String,
        reason: String,
    },
    /// Inputs were rejected by the action's input schema.
    InvalidInput {
        connector_id: String,
        action_id: String,
        violations: Vec<String>,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { connector_id } => write!(f, "connector not found: {connector_id}"),
            Self::UnsupportedAction {
                connector_id,
                action_id,
            } => write!(f, "connector '{connector_id}' has no action '{action_id}'"),
            Self::InvalidSchema {
                connector_id,
                action_id,
                reason,
            } => write!(
                f,
                "invalid schema for '{connector_id}.{action_id}': {reason}"
            ),
            Self::InvalidInput {
                connector_id,
                action_id,
                violations,
            } => write!(
                f,
                "invalid input for '{connector_id}.{action_id}': {}",
                violations.join("; ")
            ),
        }
    }
}

impl std::error::Error for RegistryError {}
