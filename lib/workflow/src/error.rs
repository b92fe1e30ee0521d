//! Error types for the workflow crate.
//!
//! Errors are layered with rootcause:
//! - `GraphError`: building or validating a workflow graph
//! - `TransitionError`: a run or step was asked to make an illegal move
//! - `StoreError`: persistence collaborators
//! - `EngineError`: what callers of the engine API see

use crate::execution::{RunStatus, StepStatus};
use flowgate_core::{NodeId, RunId, StepId, WorkflowVersionId};
use std::fmt;
use std::time::Duration;

/// Errors from graph operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    NodeNotFound { node_id: NodeId },
    /// Two nodes share a name.
    DuplicateNodeName { name: String },
    /// A branch label on an edge whose source is not a condition node.
    UnexpectedBranch { source: NodeId },
    /// An edge leaving a condition node has no branch label.
    MissingBranch { source: NodeId },
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNodeName { name } => write!(f, "duplicate node name: {name}"),
            Self::UnexpectedBranch { source } => {
                write!(f, "edge from non-condition node {source} carries a branch label")
            }
            Self::MissingBranch { source } => {
                write!(f, "edge from condition node {source} has no branch label")
            }
            Self::CycleDetected => write!(f, "graph contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// An illegal state machine move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    Run {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    Step {
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run { run_id, from, to } => {
                write!(f, "run {run_id} cannot move from {from} to {to}")
            }
            Self::Step { step_id, from, to } => {
                write!(f, "step {step_id} cannot move from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// Errors from persistence collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    Unavailable { message: String },
    /// A record with the same id already exists.
    Conflict { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "store unavailable: {message}"),
            Self::Conflict { message } => write!(f, "store conflict: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by the engine API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request can never succeed as given.
    Validation { reason: String },
    WorkflowVersionNotFound { version_id: WorkflowVersionId },
    RunNotFound { run_id: RunId },
    /// The run is not in a state that allows the operation.
    InvalidState { run_id: RunId, status: RunStatus },
    /// Admission refused the run; try again later.
    AdmissionRejected { retry_after: Option<Duration> },
    /// Persistence failed.
    Store,
    /// A state machine invariant was violated.
    Internal { reason: String },
}

impl EngineError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "validation failed: {reason}"),
            Self::WorkflowVersionNotFound { version_id } => {
                write!(f, "workflow version not found: {version_id}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::InvalidState { run_id, status } => {
                write!(f, "run {run_id} is {status}")
            }
            Self::AdmissionRejected { retry_after } => match retry_after {
                Some(after) => write!(
                    f,
                    "admission rejected, retry after {}s",
                    after.as_secs().max(1)
                ),
                None => write!(f, "admission rejected, retry later"),
            },
            Self::Store => write!(f, "run store operation failed"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
