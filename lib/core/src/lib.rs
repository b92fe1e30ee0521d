//! Shared building blocks for the flowgate engine crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CorrelationId, NodeId, ParseIdError, RunId, StepId, TriggerId, WorkflowId, WorkflowVersionId,
};
