//! Error types for admission control.

use flowgate_core::WorkflowId;
use std::fmt;
use std::time::Duration;

/// A run was refused by one of the admission gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The workflow's rate window is exhausted.
    RateLimited {
        workflow_id: WorkflowId,
        retry_after: Duration,
    },
    /// The workflow already has `limit` runs in flight.
    ConcurrencyLimitReached { workflow_id: WorkflowId, limit: u32 },
}

impl AdmissionError {
    /// How long the caller should wait before trying again, if known.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::ConcurrencyLimitReached { .. } => None,
        }
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            Self::RateLimited { workflow_id, .. }
            | Self::ConcurrencyLimitReached { workflow_id, .. } => *workflow_id,
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited {
                workflow_id,
                retry_after,
            } => write!(
                f,
                "rate limit exceeded for {workflow_id}, retry after {}s",
                retry_after.as_secs().max(1)
            ),
            Self::ConcurrencyLimitReached { workflow_id, limit } => {
                write!(f, "concurrency limit of {limit} reached for {workflow_id}")
            }
        }
    }
}

impl std::error::Error for AdmissionError {}
