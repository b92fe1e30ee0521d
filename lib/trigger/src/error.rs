//! Error types for trigger intake.
//!
//! Each variant maps to the HTTP status a webhook caller receives. Engine
//! reports are wrapped with an `IntakeError` context so the original
//! `EngineError` stays visible in the report chain.

use flowgate_workflow::EngineError;
use std::fmt;
use std::time::Duration;

/// Why an intake request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// The delivery or its target can never produce a run as given.
    Validation { reason: String },
    /// Signature, basic auth or header secret did not match.
    Authentication { reason: String },
    /// The origin address is not allowed.
    Authorization { reason: String },
    /// Admission refused the run; retry later.
    AdmissionRejected { retry_after: Option<Duration> },
    Internal { reason: String },
}

impl IntakeError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// HTTP status for a webhook response.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication { .. } => 401,
            Self::Authorization { .. } => 403,
            Self::AdmissionRejected { .. } => 429,
            Self::Internal { .. } => 500,
        }
    }

    /// Seconds for a `Retry-After` header, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::AdmissionRejected {
                retry_after: Some(after),
            } => {
                let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
            _ => None,
        }
    }

    /// The intake error corresponding to an engine failure.
    #[must_use]
    pub fn from_engine(err: &EngineError) -> Self {
        match err {
            EngineError::AdmissionRejected { retry_after } => Self::AdmissionRejected {
                retry_after: *retry_after,
            },
            EngineError::Validation { .. } | EngineError::WorkflowVersionNotFound { .. } => {
                Self::validation(err.to_string())
            }
            EngineError::RunNotFound { .. }
            | EngineError::InvalidState { .. }
            | EngineError::Store
            | EngineError::Internal { .. } => Self::Internal {
                reason: err.to_string(),
            },
        }
    }
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "invalid trigger delivery: {reason}"),
            Self::Authentication { reason } => write!(f, "authentication failed: {reason}"),
            Self::Authorization { reason } => write!(f, "not authorized: {reason}"),
            Self::AdmissionRejected { .. } => write!(f, "too many runs, retry later"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for IntakeError {}
