//! Run and step records and their state machines.
//!
//! Runs move `pending -> running -> {succeeded, failed, timed_out,
//! cancelled}`, or straight from `pending` to `cancelled`. Steps move
//! `pending -> running -> {succeeded, failed, skipped}`; a failed step may
//! go back to `running` while it has retry budget, and any unfinished step
//! may be `cancelled`. Terminal states are never left.

use crate::error::TransitionError;
use chrono::{DateTime, Utc};
use flowgate_connector::ExecutionErrorKind;
use flowgate_core::{
    CorrelationId, NodeId, RunId, StepId, TriggerId, WorkflowId, WorkflowVersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    /// Final once the run is terminal; otherwise a retry may follow.
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Skipped | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
            ),
            Self::Failed => matches!(next, Self::Running | Self::Cancelled),
            Self::Succeeded | Self::Skipped | Self::Cancelled => false,
        }
    }

    /// Whether the step will not move again once its run has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the step produced a result that a replay may reuse.
    #[must_use]
    pub fn is_reusable(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a replay re-executes everything or only part of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayType {
    Full,
    Partial,
}

/// Coarse classification of a failure, used in logs and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    ConnectorInit,
    ConnectorExecution,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ConnectorInit => "connector_init",
            Self::ConnectorExecution => "connector_execution",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run or step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub class: ErrorClass,
    /// Connector error kind, for connector execution failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExecutionErrorKind>,
    pub message: String,
}

impl FailureDetail {
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            kind: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ExecutionErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "[{}/{kind}] {}", self.class, self.message),
            None => write!(f, "[{}] {}", self.class, self.message),
        }
    }
}

/// One execution of one workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version_id: WorkflowVersionId,
    pub status: RunStatus,
    /// Snapshot of the trigger payload, kept for replay.
    pub saved_input_data: JsonValue,
    pub idempotency_key: Option<String>,
    pub trigger_id: Option<TriggerId>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<FailureDetail>,
    pub original_run_id: Option<RunId>,
    pub replay_type: Option<ReplayType>,
    pub replay_from_step_id: Option<StepId>,
}

impl Run {
    /// Creates a pending run.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        workflow_version_id: WorkflowVersionId,
        saved_input_data: JsonValue,
    ) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            workflow_version_id,
            status: RunStatus::Pending,
            saved_input_data,
            idempotency_key: None,
            trigger_id: None,
            correlation_id: CorrelationId::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            original_run_id: None,
            replay_type: None,
            replay_from_step_id: None,
        }
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger_id: Option<TriggerId>) -> Self {
        self.trigger_id = trigger_id;
        self
    }

    /// Creates a pending replay of `original`. The original is not touched.
    #[must_use]
    pub fn replay_of(original: &Run, from_step: Option<StepId>) -> Self {
        let mut run = Self::new(
            original.workflow_id,
            original.workflow_version_id,
            original.saved_input_data.clone(),
        );
        run.trigger_id = original.trigger_id;
        run.original_run_id = Some(original.id);
        run.replay_type = Some(if from_step.is_some() {
            ReplayType::Partial
        } else {
            ReplayType::Full
        });
        run.replay_from_step_id = from_step;
        run
    }

    /// Moves the run to `next`, stamping start and finish times.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::Run` for a move the state machine forbids.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Run {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

/// One node execution within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_name: String,
    /// `None` for condition nodes.
    pub connector_id: Option<String>,
    pub action_id: Option<String>,
    pub input: Option<JsonValue>,
    pub output: Option<JsonValue>,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub error: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Step of the original run whose result this replayed step reuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<StepId>,
}

impl Step {
    #[must_use]
    pub fn new(run_id: RunId, node: &crate::node::Node) -> Self {
        let (connector_id, action_id) = match node.connector_action() {
            Some((c, a)) => (Some(c.to_string()), Some(a.to_string())),
            None => (None, None),
        };
        Self {
            id: StepId::new(),
            run_id,
            node_id: node.id,
            node_name: node.name.clone(),
            connector_id,
            action_id,
            input: None,
            output: None,
            status: StepStatus::Pending,
            attempt_count: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            reused_from: None,
        }
    }

    /// Copies a finished step of another run into `run_id`.
    #[must_use]
    pub fn reuse(original: &Step, run_id: RunId) -> Self {
        Self {
            id: StepId::new(),
            run_id,
            attempt_count: 0,
            created_at: Utc::now(),
            reused_from: Some(original.id),
            ..original.clone()
        }
    }

    /// Moves the step to `next`.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::Step` for a move the state machine forbids.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Step {
                step_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            StepStatus::Running => {
                self.attempt_count += 1;
                self.started_at.get_or_insert(now);
                self.finished_at = None;
                self.error = None;
            }
            StepStatus::Pending => {}
            StepStatus::Succeeded
            | StepStatus::Failed
            | StepStatus::Skipped
            | StepStatus::Cancelled => {
                self.finished_at = Some(now);
            }
        }
        self.status = next;
        Ok(())
    }
}

/// A run together with its steps, as returned by the engine API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub run: Run,
    pub steps: Vec<Step>,
}

impl RunView {
    #[must_use]
    pub fn step_for(&self, node_id: NodeId) -> Option<&Step> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    #[must_use]
    pub fn step_named(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.node_name == name)
    }
}
