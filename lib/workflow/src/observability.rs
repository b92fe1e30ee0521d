//! Run events, trace spans and alerts.
//!
//! The engine reports through two collaborators. An [`ObservabilitySink`]
//! receives every run and step event plus one trace span per finished run.
//! An [`AlertNotifier`] is told about failed and timed-out runs, throttled
//! per workflow by [`AlertDispatcher`]. Both are fire and forget: errors are
//! logged and never affect the run.

use crate::execution::{FailureDetail, RunStatus};
use chrono::{DateTime, Utc};
use flowgate_core::{CorrelationId, RunId, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Something that happened to a run or one of its steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub level: EventLevel,
    pub message: String,
    pub correlation_id: CorrelationId,
    pub extra: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    #[must_use]
    pub fn new(
        run_id: RunId,
        correlation_id: CorrelationId,
        level: EventLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            step_id: None,
            level,
            message: message.into(),
            correlation_id,
            extra: JsonValue::Null,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, extra: JsonValue) -> Self {
        self.extra = extra;
        self
    }
}

/// Summary of a finished run for tracing backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub run_id: RunId,
    pub trace_data: JsonValue,
}

/// A sink refused an event or span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub message: String,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observability sink error: {}", self.message)
    }
}

impl std::error::Error for SinkError {}

/// Receives run events and trace spans.
pub trait ObservabilitySink: Send + Sync {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError>;

    fn trace(&self, span: TraceSpan) -> Result<(), SinkError>;
}

/// Writes events through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        let RunEvent {
            run_id,
            step_id,
            level,
            message,
            correlation_id,
            ..
        } = event;
        match level {
            EventLevel::Debug => {
                debug!(run_id = %run_id, correlation_id = %correlation_id, ?step_id, "{message}");
            }
            EventLevel::Info => {
                info!(run_id = %run_id, correlation_id = %correlation_id, ?step_id, "{message}");
            }
            EventLevel::Warn => {
                warn!(run_id = %run_id, correlation_id = %correlation_id, ?step_id, "{message}");
            }
            EventLevel::Error => {
                error!(run_id = %run_id, correlation_id = %correlation_id, ?step_id, "{message}");
            }
        }
        Ok(())
    }

    fn trace(&self, span: TraceSpan) -> Result<(), SinkError> {
        debug!(run_id = %span.run_id, trace = %span.trace_data, "run trace");
        Ok(())
    }
}

/// Keeps everything it receives. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RunEvent>>>,
    spans: Arc<Mutex<Vec<TraceSpan>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn events_for(&self, run_id: RunId) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect()
    }

    #[must_use]
    pub fn spans(&self) -> Vec<TraceSpan> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ObservabilitySink for MemorySink {
    fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }

    fn trace(&self, span: TraceSpan) -> Result<(), SinkError> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span);
        Ok(())
    }
}

/// A run ended badly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub error: Option<FailureDetail>,
    pub correlation_id: CorrelationId,
}

/// Delivers alerts to people or paging systems.
pub trait AlertNotifier: Send + Sync {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Logs alerts at `error` level.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError> {
        error!(
            workflow_id = %alert.workflow_id,
            run_id = %alert.run_id,
            status = %alert.status,
            error = ?alert.error,
            "run alert"
        );
        Ok(())
    }
}

/// Records alerts. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertNotifier for MemoryNotifier {
    fn notify(&self, alert: &Alert) -> Result<(), SinkError> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

/// Sends at most one alert per workflow per throttle window.
pub struct AlertDispatcher {
    notifier: Arc<dyn AlertNotifier>,
    throttle: Duration,
    last_sent: Mutex<HashMap<WorkflowId, Instant>>,
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(notifier: Arc<dyn AlertNotifier>, throttle: Duration) -> Self {
        Self {
            notifier,
            throttle,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Forwards the alert unless one was sent for the same workflow within
    /// the throttle window. Returns whether it was forwarded.
    pub fn dispatch(&self, alert: &Alert) -> bool {
        let now = Instant::now();
        {
            let mut last_sent = self
                .last_sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = last_sent.get(&alert.workflow_id)
                && now.duration_since(*previous) < self.throttle
            {
                debug!(workflow_id = %alert.workflow_id, "alert throttled");
                return false;
            }
            last_sent.insert(alert.workflow_id, now);
        }
        if let Err(e) = self.notifier.notify(alert) {
            warn!(workflow_id = %alert.workflow_id, error = %e, "alert delivery failed");
        }
        true
    }
}

/// The engine's handle on both collaborators.
#[derive(Clone)]
pub(crate) struct Telemetry {
    sink: Arc<dyn ObservabilitySink>,
    alerts: Arc<AlertDispatcher>,
}

impl Telemetry {
    pub(crate) fn new(sink: Arc<dyn ObservabilitySink>, alerts: Arc<AlertDispatcher>) -> Self {
        Self { sink, alerts }
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        if let Err(e) = self.sink.emit(event) {
            warn!(error = %e, "dropping run event");
        }
    }

    pub(crate) fn trace(&self, span: TraceSpan) {
        if let Err(e) = self.sink.trace(span) {
            warn!(error = %e, "dropping trace span");
        }
    }

    pub(crate) fn alert(&self, alert: &Alert) {
        self.alerts.dispatch(alert);
    }
}
