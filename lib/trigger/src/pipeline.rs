//! The intake pipeline: turns deliveries into runs.
//!
//! Webhook checks run in a fixed order and stop at the first refusal: bot
//! filter, origin allow-list, authentication, idempotency, admission. Only
//! a delivery that passes all of them creates a run.

use crate::auth::authenticate;
use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::filter::{is_bot, origin_allowed};
use crate::idempotency::{KeySource, derive_key};
use crate::webhook::{
    IDEMPOTENCY_KEY_HEADER, ResponseMode, WebhookRequest, WebhookResponse, WebhookTrigger,
};
use chrono::{DateTime, Utc};
use flowgate_core::{Result, RunId, TriggerId, WorkflowVersionId};
use flowgate_workflow::{AdmissionMode, Engine, EngineError, RunHandle, RunRequest, RunView};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a webhook delivery was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Crawler traffic, acknowledged without a run.
    Ignored,
    /// A run was created and is still in progress.
    Accepted { run_id: RunId },
    /// A run was created and finished before the response was sent.
    Completed { view: Box<RunView> },
    /// The delivery matched an existing run.
    Duplicate { view: Box<RunView> },
}

/// Outcome plus the response to send.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReply {
    pub outcome: WebhookOutcome,
    pub response: WebhookResponse,
}

/// A schedule bound to one workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub id: TriggerId,
    pub version_id: WorkflowVersionId,
    /// Static data handed to every scheduled run.
    #[serde(default)]
    pub payload: JsonValue,
}

impl ScheduleTrigger {
    #[must_use]
    pub fn new(version_id: WorkflowVersionId) -> Self {
        Self {
            id: TriggerId::new(),
            version_id,
            payload: JsonValue::Null,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }
}

/// Front door of the engine for every kind of trigger.
#[derive(Debug, Clone)]
pub struct IntakePipeline {
    engine: Engine,
    config: IntakeConfig,
}

impl IntakePipeline {
    #[must_use]
    pub fn new(engine: Engine, config: IntakeConfig) -> Self {
        Self { engine, config }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Handles one webhook delivery.
    ///
    /// # Errors
    ///
    /// - `Authorization` when the origin is not on the allow-list
    /// - `Authentication` when credentials do not match
    /// - `Validation` for an unparseable JSON body or unusable workflow
    /// - `AdmissionRejected` when the workflow is at its limits
    ///
    /// [`error_response`] turns any of these into the matching reply.
    #[instrument(skip(self, trigger, request), fields(trigger_id = %trigger.id, version_id = %trigger.version_id))]
    pub async fn handle_webhook(
        &self,
        trigger: &WebhookTrigger,
        request: &WebhookRequest,
    ) -> Result<WebhookReply, IntakeError> {
        if trigger.filter_bots
            && let Some(agent) = request.header("user-agent")
            && is_bot(agent)
        {
            debug!(user_agent = agent, "ignoring crawler delivery");
            return Ok(WebhookReply {
                outcome: WebhookOutcome::Ignored,
                response: WebhookResponse::new(200, json!({"status": "ignored"})),
            });
        }

        if !origin_allowed(&trigger.ip_allow_list, request.remote_addr) {
            let origin = request
                .remote_addr
                .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
            warn!(%origin, "delivery from unlisted origin");
            return Err(IntakeError::Authorization {
                reason: format!("origin {origin} is not allowed"),
            }
            .into());
        }

        if let Err(e) = authenticate(&trigger.auth, request) {
            warn!(reason = %e, "delivery failed authentication");
            return Err(e.into());
        }

        let body = request.parsed_body().map_err(|e| {
            Report::new(IntakeError::validation(format!("body is not valid JSON: {e}")))
        })?;
        let source = match request.header(IDEMPOTENCY_KEY_HEADER) {
            Some(key) => KeySource::Explicit(key),
            None => KeySource::Payload(&body),
        };
        let key = derive_key(
            trigger.id,
            source,
            request.received_at,
            self.config.idempotency_window(),
        );

        let run_request = RunRequest::new(trigger.version_id, request.snapshot(body))
            .with_idempotency_key(key)
            .with_trigger(trigger.id)
            .with_mode(AdmissionMode::Reject);
        let handle = self
            .engine
            .create_run_with(run_request)
            .await
            .map_err(into_intake)?;

        if handle.is_duplicate() {
            let view = self.view(handle.run_id()).await?;
            info!(run_id = %handle.run_id(), "duplicate delivery");
            let response = WebhookResponse::new(200, run_body(&view));
            return Ok(WebhookReply {
                outcome: WebhookOutcome::Duplicate {
                    view: Box::new(view),
                },
                response: response.customized(&trigger.response),
            });
        }

        info!(run_id = %handle.run_id(), "run created from webhook");
        let reply = match trigger.response_mode {
            ResponseMode::Immediate => accepted(&handle),
            ResponseMode::Synchronous { timeout_seconds } => {
                let timeout =
                    timeout_seconds.map_or_else(|| self.config.sync_timeout(), Duration::from_secs);
                match handle.wait(timeout).await {
                    Some(_) => {
                        let view = self.view(handle.run_id()).await?;
                        WebhookReply {
                            response: WebhookResponse::new(200, run_body(&view)),
                            outcome: WebhookOutcome::Completed {
                                view: Box::new(view),
                            },
                        }
                    }
                    None => accepted(&handle),
                }
            }
        };
        Ok(WebhookReply {
            response: reply.response.customized(&trigger.response),
            ..reply
        })
    }

    /// Starts the run for one schedule firing. Ticks for the same instant
    /// map to one run; a workflow at its limits keeps the run queued.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unusable workflow version, `Internal`
    /// for persistence failures.
    #[instrument(skip(self, trigger), fields(trigger_id = %trigger.id, %scheduled_for))]
    pub async fn handle_schedule_tick(
        &self,
        trigger: &ScheduleTrigger,
        scheduled_for: DateTime<Utc>,
    ) -> Result<RunHandle, IntakeError> {
        let instant = scheduled_for.to_rfc3339();
        let key = derive_key(
            trigger.id,
            KeySource::Explicit(&instant),
            scheduled_for,
            self.config.idempotency_window(),
        );
        let payload = json!({
            "scheduled_for": instant,
            "data": trigger.payload,
        });
        let request = RunRequest::new(trigger.version_id, payload)
            .with_idempotency_key(key)
            .with_trigger(trigger.id)
            .with_mode(AdmissionMode::Queue);
        let handle = self
            .engine
            .create_run_with(request)
            .await
            .map_err(into_intake)?;
        debug!(run_id = %handle.run_id(), duplicate = handle.is_duplicate(), "schedule tick handled");
        Ok(handle)
    }

    /// Starts a run on request. Refused outright when the workflow is at
    /// its limits.
    ///
    /// # Errors
    ///
    /// Returns `Validation` or `AdmissionRejected`.
    #[instrument(skip(self, payload), fields(version_id = %version_id))]
    pub async fn handle_manual(
        &self,
        version_id: WorkflowVersionId,
        payload: JsonValue,
    ) -> Result<RunHandle, IntakeError> {
        let request = RunRequest::new(version_id, payload).with_mode(AdmissionMode::Reject);
        self.engine
            .create_run_with(request)
            .await
            .map_err(into_intake)
    }

    async fn view(&self, run_id: RunId) -> Result<RunView, IntakeError> {
        self.engine.get_run(run_id).await.map_err(into_intake)
    }
}

/// The reply for a refused delivery.
#[must_use]
pub fn error_response(err: &IntakeError) -> WebhookResponse {
    let response = WebhookResponse::new(err.status_code(), json!({"error": err.to_string()}));
    match err.retry_after_secs() {
        Some(secs) => response.with_header("Retry-After", secs.to_string()),
        None => response,
    }
}

fn accepted(handle: &RunHandle) -> WebhookReply {
    WebhookReply {
        outcome: WebhookOutcome::Accepted {
            run_id: handle.run_id(),
        },
        response: WebhookResponse::new(
            202,
            json!({"run_id": handle.run_id(), "status": handle.status()}),
        ),
    }
}

fn run_body(view: &RunView) -> JsonValue {
    serde_json::to_value(view).unwrap_or_else(|_| json!({"run_id": view.run.id}))
}

fn into_intake(report: Report<EngineError>) -> Report<IntakeError> {
    let intake = IntakeError::from_engine(report.current_context());
    report.context(intake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_retry_after() {
        let response = error_response(&IntakeError::AdmissionRejected {
            retry_after: Some(Duration::from_secs(12)),
        });
        assert_eq!(response.status, 429);
        assert_eq!(response.headers.get("Retry-After").map(String::as_str), Some("12"));
    }

    #[test]
    fn authorization_errors_are_forbidden() {
        let response = error_response(&IntakeError::Authorization {
            reason: "origin 127.0.0.1 is not allowed".to_string(),
        });
        assert_eq!(response.status, 403);
        assert!(response.headers.is_empty());
    }
}
