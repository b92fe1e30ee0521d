//! Executes a single attempt of a single node.
//!
//! An attempt never touches run state. It reports what happened and whether
//! trying again could help; the run driver records the result.

use crate::condition::{Condition, ConditionError};
use crate::edge::Branch;
use crate::execution::{ErrorClass, FailureDetail};
use crate::node::{Node, NodeKind};
use crate::resolver::ConfigResolver;
use crate::scope::Scope;
use flowgate_connector::{ConnectorRegistry, InitError, RegistryError};
use flowgate_core::WorkflowId;
use serde_json::Value as JsonValue;
use serde_json::json;
use serde_json::map::Map;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything an attempt needs, owned so it can run on its own task.
pub(crate) struct AttemptContext {
    pub(crate) registry: Arc<ConnectorRegistry>,
    pub(crate) resolver: Arc<dyn ConfigResolver>,
    pub(crate) workflow_id: WorkflowId,
    pub(crate) node: Node,
    pub(crate) trigger: Arc<JsonValue>,
    /// Outputs of finished nodes, keyed by node name.
    pub(crate) upstream: Map<String, JsonValue>,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Succeeded {
        input: Option<JsonValue>,
        output: JsonValue,
        branch: Option<Branch>,
    },
    Failed {
        input: Option<JsonValue>,
        detail: FailureDetail,
        retryable: bool,
    },
    /// Cancellation was observed before the connector was called.
    Cancelled,
}

impl AttemptOutcome {
    fn failed(input: Option<JsonValue>, detail: FailureDetail, retryable: bool) -> Self {
        Self::Failed {
            input,
            detail,
            retryable,
        }
    }
}

pub(crate) async fn execute_attempt(ctx: AttemptContext) -> AttemptOutcome {
    let scope = Scope::new(&ctx.trigger, &ctx.upstream);
    match &ctx.node.kind {
        NodeKind::Condition(condition) => evaluate_condition(condition, &scope),
        NodeKind::Connector {
            connector_id,
            action_id,
            parameters,
        } => {
            let inputs = match scope.resolve(parameters) {
                Ok(inputs) => inputs,
                Err(e) => {
                    return AttemptOutcome::failed(
                        None,
                        FailureDetail::new(ErrorClass::Internal, e.to_string()),
                        false,
                    );
                }
            };
            let outcome = call_connector(&ctx, connector_id, action_id, &inputs).await;
            match outcome {
                Ok(output) => AttemptOutcome::Succeeded {
                    input: Some(inputs),
                    output,
                    branch: None,
                },
                Err(Failure::Cancelled) => AttemptOutcome::Cancelled,
                Err(Failure::Failed { detail, retryable }) => {
                    AttemptOutcome::failed(Some(inputs), detail, retryable)
                }
            }
        }
    }
}

fn evaluate_condition(condition: &Condition, scope: &Scope<'_>) -> AttemptOutcome {
    let input = serde_json::to_value(condition).ok();
    match condition.evaluate(scope) {
        Ok(result) => {
            let branch = Branch::from_bool(result);
            AttemptOutcome::Succeeded {
                input,
                output: json!({ "result": result, "branch": branch.as_str() }),
                branch: Some(branch),
            }
        }
        Err(e @ ConditionError::MissingUpstream(_)) => AttemptOutcome::failed(
            input,
            FailureDetail::new(ErrorClass::Internal, e.to_string()),
            false,
        ),
        Err(e) => AttemptOutcome::failed(
            input,
            FailureDetail::new(ErrorClass::Validation, e.to_string()),
            false,
        ),
    }
}

enum Failure {
    Cancelled,
    Failed {
        detail: FailureDetail,
        retryable: bool,
    },
}

impl Failure {
    fn permanent(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Failed {
            detail: FailureDetail::new(class, message),
            retryable: false,
        }
    }
}

async fn call_connector(
    ctx: &AttemptContext,
    connector_id: &str,
    action_id: &str,
    inputs: &JsonValue,
) -> Result<JsonValue, Failure> {
    ctx.registry
        .validate_inputs(connector_id, action_id, inputs)
        .map_err(|report| registry_failure(report.current_context()))?;
    let mut connector = ctx
        .registry
        .instantiate(connector_id)
        .map_err(|report| registry_failure(report.current_context()))?;

    if ctx.cancel.is_cancelled() {
        return Err(Failure::Cancelled);
    }

    let config = ctx
        .resolver
        .resolve(ctx.workflow_id, connector_id)
        .await
        .map_err(|e| Failure::Failed {
            detail: FailureDetail::new(ErrorClass::ConnectorInit, e.to_string()),
            retryable: true,
        })?;
    connector
        .initialize(&config)
        .await
        .map_err(|e| Failure::Failed {
            retryable: matches!(e, InitError::Unreachable { .. }),
            detail: FailureDetail::new(ErrorClass::ConnectorInit, e.to_string()),
        })?;

    if ctx.cancel.is_cancelled() {
        return Err(Failure::Cancelled);
    }

    debug!(connector_id, action_id, "executing connector action");
    match connector.execute(action_id, inputs).await {
        Ok(output) => Ok(JsonValue::Object(output)),
        Err(e) => Err(Failure::Failed {
            retryable: e.is_transient(),
            detail: FailureDetail::new(ErrorClass::ConnectorExecution, e.message.clone())
                .with_kind(e.kind),
        }),
    }
}

fn registry_failure(e: &RegistryError) -> Failure {
    Failure::permanent(ErrorClass::Validation, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use crate::resolver::StaticConfigResolver;
    use flowgate_connector::{ExecutionError, ExecutionErrorKind, MockConnector};

    fn context(registry: ConnectorRegistry, node: Node, trigger: JsonValue) -> AttemptContext {
        AttemptContext {
            registry: Arc::new(registry),
            resolver: Arc::new(StaticConfigResolver::new()),
            workflow_id: WorkflowId::new(),
            node,
            trigger: Arc::new(trigger),
            upstream: Map::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn registry_with(mock: &MockConnector) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register(mock.factory()).expect("register");
        registry
    }

    #[tokio::test]
    async fn condition_emits_branch() {
        let node = Node::condition(
            "check",
            Condition::new(json!("$trigger.n"), Operator::GreaterThan, json!(3)),
        );
        let outcome = execute_attempt(context(ConnectorRegistry::new(), node, json!({"n": 5}))).await;
        match outcome {
            AttemptOutcome::Succeeded { output, branch, .. } => {
                assert_eq!(branch, Some(Branch::True));
                assert_eq!(output, json!({"result": true, "branch": "true"}));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connector_receives_resolved_parameters() {
        let mock = MockConnector::succeeding("crm", json!({"ok": true}));
        let node = Node::connector("lookup", "crm", "run")
            .with_parameters(json!({"email": "$trigger.user.email"}));
        let outcome =
            execute_attempt(context(registry_with(&mock), node, json!({"user": {"email": "a@b.c"}})))
                .await;

        assert!(matches!(outcome, AttemptOutcome::Succeeded { .. }));
        assert_eq!(mock.received_inputs(), vec![json!({"email": "a@b.c"})]);
    }

    #[tokio::test]
    async fn unknown_connector_is_a_permanent_validation_failure() {
        let node = Node::connector("x", "missing", "run");
        let outcome = execute_attempt(context(ConnectorRegistry::new(), node, json!({}))).await;
        match outcome {
            AttemptOutcome::Failed {
                detail, retryable, ..
            } => {
                assert_eq!(detail.class, ErrorClass::Validation);
                assert!(!retryable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retryable() {
        let mock = MockConnector::failing("crm", ExecutionError::upstream_timeout("slow"));
        let node = Node::connector("lookup", "crm", "run");
        let outcome = execute_attempt(context(registry_with(&mock), node, json!({}))).await;
        match outcome {
            AttemptOutcome::Failed {
                detail, retryable, ..
            } => {
                assert_eq!(detail.class, ErrorClass::ConnectorExecution);
                assert_eq!(detail.kind, Some(ExecutionErrorKind::UpstreamTimeout));
                assert!(retryable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_upstream_is_internal() {
        let mock = MockConnector::succeeding("crm", json!({}));
        let node = Node::connector("lookup", "crm", "run")
            .with_parameters(json!({"id": "$upstream.fetch.id"}));
        let outcome = execute_attempt(context(registry_with(&mock), node, json!({}))).await;
        match outcome {
            AttemptOutcome::Failed {
                detail, retryable, ..
            } => {
                assert_eq!(detail.class, ErrorClass::Internal);
                assert!(!retryable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(mock.executions(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_call() {
        let mock = MockConnector::succeeding("crm", json!({}));
        let node = Node::connector("lookup", "crm", "run");
        let ctx = context(registry_with(&mock), node, json!({}));
        ctx.cancel.cancel();

        assert_eq!(execute_attempt(ctx).await, AttemptOutcome::Cancelled);
        assert_eq!(mock.initializations(), 0);
        assert_eq!(mock.executions(), 0);
    }
}
