//! Drives one admitted run from `pending` to a terminal state.
//!
//! The driver owns the run's admission token and releases it on every exit
//! path. Node attempts and retry timers are tasks in one `JoinSet`, so a
//! timeout aborts all of them at once and cancellation reaches retry timers
//! without waiting for their delay.

use crate::definition::WorkflowVersion;
use crate::edge::Branch;
use crate::engine::EngineInner;
use crate::execution::{ErrorClass, FailureDetail, Run, RunStatus, Step, StepStatus};
use crate::node::{FailurePolicy, Node};
use crate::observability::{Alert, EventLevel, RunEvent, TraceSpan};
use crate::plan::{ExecutionPlan, PlanOutcome};
use crate::retry::RetryPolicy;
use crate::step::{AttemptContext, AttemptOutcome, execute_attempt};
use flowgate_admission::AdmissionToken;
use flowgate_core::NodeId;
use serde_json::Value as JsonValue;
use serde_json::json;
use serde_json::map::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// What a task in the run's set reports back.
enum TaskResult {
    Attempt {
        node_id: NodeId,
        outcome: AttemptOutcome,
    },
    RetryDue {
        node_id: NodeId,
    },
    RetryCancelled {
        node_id: NodeId,
    },
}

/// Mutable bookkeeping for one run while it executes.
struct Progress {
    steps: HashMap<NodeId, Step>,
    /// Outputs by node name. Skipped nodes map to `null`.
    outputs: Map<String, JsonValue>,
    /// First permanent failure of a `fail_run` node.
    failure: Option<FailureDetail>,
    /// Set for internal errors: stop scheduling and fail the run.
    fatal: Option<FailureDetail>,
    cancelled: bool,
}

impl Progress {
    fn stopping(&self) -> bool {
        self.cancelled || self.fatal.is_some()
    }

    fn set_fatal(&mut self, detail: FailureDetail) {
        if self.fatal.is_none() {
            self.fatal = Some(detail);
        }
    }
}

pub(crate) struct RunDriver {
    inner: Arc<EngineInner>,
    version: Arc<WorkflowVersion>,
    run: Run,
    reused: Vec<Step>,
    token: Option<AdmissionToken>,
    cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
}

impl RunDriver {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        version: Arc<WorkflowVersion>,
        run: Run,
        reused: Vec<Step>,
        token: AdmissionToken,
        cancel: CancellationToken,
        status_tx: watch::Sender<RunStatus>,
    ) -> Self {
        Self {
            inner,
            version,
            run,
            reused,
            token: Some(token),
            cancel,
            status_tx,
        }
    }

    #[instrument(
        skip(self),
        fields(
            run_id = %self.run.id,
            workflow_id = %self.run.workflow_id,
            correlation_id = %self.run.correlation_id,
        )
    )]
    pub(crate) async fn drive(mut self) {
        let version = Arc::clone(&self.version);
        let mut plan = ExecutionPlan::new(&version.graph);
        let mut progress = Progress {
            steps: HashMap::new(),
            outputs: Map::new(),
            failure: None,
            fatal: None,
            cancelled: false,
        };

        if let Err(e) = self.run.transition(RunStatus::Running) {
            progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
        }
        self.persist_run(&mut progress).await;
        self.status_tx.send_replace(self.run.status);
        self.event(EventLevel::Info, "run started", None);

        self.restore_reused(&mut plan, &mut progress).await;

        let timeout = version
            .settings
            .timeout()
            .unwrap_or_else(|| self.inner.config.run_timeout());
        let deadline = Instant::now() + timeout;
        let step_limit = version
            .settings
            .step_concurrency
            .unwrap_or(self.inner.config.step_concurrency)
            .max(1);

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut timed_out = false;
        if self.cancel.is_cancelled() {
            info!("run cancelled before its first step");
            progress.cancelled = true;
        }

        loop {
            if !progress.stopping() {
                let capacity = step_limit.saturating_sub(plan.running_count());
                for node_id in plan.take_ready(capacity) {
                    self.start_attempt(node_id, &mut tasks, &mut progress).await;
                }
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = sleep_until(deadline) => {
                    tasks.abort_all();
                    timed_out = true;
                    break;
                }
                () = self.cancel.cancelled(), if !progress.cancelled => {
                    info!("run cancellation observed");
                    progress.cancelled = true;
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(TaskResult::Attempt { node_id, outcome }) => {
                        self.record_attempt(node_id, outcome, &mut plan, &mut tasks, &mut progress)
                            .await;
                    }
                    Ok(TaskResult::RetryDue { node_id }) => {
                        if progress.stopping() || plan.is_halted() {
                            self.cancel_step(node_id, &mut plan, &mut progress).await;
                        } else {
                            self.start_attempt(node_id, &mut tasks, &mut progress).await;
                        }
                    }
                    Ok(TaskResult::RetryCancelled { node_id }) => {
                        self.cancel_step(node_id, &mut plan, &mut progress).await;
                    }
                    Err(e) => {
                        error!(error_class = "internal", error = %e, "step task failed");
                        progress.set_fatal(FailureDetail::new(
                            ErrorClass::Internal,
                            format!("step task failed: {e}"),
                        ));
                    }
                }
            }
        }

        if !timed_out && !progress.stopping() && !plan.is_finished() {
            progress.set_fatal(FailureDetail::new(
                ErrorClass::Internal,
                "no runnable nodes left but the graph is unfinished",
            ));
        }

        self.finish(plan, progress, timed_out, timeout).await;
    }

    /// Copies reused steps from the original run and marks their nodes done.
    async fn restore_reused(&self, plan: &mut ExecutionPlan<'_>, progress: &mut Progress) {
        for original in &self.reused {
            let Some(node) = self.version.graph.get_node(original.node_id) else {
                continue;
            };
            let step = Step::reuse(original, self.run.id);
            match original.status {
                StepStatus::Succeeded => {
                    let branch = original
                        .output
                        .as_ref()
                        .and_then(|o| o.get("branch"))
                        .and_then(JsonValue::as_str)
                        .and_then(Branch::parse)
                        .filter(|_| node.is_condition());
                    plan.restore_succeeded(node.id, branch);
                    progress.outputs.insert(
                        node.name.clone(),
                        original.output.clone().unwrap_or(JsonValue::Null),
                    );
                }
                StepStatus::Skipped => {
                    plan.restore_skipped(node.id);
                    progress.outputs.insert(node.name.clone(), JsonValue::Null);
                }
                StepStatus::Failed if node.on_failure == FailurePolicy::SkipDownstream => {
                    plan.restore_tolerated_failure(node.id);
                }
                _ => continue,
            }
            self.persist_step(&step, progress).await;
            progress.steps.insert(node.id, step);
        }

        for node_id in plan.settle() {
            self.skip_node(node_id, progress).await;
        }
    }

    async fn start_attempt(
        &self,
        node_id: NodeId,
        tasks: &mut JoinSet<TaskResult>,
        progress: &mut Progress,
    ) {
        let Some(node) = self.version.graph.get_node(node_id) else {
            progress.set_fatal(FailureDetail::new(
                ErrorClass::Internal,
                format!("node {node_id} vanished from the graph"),
            ));
            return;
        };
        let step = progress
            .steps
            .entry(node_id)
            .or_insert_with(|| Step::new(self.run.id, node));
        if let Err(e) = step.transition(StepStatus::Running) {
            error!(error_class = "internal", error = %e, "illegal step transition");
            progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
            return;
        }
        let step = step.clone();
        self.persist_step(&step, progress).await;
        debug!(step_id = %step.id, node = %node.name, attempt = step.attempt_count, "step started");
        self.event(
            EventLevel::Debug,
            format!("step {} started (attempt {})", node.name, step.attempt_count),
            Some(&step),
        );

        let ctx = AttemptContext {
            registry: Arc::clone(&self.inner.registry),
            resolver: Arc::clone(&self.inner.resolver),
            workflow_id: self.run.workflow_id,
            node: node.clone(),
            trigger: Arc::new(self.run.saved_input_data.clone()),
            upstream: progress.outputs.clone(),
            cancel: self.cancel.clone(),
        };
        let span = info_span!("step", step_id = %step.id, node = %node.name, attempt = step.attempt_count);
        tasks.spawn(
            async move {
                TaskResult::Attempt {
                    node_id,
                    outcome: execute_attempt(ctx).await,
                }
            }
            .instrument(span),
        );
    }

    async fn record_attempt(
        &self,
        node_id: NodeId,
        outcome: AttemptOutcome,
        plan: &mut ExecutionPlan<'_>,
        tasks: &mut JoinSet<TaskResult>,
        progress: &mut Progress,
    ) {
        let Some(node) = self.version.graph.get_node(node_id) else {
            return;
        };
        let Some(mut step) = progress.steps.get(&node_id).cloned() else {
            return;
        };

        match outcome {
            AttemptOutcome::Succeeded {
                input,
                output,
                branch,
            } => {
                step.input = input;
                step.output = Some(output.clone());
                if let Err(e) = step.transition(StepStatus::Succeeded) {
                    progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
                }
                self.store_step(step, progress).await;
                progress.outputs.insert(node.name.clone(), output);
                for skipped in plan.complete(node_id, branch) {
                    self.skip_node(skipped, progress).await;
                }
            }
            AttemptOutcome::Failed {
                input,
                detail,
                retryable,
            } => {
                if input.is_some() {
                    step.input = input;
                }
                step.error = Some(detail.clone());
                if let Err(e) = step.transition(StepStatus::Failed) {
                    progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
                }
                let attempts = step.attempt_count;
                let step_id = step.id;
                self.store_step(step, progress).await;

                if detail.class == ErrorClass::Internal {
                    error!(%step_id, node = %node.name, error_class = "internal", error = %detail, "step failed");
                    plan.fail(node_id, FailurePolicy::FailRun);
                    progress.set_fatal(detail);
                    return;
                }

                let policy = self.retry_policy(node);
                if retryable
                    && !progress.stopping()
                    && !plan.is_halted()
                    && policy.allows_retry(attempts)
                {
                    let delay = policy.delay_for(attempts);
                    warn!(
                        %step_id,
                        node = %node.name,
                        attempt = attempts,
                        error_class = detail.class.as_str(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "step failed, retrying"
                    );
                    let cancel = self.cancel.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            () = sleep(delay) => TaskResult::RetryDue { node_id },
                            () = cancel.cancelled() => TaskResult::RetryCancelled { node_id },
                        }
                    });
                    return;
                }

                warn!(
                    %step_id,
                    node = %node.name,
                    attempt = attempts,
                    error_class = detail.class.as_str(),
                    error = %detail,
                    "step failed"
                );
                self.event_for_step(
                    EventLevel::Error,
                    format!("step {} failed: {detail}", node.name),
                    step_id,
                );
                if node.on_failure == FailurePolicy::FailRun && progress.failure.is_none() {
                    progress.failure = Some(detail);
                }
                for skipped in plan.fail(node_id, node.on_failure) {
                    self.skip_node(skipped, progress).await;
                }
            }
            AttemptOutcome::Cancelled => {
                self.cancel_step(node_id, plan, progress).await;
            }
        }
    }

    fn retry_policy(&self, node: &Node) -> RetryPolicy {
        node.retry
            .or(self.version.settings.retry)
            .unwrap_or(self.inner.config.retry)
    }

    async fn skip_node(&self, node_id: NodeId, progress: &mut Progress) {
        let Some(node) = self.version.graph.get_node(node_id) else {
            return;
        };
        let mut step = progress
            .steps
            .remove(&node_id)
            .unwrap_or_else(|| Step::new(self.run.id, node));
        if let Err(e) = step.transition(StepStatus::Skipped) {
            progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
        }
        debug!(step_id = %step.id, node = %node.name, "step skipped");
        progress.outputs.insert(node.name.clone(), JsonValue::Null);
        self.store_step(step, progress).await;
    }

    async fn cancel_step(
        &self,
        node_id: NodeId,
        plan: &mut ExecutionPlan<'_>,
        progress: &mut Progress,
    ) {
        plan.cancel(node_id);
        let Some(node) = self.version.graph.get_node(node_id) else {
            return;
        };
        let mut step = progress
            .steps
            .remove(&node_id)
            .unwrap_or_else(|| Step::new(self.run.id, node));
        if !step.status.is_terminal() || step.status == StepStatus::Failed {
            if let Err(e) = step.transition(StepStatus::Cancelled) {
                progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
            }
        }
        debug!(step_id = %step.id, node = %node.name, "step cancelled");
        self.store_step(step, progress).await;
    }

    async fn finish(
        mut self,
        mut plan: ExecutionPlan<'_>,
        mut progress: Progress,
        timed_out: bool,
        timeout: std::time::Duration,
    ) {
        for node_id in plan.unfinished() {
            self.cancel_step(node_id, &mut plan, &mut progress).await;
        }

        let (status, error) = if timed_out {
            (
                RunStatus::TimedOut,
                Some(FailureDetail::new(
                    ErrorClass::Timeout,
                    format!("run exceeded its {}s budget", timeout.as_secs()),
                )),
            )
        } else if progress.cancelled {
            (
                RunStatus::Cancelled,
                Some(FailureDetail::new(ErrorClass::Cancelled, "run cancelled")),
            )
        } else if let Some(fatal) = progress.fatal.take() {
            (RunStatus::Failed, Some(fatal))
        } else if plan.outcome() == PlanOutcome::Failed {
            let detail = progress.failure.take().unwrap_or_else(|| {
                FailureDetail::new(ErrorClass::Internal, "run failed without a recorded cause")
            });
            (RunStatus::Failed, Some(detail))
        } else {
            (RunStatus::Succeeded, None)
        };

        if let Err(e) = self.run.transition(status) {
            error!(error_class = "internal", error = %e, "illegal run transition");
        }
        self.run.error = error;
        if let Err(e) = self.inner.store.update_run(&self.run).await {
            error!(error_class = "internal", error = %e, "failed to persist finished run");
        }

        drop(self.token.take());
        self.inner.active().remove(&self.run.id);
        self.status_tx.send_replace(self.run.status);

        let level = match status {
            RunStatus::Succeeded => EventLevel::Info,
            RunStatus::Cancelled => EventLevel::Warn,
            _ => EventLevel::Error,
        };
        self.event(level, format!("run {status}"), None);
        self.inner.telemetry.trace(TraceSpan {
            run_id: self.run.id,
            trace_data: self.trace_data(&progress),
        });

        if matches!(status, RunStatus::Failed | RunStatus::TimedOut) {
            self.inner.telemetry.alert(&Alert {
                workflow_id: self.run.workflow_id,
                run_id: self.run.id,
                status,
                error: self.run.error.clone(),
                correlation_id: self.run.correlation_id,
            });
        }
        info!(status = %status, "run finished");
    }

    fn trace_data(&self, progress: &Progress) -> JsonValue {
        let mut steps: Vec<&Step> = progress.steps.values().collect();
        steps.sort_by_key(|s| s.created_at);
        json!({
            "workflow_id": self.run.workflow_id,
            "workflow_version_id": self.run.workflow_version_id,
            "status": self.run.status,
            "duration_ms": self.run.duration().map(|d| d.num_milliseconds()),
            "steps": steps
                .iter()
                .map(|s| json!({
                    "node": s.node_name,
                    "status": s.status,
                    "attempts": s.attempt_count,
                    "reused": s.reused_from.is_some(),
                }))
                .collect::<Vec<_>>(),
        })
    }

    /// Persists the step and keeps it as the latest known state.
    async fn store_step(&self, step: Step, progress: &mut Progress) {
        self.persist_step(&step, progress).await;
        progress.steps.insert(step.node_id, step);
    }

    async fn persist_step(&self, step: &Step, progress: &mut Progress) {
        if let Err(e) = self.inner.store.upsert_step(step).await {
            error!(step_id = %step.id, error_class = "internal", error = %e, "failed to persist step");
            progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
        }
    }

    async fn persist_run(&self, progress: &mut Progress) {
        if let Err(e) = self.inner.store.update_run(&self.run).await {
            error!(error_class = "internal", error = %e, "failed to persist run");
            progress.set_fatal(FailureDetail::new(ErrorClass::Internal, e.to_string()));
        }
    }

    fn event(&self, level: EventLevel, message: impl Into<String>, step: Option<&Step>) {
        let mut event = RunEvent::new(self.run.id, self.run.correlation_id, level, message);
        if let Some(step) = step {
            event = event.with_step(step.id).with_extra(json!({
                "node": step.node_name,
                "attempt": step.attempt_count,
            }));
        }
        self.inner.telemetry.emit(event);
    }

    fn event_for_step(&self, level: EventLevel, message: String, step_id: flowgate_core::StepId) {
        self.inner.telemetry.emit(
            RunEvent::new(self.run.id, self.run.correlation_id, level, message).with_step(step_id),
        );
    }
}
