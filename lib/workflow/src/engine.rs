//! The engine API: create, inspect, cancel and replay runs.
//!
//! Every new run passes through admission. Admitted runs are handed to a
//! [`RunDriver`](crate::runner::RunDriver) on their own task. Runs refused
//! on the queueing path are stored `pending` and offered to admission again
//! by [`Engine::retry_pending`], oldest first.

use crate::config::EngineConfig;
use crate::definition::WorkflowVersion;
use crate::error::{EngineError, StoreError};
use crate::execution::{Run, RunStatus, RunView, Step, StepStatus};
use crate::node::FailurePolicy;
use crate::locks::KeyedLocks;
use crate::observability::{
    AlertDispatcher, AlertNotifier, EventLevel, LogNotifier, ObservabilitySink, RunEvent,
    Telemetry, TracingSink,
};
use crate::resolver::{ConfigResolver, StaticConfigResolver};
use crate::runner::RunDriver;
use crate::store::{InMemoryRunStore, RunStore, WorkflowRepository};
use flowgate_admission::{AdmissionConfig, AdmissionController, AdmissionToken};
use flowgate_connector::ConnectorRegistry;
use flowgate_core::{Result, RunId, StepId, TriggerId, WorkflowId, WorkflowVersionId};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What happens when admission refuses a new run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Fail with `EngineError::AdmissionRejected`; no run is created.
    #[default]
    Reject,
    /// Store the run `pending` and queue it for re-admission.
    Queue,
}

/// A request to start a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub version_id: WorkflowVersionId,
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    pub trigger_id: Option<TriggerId>,
    pub mode: AdmissionMode,
}

impl RunRequest {
    #[must_use]
    pub fn new(version_id: WorkflowVersionId, payload: JsonValue) -> Self {
        Self {
            version_id,
            payload,
            idempotency_key: None,
            trigger_id: None,
            mode: AdmissionMode::default(),
        }
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger_id: TriggerId) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Observes one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    duplicate: bool,
    status: watch::Receiver<RunStatus>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Whether the request matched an existing run by idempotency key.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Waits until the run is terminal. Returns `None` on timeout.
    pub async fn wait(&self, timeout: Duration) -> Option<RunStatus> {
        let mut status = self.status.clone();
        match tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal())).await {
            Ok(Ok(terminal)) => Some(*terminal),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

pub(crate) struct ActiveRun {
    pub(crate) cancel: CancellationToken,
    pub(crate) status: watch::Receiver<RunStatus>,
}

struct PendingRun {
    run: Run,
    version: Arc<WorkflowVersion>,
    reused: Vec<Step>,
    status_tx: watch::Sender<RunStatus>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<ConnectorRegistry>,
    pub(crate) resolver: Arc<dyn ConfigResolver>,
    pub(crate) repository: Arc<dyn WorkflowRepository>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) admission: AdmissionController,
    pub(crate) telemetry: Telemetry,
    active: Mutex<HashMap<RunId, ActiveRun>>,
    pending: Mutex<VecDeque<PendingRun>>,
    idempotency_locks: KeyedLocks,
}

impl EngineInner {
    pub(crate) fn active(&self) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingRun>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Arc<ConnectorRegistry>,
    repository: Arc<dyn WorkflowRepository>,
    store: Arc<dyn RunStore>,
    resolver: Arc<dyn ConfigResolver>,
    admission: Option<AdmissionController>,
    sink: Arc<dyn ObservabilitySink>,
    notifier: Arc<dyn AlertNotifier>,
}

impl EngineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConfigResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionController) -> Self {
        self.admission = Some(admission);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let alerts = Arc::new(AlertDispatcher::new(
            self.notifier,
            self.config.alert_throttle(),
        ));
        let admission = self
            .admission
            .unwrap_or_else(|| AdmissionController::new(&AdmissionConfig::default()));
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry: self.registry,
                resolver: self.resolver,
                repository: self.repository,
                store: self.store,
                admission,
                telemetry: Telemetry::new(self.sink, alerts),
                active: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                idempotency_locks: KeyedLocks::default(),
            }),
        }
    }
}

/// The workflow execution engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("active_runs", &self.active_count())
            .field("pending_runs", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine. Everything not set on the builder gets an
    /// in-process default.
    #[must_use]
    pub fn builder(
        registry: Arc<ConnectorRegistry>,
        repository: Arc<dyn WorkflowRepository>,
    ) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            registry,
            repository,
            store: Arc::new(InMemoryRunStore::new()),
            resolver: Arc::new(StaticConfigResolver::new()),
            admission: None,
            sink: Arc::new(TracingSink),
            notifier: Arc::new(LogNotifier),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Runs currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Runs waiting for re-admission.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Creates a run, refusing it outright if admission says no.
    ///
    /// # Errors
    ///
    /// See [`Engine::create_run_with`].
    pub async fn create_run(
        &self,
        version_id: WorkflowVersionId,
        payload: JsonValue,
        idempotency_key: Option<String>,
    ) -> Result<RunHandle, EngineError> {
        let mut request = RunRequest::new(version_id, payload);
        request.idempotency_key = idempotency_key;
        self.create_run_with(request).await
    }

    /// Creates a run.
    ///
    /// When the request carries an idempotency key and a run with that key
    /// is still in progress or has succeeded, a handle to that run is
    /// returned instead and nothing new is created.
    ///
    /// # Errors
    ///
    /// - `WorkflowVersionNotFound` for an unknown version
    /// - `Validation` when the version's graph is invalid
    /// - `AdmissionRejected` when admission refuses in `Reject` mode
    /// - `Store` when persistence fails
    #[instrument(skip(self, request), fields(version_id = %request.version_id, mode = ?request.mode))]
    pub async fn create_run_with(&self, request: RunRequest) -> Result<RunHandle, EngineError> {
        let version = self.load_version(request.version_id).await?;

        let _key_guard = match &request.idempotency_key {
            Some(key) => Some(self.inner.idempotency_locks.lock(key).await),
            None => None,
        };
        if let Some(key) = &request.idempotency_key
            && let Some(existing) = self
                .inner
                .store
                .find_by_idempotency_key(key)
                .await
                .map_err(store_failure)?
            && (!existing.status.is_terminal() || existing.status == RunStatus::Succeeded)
        {
            debug!(run_id = %existing.id, status = %existing.status, "duplicate delivery");
            return Ok(self.handle_for(&existing, true));
        }

        let run = Run::new(version.workflow_id, version.id, request.payload)
            .with_idempotency_key(request.idempotency_key)
            .with_trigger(request.trigger_id);
        self.launch(version, run, Vec::new(), request.mode).await
    }

    /// Loads a run and its steps.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Store`.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunView, EngineError> {
        let run = self
            .inner
            .store
            .get_run(run_id)
            .await
            .map_err(store_failure)?
            .ok_or(EngineError::RunNotFound { run_id })?;
        let steps = self
            .inner
            .store
            .steps_for_run(run_id)
            .await
            .map_err(store_failure)?;
        Ok(RunView { run, steps })
    }

    /// The most recent run created with `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Store` when persistence fails.
    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RunView>, EngineError> {
        let found = self
            .inner
            .store
            .find_by_idempotency_key(key)
            .await
            .map_err(store_failure)?;
        match found {
            Some(run) => self.get_run(run.id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Cancels a pending or running run.
    ///
    /// A pending run becomes `cancelled` immediately. A running run is
    /// signalled; in-flight steps stop at their next suspension point and
    /// the driver finishes the run as `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound`, or `InvalidState` if the run already finished.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let run = self
            .inner
            .store
            .get_run(run_id)
            .await
            .map_err(store_failure)?
            .ok_or(EngineError::RunNotFound { run_id })?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidState {
                run_id,
                status: run.status,
            }
            .into());
        }

        let queued = {
            let mut pending = self.inner.pending();
            match pending.iter().position(|p| p.run.id == run_id) {
                Some(index) => pending.remove(index),
                None => {
                    if let Some(active) = self.inner.active().get(&run_id) {
                        active.cancel.cancel();
                        info!("cancellation requested");
                        return Ok(());
                    }
                    None
                }
            }
        };

        let Some(queued) = queued else {
            return Err(EngineError::InvalidState {
                run_id,
                status: run.status,
            }
            .into());
        };
        self.cancel_queued(queued.run, &queued.status_tx).await
    }

    /// Creates a new run from a finished one.
    ///
    /// Without `from_step_id` the whole graph runs again on the saved
    /// payload. With it, that step's node and everything downstream of it
    /// run again; every other node that succeeded, was skipped, or failed
    /// under `skip_downstream` in the original keeps its recorded result.
    /// The original run is never modified.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` for an unknown run
    /// - `Validation` if the run is not finished, or the step is not a
    ///   finished step of that run
    /// - `AdmissionRejected` when admission refuses
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn replay_run(
        &self,
        run_id: RunId,
        from_step_id: Option<StepId>,
    ) -> Result<RunHandle, EngineError> {
        let original = self.get_run(run_id).await?;
        if !original.run.status.is_terminal() {
            return Err(EngineError::validation(format!(
                "run {run_id} is {} and cannot be replayed until it finishes",
                original.run.status
            ))
            .into());
        }
        let version = self.load_version(original.run.workflow_version_id).await?;

        let reused = match from_step_id {
            None => Vec::new(),
            Some(step_id) => {
                let from = original
                    .steps
                    .iter()
                    .find(|s| s.id == step_id)
                    .ok_or_else(|| {
                        EngineError::validation(format!("step {step_id} is not part of run {run_id}"))
                    })?;
                if !from.status.is_terminal() {
                    return Err(EngineError::validation(format!(
                        "step {step_id} is {} and cannot be replayed from",
                        from.status
                    ))
                    .into());
                }
                let rerun = version.graph.downstream_closure(from.node_id);
                original
                    .steps
                    .iter()
                    .filter(|s| !rerun.contains(&s.node_id) && reusable(&version, s))
                    .cloned()
                    .collect()
            }
        };

        let run = Run::replay_of(&original.run, from_step_id);
        info!(replay_run_id = %run.id, reused = reused.len(), "replaying run");
        self.launch(version, run, reused, AdmissionMode::Reject).await
    }

    /// Offers queued runs to admission again, oldest first. A workflow that
    /// is refused keeps its remaining runs queued in order. Returns how many
    /// runs were started.
    pub fn retry_pending(&self) -> usize {
        let mut started = Vec::new();
        {
            let mut pending = self.inner.pending();
            let mut blocked: HashSet<WorkflowId> = HashSet::new();
            let mut kept = VecDeque::with_capacity(pending.len());
            while let Some(entry) = pending.pop_front() {
                let workflow_id = entry.run.workflow_id;
                if blocked.contains(&workflow_id) {
                    kept.push_back(entry);
                    continue;
                }
                match self.inner.admission.admit(workflow_id) {
                    Ok(token) => {
                        let cancel = CancellationToken::new();
                        self.inner.active().insert(
                            entry.run.id,
                            ActiveRun {
                                cancel: cancel.clone(),
                                status: entry.status_tx.subscribe(),
                            },
                        );
                        started.push((entry, token, cancel));
                    }
                    Err(_) => {
                        blocked.insert(workflow_id);
                        kept.push_back(entry);
                    }
                }
            }
            *pending = kept;
        }

        let count = started.len();
        for (entry, token, cancel) in started {
            debug!(run_id = %entry.run.id, "re-admitted queued run");
            self.spawn_driver(entry.version, entry.run, entry.reused, token, cancel, entry.status_tx);
        }
        count
    }

    /// Calls [`Engine::retry_pending`] on the configured interval until
    /// `shutdown` fires.
    pub async fn run_pending_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.pending_retry_interval());
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    let started = self.retry_pending();
                    if started > 0 {
                        info!(started, "re-admitted queued runs");
                    }
                }
            }
        }
    }

    async fn load_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Arc<WorkflowVersion>, EngineError> {
        let version = self
            .inner
            .repository
            .get_version(version_id)
            .await
            .map_err(store_failure)?
            .ok_or(EngineError::WorkflowVersionNotFound { version_id })?;
        version.validate().map_err(|e| {
            let reason = format!("workflow version {version_id} is invalid: {e}");
            Report::new(e).context(EngineError::Validation { reason })
        })?;
        Ok(Arc::new(version))
    }

    /// Admits and starts `run`, or queues it, or refuses it.
    async fn launch(
        &self,
        version: Arc<WorkflowVersion>,
        run: Run,
        reused: Vec<Step>,
        mode: AdmissionMode,
    ) -> Result<RunHandle, EngineError> {
        let workflow_id = version.workflow_id;
        self.inner.admission.configure_workflow(
            workflow_id,
            version.settings.concurrency_limit,
            version.settings.rate_limit,
        );

        let admitted = self.inner.admission.admit(workflow_id);
        let token = match (admitted, mode) {
            (Ok(token), _) => Some(token),
            (Err(report), AdmissionMode::Reject) => {
                let retry_after = report.current_context().retry_after();
                warn!(%workflow_id, reason = %report.current_context(), "run refused");
                return Err(report.context(EngineError::AdmissionRejected { retry_after }));
            }
            (Err(report), AdmissionMode::Queue) => {
                debug!(%workflow_id, reason = %report.current_context(), "run queued");
                None
            }
        };

        // The run is registered before it is stored, so a cancellation never
        // finds a stored, unfinished run that neither map knows about.
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
        let cancel = CancellationToken::new();
        self.inner.active().insert(
            run.id,
            ActiveRun {
                cancel: cancel.clone(),
                status: status_rx.clone(),
            },
        );
        if let Err(e) = self.inner.store.insert_run(&run).await {
            self.inner.active().remove(&run.id);
            if let Some(token) = token {
                self.inner.admission.revoke(token);
            }
            return Err(store_failure(e));
        }

        let handle = RunHandle {
            run_id: run.id,
            duplicate: false,
            status: status_rx,
        };

        let Some(token) = token else {
            let cancelled = {
                let mut pending = self.inner.pending();
                self.inner.active().remove(&run.id);
                if cancel.is_cancelled() {
                    Some((run, status_tx))
                } else {
                    self.inner.telemetry.emit(RunEvent::new(
                        run.id,
                        run.correlation_id,
                        EventLevel::Info,
                        "run queued for admission",
                    ));
                    pending.push_back(PendingRun {
                        run,
                        version,
                        reused,
                        status_tx,
                    });
                    None
                }
            };
            if let Some((run, status_tx)) = cancelled {
                self.cancel_queued(run, &status_tx).await?;
            }
            return Ok(handle);
        };

        self.spawn_driver(version, run, reused, token, cancel, status_tx);
        Ok(handle)
    }

    /// Moves a run that never started straight to `cancelled`.
    async fn cancel_queued(
        &self,
        mut run: Run,
        status_tx: &watch::Sender<RunStatus>,
    ) -> Result<(), EngineError> {
        run.transition(RunStatus::Cancelled).map_err(|e| {
            Report::new(e).context(EngineError::Internal {
                reason: "cancelling a queued run".to_string(),
            })
        })?;
        self.inner
            .store
            .update_run(&run)
            .await
            .map_err(store_failure)?;
        status_tx.send_replace(RunStatus::Cancelled);
        self.inner.telemetry.emit(RunEvent::new(
            run.id,
            run.correlation_id,
            EventLevel::Info,
            "queued run cancelled",
        ));
        info!(run_id = %run.id, "queued run cancelled");
        Ok(())
    }

    fn spawn_driver(
        &self,
        version: Arc<WorkflowVersion>,
        run: Run,
        reused: Vec<Step>,
        token: AdmissionToken,
        cancel: CancellationToken,
        status_tx: watch::Sender<RunStatus>,
    ) {
        let driver = RunDriver::new(
            Arc::clone(&self.inner),
            version,
            run,
            reused,
            token,
            cancel,
            status_tx,
        );
        tokio::spawn(driver.drive());
    }

    fn handle_for(&self, run: &Run, duplicate: bool) -> RunHandle {
        let live = self
            .inner
            .active()
            .get(&run.id)
            .map(|active| active.status.clone());
        let status = live
            .or_else(|| {
                self.inner
                    .pending()
                    .iter()
                    .find(|p| p.run.id == run.id)
                    .map(|p| p.status_tx.subscribe())
            })
            .unwrap_or_else(|| watch::channel(run.status).1);
        RunHandle {
            run_id: run.id,
            duplicate,
            status,
        }
    }
}

/// Whether a partial replay keeps `step` instead of running its node again.
fn reusable(version: &WorkflowVersion, step: &Step) -> bool {
    match step.status {
        StepStatus::Failed => version
            .graph
            .get_node(step.node_id)
            .is_some_and(|node| node.on_failure == FailurePolicy::SkipDownstream),
        status => status.is_reusable(),
    }
}

fn store_failure(e: StoreError) -> Report<EngineError> {
    Report::new(e).context(EngineError::Store)
}
