//! Reference connectors.
//!
//! `EchoConnector` is useful as a smoke-test connector in a running engine;
//! `MockConnector` is scriptable and shares its call log across every
//! instance created from the same value, which makes it convenient for
//! exercising retry and failure handling.

use crate::connector::{Connector, OutputMap};
use crate::error::{ExecutionError, InitError};
use crate::manifest::{ActionSpec, AuthRequirement, ConnectorConfig, ConnectorManifest};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Connector id used by `EchoConnector`.
pub const ECHO_CONNECTOR_ID: &str = "echo";

/// Returns its inputs as its outputs.
#[derive(Debug, Default)]
pub struct EchoConnector;

#[async_trait]
impl Connector for EchoConnector {
    fn manifest(&self) -> ConnectorManifest {
        ConnectorManifest::new(ECHO_CONNECTOR_ID)
            .with_action(ActionSpec::new("echo"))
            .with_auth(AuthRequirement::none())
    }

    async fn initialize(&mut self, config: &ConnectorConfig) -> Result<(), InitError> {
        self.manifest().check_config(config)
    }

    async fn execute(
        &self,
        action_id: &str,
        inputs: &JsonValue,
    ) -> Result<OutputMap, ExecutionError> {
        if action_id != "echo" {
            return Err(ExecutionError::unsupported_action(action_id));
        }
        match inputs {
            JsonValue::Object(map) => Ok(map.clone()),
            other => Err(ExecutionError::invalid_input(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Failures returned, in order, before the connector starts succeeding.
    failures: VecDeque<ExecutionError>,
    /// Returned by every `execute` call when set.
    always_fail: Option<ExecutionError>,
    init_error: Option<InitError>,
    inputs: Vec<JsonValue>,
}

/// A scriptable connector.
///
/// Cloning shares the script and call log, so a registry factory can hand
/// out fresh instances while the test keeps a handle for assertions.
#[derive(Debug, Clone)]
pub struct MockConnector {
    id: String,
    output: OutputMap,
    delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
    executions: Arc<AtomicU32>,
    initializations: Arc<AtomicU32>,
    in_flight: Arc<AtomicU32>,
    peak_in_flight: Arc<AtomicU32>,
}

/// Counts one `execute` call as in flight until dropped.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConnector {
    /// Creates a connector that succeeds with `output`.
    #[must_use]
    pub fn succeeding(id: impl Into<String>, output: JsonValue) -> Self {
        let output = match output {
            JsonValue::Object(map) => map,
            other => {
                let mut map = OutputMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            output,
            delay: None,
            state: Arc::new(Mutex::new(MockState::default())),
            executions: Arc::new(AtomicU32::new(0)),
            initializations: Arc::new(AtomicU32::new(0)),
            in_flight: Arc::new(AtomicU32::new(0)),
            peak_in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Creates a connector whose every execution fails with `error`.
    #[must_use]
    pub fn failing(id: impl Into<String>, error: ExecutionError) -> Self {
        let mock = Self::succeeding(id, JsonValue::Object(OutputMap::new()));
        mock.lock().always_fail = Some(error);
        mock
    }

    /// Fails with `error` for the next `times` executions, then succeeds.
    #[must_use]
    pub fn failing_times(self, times: usize, error: ExecutionError) -> Self {
        {
            let mut state = self.lock();
            for _ in 0..times {
                state.failures.push_back(error.clone());
            }
        }
        self
    }

    /// Makes `initialize` fail.
    #[must_use]
    pub fn with_init_error(self, error: InitError) -> Self {
        self.lock().init_error = Some(error);
        self
    }

    /// Sleeps before every execution.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A registry factory handing out clones of this connector.
    #[must_use]
    pub fn factory(&self) -> impl Fn() -> Box<dyn Connector> + Send + Sync + 'static {
        let mock = self.clone();
        move || Box::new(mock.clone()) as Box<dyn Connector>
    }

    /// Number of `execute` calls across all clones.
    #[must_use]
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Number of `initialize` calls across all clones.
    #[must_use]
    pub fn initializations(&self) -> u32 {
        self.initializations.load(Ordering::SeqCst)
    }

    /// Most `execute` calls that were ever running at once, across all clones.
    #[must_use]
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Inputs received by `execute`, oldest first.
    #[must_use]
    pub fn received_inputs(&self) -> Vec<JsonValue> {
        self.lock().inputs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn manifest(&self) -> ConnectorManifest {
        ConnectorManifest::new(self.id.clone()).with_action(ActionSpec::new("run"))
    }

    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<(), InitError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        match &self.lock().init_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        action_id: &str,
        inputs: &JsonValue,
    ) -> Result<OutputMap, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if action_id != "run" {
            return Err(ExecutionError::unsupported_action(action_id));
        }

        let mut state = self.lock();
        state.inputs.push(inputs.clone());
        if let Some(err) = &state.always_fail {
            return Err(err.clone());
        }
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(self.output.clone()),
        }
    }
}
