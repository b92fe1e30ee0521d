//! Persistence seams for workflow versions, runs and steps.
//!
//! The engine only talks to these traits. In-memory implementations are
//! provided for tests and single-process deployments.

use crate::definition::WorkflowVersion;
use crate::error::StoreError;
use crate::execution::{Run, Step};
use async_trait::async_trait;
use flowgate_core::{RunId, WorkflowVersionId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Loads workflow versions.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Option<WorkflowVersion>, StoreError>;
}

/// Stores runs and their steps.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run. Fails with `Conflict` if the id is taken.
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Overwrites an existing run.
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// The most recently created run carrying `key`.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError>;

    /// Inserts or replaces a step.
    async fn upsert_step(&self, step: &Step) -> Result<(), StoreError>;

    /// Steps of a run, in creation order.
    async fn steps_for_run(&self, run_id: RunId) -> Result<Vec<Step>, StoreError>;
}

/// Workflow versions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    versions: Mutex<HashMap<WorkflowVersionId, WorkflowVersion>>,
}

impl InMemoryWorkflowRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a version.
    pub fn insert(&self, version: WorkflowVersion) {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(version.id, version);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&version_id)
            .cloned())
    }
}

#[derive(Debug, Default)]
struct RunTables {
    runs: HashMap<RunId, Run>,
    steps: HashMap<RunId, Vec<Step>>,
    /// Run ids per idempotency key, oldest first.
    by_key: HashMap<String, Vec<RunId>>,
}

/// Runs and steps held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    tables: Mutex<RunTables>,
}

impl InMemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, RunTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict {
                message: format!("run {} already exists", run.id),
            });
        }
        if let Some(key) = &run.idempotency_key {
            tables.by_key.entry(key.clone()).or_default().push(run.id);
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut tables = self.tables();
        match tables.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::Unavailable {
                message: format!("run {} was never inserted", run.id),
            }),
        }
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.tables().runs.get(&run_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .by_key
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| tables.runs.get(id))
            .cloned())
    }

    async fn upsert_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let steps = tables.steps.entry(step.run_id).or_default();
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn steps_for_run(&self, run_id: RunId) -> Result<Vec<Step>, StoreError> {
        Ok(self.tables().steps.get(&run_id).cloned().unwrap_or_default())
    }
}
