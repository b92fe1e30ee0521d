//! Per-workflow concurrency slots.
//!
//! Acquiring a slot yields an `AdmissionToken`. The slot is freed when the
//! token is dropped, so whatever way a run ends, its slot comes back.

use crate::error::AdmissionError;
use flowgate_core::{Result, WorkflowId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SlotState {
    running: HashMap<WorkflowId, u32>,
    overrides: HashMap<WorkflowId, u32>,
}

#[derive(Debug)]
struct Shared {
    default_limit: u32,
    state: Mutex<SlotState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limit_in(&self, state: &SlotState, workflow_id: WorkflowId) -> u32 {
        state
            .overrides
            .get(&workflow_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn free(&self, workflow_id: WorkflowId) {
        let mut state = self.lock();
        match state.running.get_mut(&workflow_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.running.remove(&workflow_id);
            }
            None => warn!(workflow_id = %workflow_id, "released a slot that was not held"),
        }
    }
}

/// Caps simultaneously running runs per workflow.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct ConcurrencyManager {
    shared: Arc<Shared>,
}

impl ConcurrencyManager {
    #[must_use]
    pub fn new(default_limit: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_limit,
                state: Mutex::new(SlotState::default()),
            }),
        }
    }

    /// Overrides the limit for one workflow. Running runs are not affected.
    pub fn set_limit(&self, workflow_id: WorkflowId, limit: u32) {
        self.shared.lock().overrides.insert(workflow_id, limit);
    }

    pub fn clear_limit(&self, workflow_id: WorkflowId) {
        self.shared.lock().overrides.remove(&workflow_id);
    }

    #[must_use]
    pub fn limit_for(&self, workflow_id: WorkflowId) -> u32 {
        let state = self.shared.lock();
        self.shared.limit_in(&state, workflow_id)
    }

    /// Number of slots currently held for the workflow.
    #[must_use]
    pub fn running(&self, workflow_id: WorkflowId) -> u32 {
        self.shared
            .lock()
            .running
            .get(&workflow_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a slot is free right now. Advisory only; use `acquire`.
    #[must_use]
    pub fn can_start_run(&self, workflow_id: WorkflowId) -> bool {
        let state = self.shared.lock();
        let running = state.running.get(&workflow_id).copied().unwrap_or(0);
        running < self.shared.limit_in(&state, workflow_id)
    }

    /// Reserves a slot, checking and incrementing under one lock.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::ConcurrencyLimitReached` when every slot is taken.
    pub fn acquire(&self, workflow_id: WorkflowId) -> Result<AdmissionToken, AdmissionError> {
        let mut state = self.shared.lock();
        let limit = self.shared.limit_in(&state, workflow_id);
        let running = state.running.entry(workflow_id).or_insert(0);
        if *running >= limit {
            if *running == 0 {
                state.running.remove(&workflow_id);
            }
            return Err(AdmissionError::ConcurrencyLimitReached { workflow_id, limit }.into());
        }
        *running += 1;
        debug!(workflow_id = %workflow_id, running = *running, limit, "acquired slot");

        Ok(AdmissionToken {
            workflow_id,
            shared: Some(Arc::clone(&self.shared)),
        })
    }

    /// Returns a slot. Equivalent to dropping the token.
    pub fn release(&self, token: AdmissionToken) {
        drop(token);
    }
}

/// Permission to run one instance of a workflow.
///
/// Holds one concurrency slot until dropped.
pub struct AdmissionToken {
    workflow_id: WorkflowId,
    shared: Option<Arc<Shared>>,
}

impl AdmissionToken {
    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }
}

impl fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("workflow_id", &self.workflow_id)
            .field("held", &self.shared.is_some())
            .finish()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.free(self.workflow_id);
            debug!(workflow_id = %self.workflow_id, "released slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_limit() {
        let manager = ConcurrencyManager::new(2);
        let wf = WorkflowId::new();

        let a = manager.acquire(wf).expect("first");
        let _b = manager.acquire(wf).expect("second");
        assert!(!manager.can_start_run(wf));

        let err = manager.acquire(wf).unwrap_err();
        assert_eq!(
            err.current_context(),
            &AdmissionError::ConcurrencyLimitReached {
                workflow_id: wf,
                limit: 2
            }
        );

        manager.release(a);
        assert!(manager.can_start_run(wf));
        assert_eq!(manager.running(wf), 1);
    }

    #[test]
    fn drop_releases_slot() {
        let manager = ConcurrencyManager::new(1);
        let wf = WorkflowId::new();
        {
            let _token = manager.acquire(wf).expect("acquire");
            assert_eq!(manager.running(wf), 1);
        }
        assert_eq!(manager.running(wf), 0);
    }

    #[test]
    fn slot_released_when_holder_panics() {
        let manager = ConcurrencyManager::new(1);
        let wf = WorkflowId::new();
        let cloned = manager.clone();

        let outcome = std::thread::spawn(move || {
            let _token = cloned.acquire(wf).expect("acquire");
            panic!("run driver crashed");
        })
        .join();

        assert!(outcome.is_err());
        assert_eq!(manager.running(wf), 0);
    }

    #[test]
    fn per_workflow_override() {
        let manager = ConcurrencyManager::new(1);
        let wf = WorkflowId::new();
        manager.set_limit(wf, 3);
        assert_eq!(manager.limit_for(wf), 3);

        let _tokens: Vec<_> = (0..3)
            .map(|_| manager.acquire(wf).expect("acquire"))
            .collect();
        assert!(manager.acquire(wf).is_err());
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let manager = ConcurrencyManager::new(0);
        let wf = WorkflowId::new();
        assert!(manager.acquire(wf).is_err());
        assert_eq!(manager.running(wf), 0);
    }

    #[test]
    fn simultaneous_acquire_at_limit_one() {
        let manager = ConcurrencyManager::new(1);
        let wf = WorkflowId::new();
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        manager.acquire(wf).map(std::mem::forget).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread"))
                .collect()
        });

        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(manager.running(wf), 1);
    }
}
