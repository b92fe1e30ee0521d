//! Per-workflow rate limiting.
//!
//! Each workflow keeps a sliding-window log of the instants at which runs
//! were admitted. Checking never consumes quota; `record_run` does, and is
//! called exactly once per admitted run.

use flowgate_core::WorkflowId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum runs admitted within any window.
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_max_runs() -> u32 {
    60
}

fn default_window_seconds() -> u64 {
    60
}

impl RateLimitPolicy {
    #[must_use]
    pub fn new(max_runs: u32, window_seconds: u64) -> Self {
        Self {
            max_runs,
            window_seconds,
        }
    }

    #[must_use]
    pub fn per_minute(max_runs: u32) -> Self {
        Self::new(max_runs, 60)
    }

    #[must_use]
    pub fn per_hour(max_runs: u32) -> Self {
        Self::new(max_runs, 3600)
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(default_max_runs(), default_window_seconds())
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Another run may be admitted.
    Allowed { remaining: u32 },
    /// The window is full.
    Exceeded { retry_after: Duration },
}

impl RateLimitResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Runs still admissible in the current window (0 if exceeded).
    #[must_use]
    pub fn remaining(&self) -> u32 {
        match self {
            Self::Allowed { remaining } => *remaining,
            Self::Exceeded { .. } => 0,
        }
    }
}

#[derive(Debug, Default)]
struct WindowLog {
    admitted: VecDeque<Instant>,
}

impl WindowLog {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    logs: HashMap<WorkflowId, WindowLog>,
    overrides: HashMap<WorkflowId, RateLimitPolicy>,
}

/// Sliding-window rate limiter keyed by workflow.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    default_policy: RateLimitPolicy,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            default_policy,
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    /// Replaces the policy for one workflow.
    pub fn set_policy(&self, workflow_id: WorkflowId, policy: RateLimitPolicy) {
        self.lock().overrides.insert(workflow_id, policy);
    }

    /// Reverts a workflow to the default policy.
    pub fn clear_policy(&self, workflow_id: WorkflowId) {
        self.lock().overrides.remove(&workflow_id);
    }

    #[must_use]
    pub fn policy_for(&self, workflow_id: WorkflowId) -> RateLimitPolicy {
        self.lock()
            .overrides
            .get(&workflow_id)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Reports whether a run may be admitted, without consuming quota.
    #[must_use]
    pub fn check_rate_limit(&self, workflow_id: WorkflowId) -> RateLimitResult {
        let mut state = self.lock();
        let policy = state
            .overrides
            .get(&workflow_id)
            .copied()
            .unwrap_or(self.default_policy);
        let now = Instant::now();
        let window = policy.window();

        let (used, oldest) = match state.logs.get_mut(&workflow_id) {
            Some(log) => {
                log.prune(now, window);
                (log.admitted.len(), log.admitted.front().copied())
            }
            None => (0, None),
        };

        let used = u32::try_from(used).unwrap_or(u32::MAX);
        if used < policy.max_runs {
            return RateLimitResult::Allowed {
                remaining: policy.max_runs - used,
            };
        }

        // The window frees up when the oldest admission ages out. A policy
        // that admits nothing is retried a full window later.
        let retry_after = oldest
            .map(|oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(window);
        RateLimitResult::Exceeded { retry_after }
    }

    /// Consumes one unit of quota for the workflow.
    pub fn record_run(&self, workflow_id: WorkflowId) {
        let mut state = self.lock();
        let window = state
            .overrides
            .get(&workflow_id)
            .copied()
            .unwrap_or(self.default_policy)
            .window();
        let now = Instant::now();
        let log = state.logs.entry(workflow_id).or_default();
        log.prune(now, window);
        log.admitted.push_back(now);
    }

    /// Gives back the most recently consumed unit, for an admission whose
    /// run was never created.
    pub fn refund(&self, workflow_id: WorkflowId) {
        if let Some(log) = self.lock().logs.get_mut(&workflow_id) {
            log.admitted.pop_back();
        }
    }

    /// Forgets all admissions recorded for a workflow.
    pub fn reset(&self, workflow_id: WorkflowId) {
        self.lock().logs.remove(&workflow_id);
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
