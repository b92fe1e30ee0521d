//! Combined admission decision.

use crate::concurrency::{AdmissionToken, ConcurrencyManager};
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::rate_limit::{RateLimitPolicy, RateLimitResult, RateLimiter};
use flowgate_core::{Result, WorkflowId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, instrument};

/// Consults both gates as one atomic step per workflow.
///
/// Under a per-workflow lock the rate window is checked, a concurrency slot
/// is acquired, and only then is the run recorded against the window. A run
/// refused for concurrency therefore never consumes rate quota.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    rate: RateLimiter,
    concurrency: ConcurrencyManager,
    decision_locks: Arc<Mutex<HashMap<WorkflowId, Arc<Mutex<()>>>>>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::from_parts(
            RateLimiter::new(config.default_rate_limit),
            ConcurrencyManager::new(config.default_concurrency_limit),
        )
    }

    #[must_use]
    pub fn from_parts(rate: RateLimiter, concurrency: ConcurrencyManager) -> Self {
        Self {
            rate,
            concurrency,
            decision_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    /// Applies per-workflow overrides; `None` restores the default.
    pub fn configure_workflow(
        &self,
        workflow_id: WorkflowId,
        concurrency_limit: Option<u32>,
        rate_limit: Option<RateLimitPolicy>,
    ) {
        match concurrency_limit {
            Some(limit) => self.concurrency.set_limit(workflow_id, limit),
            None => self.concurrency.clear_limit(workflow_id),
        }
        match rate_limit {
            Some(policy) => self.rate.set_policy(workflow_id, policy),
            None => self.rate.clear_policy(workflow_id),
        }
    }

    /// Whether `admit` would currently succeed. Advisory only.
    #[must_use]
    pub fn can_admit(&self, workflow_id: WorkflowId) -> bool {
        self.rate.check_rate_limit(workflow_id).is_allowed()
            && self.concurrency.can_start_run(workflow_id)
    }

    /// Admits one run of the workflow.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::RateLimited` or
    /// `AdmissionError::ConcurrencyLimitReached`.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub fn admit(&self, workflow_id: WorkflowId) -> Result<AdmissionToken, AdmissionError> {
        let key_lock = self.decision_lock(workflow_id);
        let _decision = key_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let RateLimitResult::Exceeded { retry_after } = self.rate.check_rate_limit(workflow_id)
        {
            let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
            debug!(retry_after_ms, "rate limited");
            return Err(AdmissionError::RateLimited {
                workflow_id,
                retry_after,
            }
            .into());
        }

        let token = self.concurrency.acquire(workflow_id)?;
        self.rate.record_run(workflow_id);
        debug!("admitted");
        Ok(token)
    }

    /// Hands back an admission that never turned into a run: the slot is
    /// freed and the rate quota it consumed is returned.
    pub fn revoke(&self, token: AdmissionToken) {
        let workflow_id = token.workflow_id();
        let key_lock = self.decision_lock(workflow_id);
        let _decision = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
        drop(token);
        self.rate.refund(workflow_id);
        debug!(%workflow_id, "admission revoked");
    }

    fn decision_lock(&self, workflow_id: WorkflowId) -> Arc<Mutex<()>> {
        let mut locks = self
            .decision_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(workflow_id).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn controller(concurrency: u32, max_runs: u32) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            default_concurrency_limit: concurrency,
            default_rate_limit: RateLimitPolicy::new(max_runs, 60),
        })
    }

    #[test]
    fn rate_limit_checked_first() {
        let admission = controller(5, 1);
        let wf = WorkflowId::new();

        let _token = admission.admit(wf).expect("first admission");
        let err = admission.admit(wf).unwrap_err();
        assert!(matches!(
            err.current_context(),
            AdmissionError::RateLimited { .. }
        ));
        assert!(err.current_context().retry_after().is_some());
    }

    #[test]
    fn paused_workflow_is_never_admitted() {
        let admission = controller(5, 0);
        let wf = WorkflowId::new();

        let err = admission.admit(wf).unwrap_err();
        assert!(matches!(
            err.current_context(),
            AdmissionError::RateLimited { .. }
        ));
        assert_eq!(admission.concurrency().running(wf), 0);
        assert!(!admission.can_admit(wf));
    }

    #[test]
    fn concurrency_rejection_does_not_consume_quota() {
        let admission = controller(1, 2);
        let wf = WorkflowId::new();

        let token = admission.admit(wf).expect("first");
        let err = admission.admit(wf).unwrap_err();
        assert!(matches!(
            err.current_context(),
            AdmissionError::ConcurrencyLimitReached { limit: 1, .. }
        ));
        assert_eq!(admission.rate_limiter().check_rate_limit(wf).remaining(), 1);

        drop(token);
        assert!(admission.admit(wf).is_ok());
    }

    #[test]
    fn revoked_admission_costs_nothing() {
        let admission = controller(1, 1);
        let wf = WorkflowId::new();

        let token = admission.admit(wf).expect("first");
        admission.revoke(token);

        assert_eq!(admission.concurrency().running(wf), 0);
        assert!(admission.admit(wf).is_ok());
    }

    #[test]
    fn overrides_apply_per_workflow() {
        let admission = controller(1, 100);
        let wide = WorkflowId::new();
        admission.configure_workflow(wide, Some(2), None);

        let _a = admission.admit(wide).expect("a");
        let _b = admission.admit(wide).expect("b");
        assert!(!admission.can_admit(wide));

        let narrow = WorkflowId::new();
        let _c = admission.admit(narrow).expect("c");
        assert!(!admission.can_admit(narrow));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_admissions_never_exceed_limit() {
        const LIMIT: u32 = 3;
        let admission = controller(LIMIT, 10_000);
        let wf = WorkflowId::new();
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let admitted = Arc::new(AtomicU32::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let admission = admission.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let admitted = Arc::clone(&admitted);
            tasks.spawn(async move {
                let Ok(token) = admission.admit(wf) else {
                    return;
                };
                admitted.fetch_add(1, Ordering::SeqCst);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(token);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= LIMIT);
        assert!(admitted.load(Ordering::SeqCst) >= 1);
        assert_eq!(admission.concurrency().running(wf), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_simultaneous_admissions_at_limit_one() {
        let admission = controller(1, 100);
        let wf = WorkflowId::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let spawn = |admission: AdmissionController, barrier: Arc<tokio::sync::Barrier>| {
            tokio::spawn(async move {
                barrier.wait().await;
                admission.admit(wf)
            })
        };
        let a = spawn(admission.clone(), Arc::clone(&barrier));
        let b = spawn(admission.clone(), Arc::clone(&barrier));
        let (a, b) = (a.await.expect("join"), b.await.expect("join"));

        let outcomes = [a, b];
        let tokens = outcomes.iter().filter(|r| r.is_ok()).count();
        let rejected: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(tokens, 1);
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            rejected[0].current_context(),
            AdmissionError::ConcurrencyLimitReached { .. }
        ));
    }
}
