//! Engine configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide defaults. Workflow settings override the per-run values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for one run before it is timed out.
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    /// Steps of one run allowed to execute at once.
    #[serde(default = "default_step_concurrency")]
    pub step_concurrency: usize,
    /// Retry policy for nodes and workflows without their own.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Minimum gap between two alerts for the same workflow.
    #[serde(default = "default_alert_throttle_seconds")]
    pub alert_throttle_seconds: u64,
    /// How often queued runs are offered to admission again.
    #[serde(default = "default_pending_retry_interval_seconds")]
    pub pending_retry_interval_seconds: u64,
}

fn default_run_timeout_seconds() -> u64 {
    300
}

fn default_step_concurrency() -> usize {
    4
}

fn default_alert_throttle_seconds() -> u64 {
    300
}

fn default_pending_retry_interval_seconds() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: default_run_timeout_seconds(),
            step_concurrency: default_step_concurrency(),
            retry: RetryPolicy::default(),
            alert_throttle_seconds: default_alert_throttle_seconds(),
            pending_retry_interval_seconds: default_pending_retry_interval_seconds(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    #[must_use]
    pub fn alert_throttle(&self) -> Duration {
        Duration::from_secs(self.alert_throttle_seconds)
    }

    #[must_use]
    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_secs(self.pending_retry_interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.run_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn zero_pending_interval_is_clamped() {
        let config = EngineConfig {
            pending_retry_interval_seconds: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.pending_retry_interval(), Duration::from_secs(1));
    }
}
