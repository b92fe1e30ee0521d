//! Intake configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defaults shared by every trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Width of the time bucket folded into idempotency keys. Deliveries of
    /// the same content within one bucket map to one run.
    #[serde(default = "default_idempotency_window_seconds")]
    pub idempotency_window_seconds: u64,
    /// How long a synchronous webhook waits for its run when the trigger
    /// does not say.
    #[serde(default = "default_sync_timeout_seconds")]
    pub sync_timeout_seconds: u64,
}

fn default_idempotency_window_seconds() -> u64 {
    3600
}

fn default_sync_timeout_seconds() -> u64 {
    30
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            idempotency_window_seconds: default_idempotency_window_seconds(),
            sync_timeout_seconds: default_sync_timeout_seconds(),
        }
    }
}

impl IntakeConfig {
    #[must_use]
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_seconds.max(1))
    }

    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: IntakeConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config, IntakeConfig::default());
        assert_eq!(config.idempotency_window(), Duration::from_secs(3600));
    }
}
