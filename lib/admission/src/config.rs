//! Admission configuration.

use crate::rate_limit::RateLimitPolicy;
use serde::{Deserialize, Serialize};

/// Global admission defaults. Individual workflows may override both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum simultaneously running runs per workflow.
    #[serde(default = "default_concurrency_limit")]
    pub default_concurrency_limit: u32,
    /// Rate policy applied to workflows without an override.
    #[serde(default)]
    pub default_rate_limit: RateLimitPolicy,
}

fn default_concurrency_limit() -> u32 {
    10
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_concurrency_limit: default_concurrency_limit(),
            default_rate_limit: RateLimitPolicy::default(),
        }
    }
}
