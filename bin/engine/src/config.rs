//! Process configuration.
//!
//! Composed from the library configs and loaded via the `config` crate from
//! environment variables such as `FLOWGATE__ENGINE__RUN_TIMEOUT_SECONDS`.

use flowgate_admission::AdmissionConfig;
use flowgate_trigger::IntakeConfig;
use flowgate_workflow::EngineConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "FLOWGATE";
const ENV_SEPARATOR: &str = "__";

/// Engine process configuration composed from library configs.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub intake: IntakeConfig,

    /// Push one manual run through the echo connector after startup.
    #[serde(default)]
    pub startup_check: bool,
}

impl Settings {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(environment())
    }

    fn load(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
