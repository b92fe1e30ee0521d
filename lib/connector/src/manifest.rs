//! Static connector descriptions.

use crate::error::InitError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::map::Map;

/// Resolved configuration handed to `Connector::initialize`.
///
/// Holds credentials and static parameters already decrypted by the
/// configuration resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorConfig(Map<String, JsonValue>);

impl ConnectorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Copies every entry of `other` over this configuration.
    pub fn merge(&mut self, other: &ConnectorConfig) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Returns the value for `key` or a `MissingConfig` error.
    ///
    /// # Errors
    ///
    /// Returns `InitError::MissingConfig` when the key is absent or null.
    pub fn require(&self, key: &str) -> Result<&JsonValue, InitError> {
        match self.0.get(key) {
            Some(JsonValue::Null) | None => Err(InitError::MissingConfig {
                key: key.to_string(),
            }),
            Some(value) => Ok(value),
        }
    }
}

impl From<Map<String, JsonValue>> for ConnectorConfig {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// Authentication scheme a connector expects its configuration to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    ApiKey,
    Basic,
    Oauth2,
}

/// Declared authentication requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequirement {
    pub kind: AuthKind,
    /// Configuration keys that must be present for this scheme.
    #[serde(default)]
    pub config_keys: Vec<String>,
}

impl AuthRequirement {
    #[must_use]
    pub fn none() -> Self {
        Self {
            kind: AuthKind::None,
            config_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::ApiKey,
            config_keys: vec![key.into()],
        }
    }

    #[must_use]
    pub fn basic() -> Self {
        Self {
            kind: AuthKind::Basic,
            config_keys: vec!["username".to_string(), "password".to_string()],
        }
    }

    #[must_use]
    pub fn oauth2() -> Self {
        Self {
            kind: AuthKind::Oauth2,
            config_keys: vec!["access_token".to_string()],
        }
    }
}

/// One action a connector can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    /// JSON schema for the action inputs.
    pub input_schema: JsonValue,
    /// JSON schema for the action outputs.
    pub output_schema: JsonValue,
}

impl ActionSpec {
    /// An action that accepts any object and returns any object.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: JsonValue) -> Self {
        self.input_schema = schema;
        self
    }

    #[must_use]
    pub fn with_output_schema(mut self, schema: JsonValue) -> Self {
        self.output_schema = schema;
        self
    }
}

/// Static description of a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorManifest {
    /// Globally unique connector identifier.
    pub id: String,
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub auth: Vec<AuthRequirement>,
}

impl ConnectorManifest {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Vec::new(),
            auth: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth.push(auth);
        self
    }

    #[must_use]
    pub fn action(&self, action_id: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    /// Verifies that every key demanded by the declared auth schemes is set.
    ///
    /// # Errors
    ///
    /// Returns the first missing key as `InitError::MissingConfig`.
    pub fn check_config(&self, config: &ConnectorConfig) -> Result<(), InitError> {
        for key in self.auth.iter().flat_map(|a| a.config_keys.iter()) {
            config.require(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_lookup_by_id() {
        let manifest = ConnectorManifest::new("http")
            .with_action(ActionSpec::new("get"))
            .with_action(ActionSpec::new("post"));

        assert!(manifest.action("post").is_some());
        assert!(manifest.action("delete").is_none());
    }

    #[test]
    fn check_config_reports_missing_auth_key() {
        let manifest = ConnectorManifest::new("llm").with_auth(AuthRequirement::api_key("api_key"));

        let err = manifest.check_config(&ConnectorConfig::new()).unwrap_err();
        assert_eq!(
            err,
            InitError::MissingConfig {
                key: "api_key".to_string()
            }
        );

        let config = ConnectorConfig::new().with("api_key", json!("sk-test"));
        assert!(manifest.check_config(&config).is_ok());
    }

    #[test]
    fn null_config_value_counts_as_missing() {
        let config = ConnectorConfig::new().with("token", JsonValue::Null);
        assert!(config.require("token").is_err());
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut base = ConnectorConfig::new().with("a", json!(1)).with("b", json!(2));
        base.merge(&ConnectorConfig::new().with("b", json!(3)));
        assert_eq!(base.get("a"), Some(&json!(1)));
        assert_eq!(base.get("b"), Some(&json!(3)));
    }

    #[test]
    fn manifest_deserializes_without_auth() {
        let manifest: ConnectorManifest = serde_json::from_value(json!({
            "id": "memory",
            "actions": [{"id": "store", "input_schema": {}, "output_schema": {}}]
        }))
        .expect("deserialize");
        assert!(manifest.auth.is_empty());
        assert_eq!(manifest.actions[0].id, "store");
    }
}
