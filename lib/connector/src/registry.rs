//! Connector registry.
//!
//! The registry is built once by the composition root and shared behind an
//! `Arc`. Tests build their own isolated instance.

use crate::connector::Connector;
use crate::error::RegistryError;
use crate::manifest::ConnectorManifest;
use flowgate_core::Result;
use jsonschema::Validator;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Produces fresh connector instances.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Connector>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Box<dyn Connector> + Send + Sync,
{
    fn create(&self) -> Box<dyn Connector> {
        self()
    }
}

struct Entry {
    manifest: ConnectorManifest,
    factory: Arc<dyn ConnectorFactory>,
    input_validators: HashMap<String, Arc<Validator>>,
}

/// Maps connector ids to factories.
#[derive(Default)]
pub struct ConnectorRegistry {
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under the id of the manifest it produces.
    ///
    /// Registering the same id again replaces the previous factory. Input
    /// schemas are compiled up front so that a broken manifest is caught at
    /// startup rather than on the first step that uses it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidSchema` if an action's input schema
    /// does not compile.
    pub fn register<F>(&mut self, factory: F) -> Result<(), RegistryError>
    where
        F: ConnectorFactory + 'static,
    {
        let manifest = factory.create().manifest();
        let mut input_validators = HashMap::with_capacity(manifest.actions.len());
        for action in &manifest.actions {
            let validator = jsonschema::validator_for(&action.input_schema).map_err(|e| {
                RegistryError::InvalidSchema {
                    connector_id: manifest.id.clone(),
                    action_id: action.id.clone(),
                    reason: e.to_string(),
                }
            })?;
            input_validators.insert(action.id.clone(), Arc::new(validator));
        }

        let id = manifest.id.clone();
        let replaced = self
            .entries
            .insert(
                id.clone(),
                Entry {
                    manifest,
                    factory: Arc::new(factory),
                    input_validators,
                },
            )
            .is_some();
        debug!(connector_id = %id, replaced, "registered connector");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, connector_id: &str) -> bool {
        self.entries.contains_key(connector_id)
    }

    /// Registered connector ids, sorted.
    #[must_use]
    pub fn connector_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the manifest registered under `connector_id`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` for an unknown id.
    pub fn manifest(&self, connector_id: &str) -> Result<&ConnectorManifest, RegistryError> {
        Ok(&self.entry(connector_id)?.manifest)
    }

    /// Returns the factory registered under `connector_id`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` for an unknown id.
    pub fn lookup(&self, connector_id: &str) -> Result<Arc<dyn ConnectorFactory>, RegistryError> {
        Ok(Arc::clone(&self.entry(connector_id)?.factory))
    }

    /// Builds a fresh, uninitialized instance.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` for an unknown id.
    pub fn instantiate(&self, connector_id: &str) -> Result<Box<dyn Connector>, RegistryError> {
        Ok(self.entry(connector_id)?.factory.create())
    }

    /// Checks `inputs` against the declared input schema of an action.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `UnsupportedAction` or `InvalidInput`.
    pub fn validate_inputs(
        &self,
        connector_id: &str,
        action_id: &str,
        inputs: &JsonValue,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(connector_id)?;
        let validator =
            entry
                .input_validators
                .get(action_id)
                .ok_or_else(|| RegistryError::UnsupportedAction {
                    connector_id: connector_id.to_string(),
                    action_id: action_id.to_string(),
                })?;

        let violations: Vec<String> = validator
            .iter_errors(inputs)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("at '{path}': {e}")
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidInput {
                connector_id: connector_id.to_string(),
                action_id: action_id.to_string(),
                violations,
            }
            .into())
        }
    }

    fn entry(&self, connector_id: &str) -> Result<&Entry, RegistryError> {
        self.entries.get(connector_id).ok_or_else(|| {
            RegistryError::NotFound {
                connector_id: connector_id.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ActionSpec;
    use crate::testing::{EchoConnector, MockConnector};
    use serde_json::json;

    fn echo_factory() -> Box<dyn Connector> {
        Box::new(EchoConnector)
    }

    #[test]
    fn lookup_of_unknown_id_is_not_found() {
        let registry = ConnectorRegistry::new();
        let err = registry.instantiate("nope").err().expect("should fail");
        assert_eq!(
            err.current_context(),
            &RegistryError::NotFound {
                connector_id: "nope".to_string()
            }
        );
    }

    #[test]
    fn lookup_returns_a_working_factory() {
        let mut registry = ConnectorRegistry::new();
        registry.register(echo_factory).expect("register");

        let factory = registry.lookup("echo").expect("lookup");
        assert_eq!(factory.create().manifest().id, "echo");
        assert!(registry.lookup("nope").is_err());
    }

    #[test]
    fn register_then_instantiate() {
        let mut registry = ConnectorRegistry::new();
        registry.register(echo_factory).expect("register");

        assert!(registry.contains("echo"));
        let instance = registry.instantiate("echo").expect("instantiate");
        assert_eq!(instance.manifest().id, "echo");
    }

    #[test]
    fn re_registering_overwrites() {
        let first = MockConnector::succeeding("svc", json!({"from": "first"}));
        let second = MockConnector::succeeding("svc", json!({"from": "second"}));

        let mut registry = ConnectorRegistry::new();
        let f = first.clone();
        registry
            .register(move || Box::new(f.clone()) as Box<dyn Connector>)
            .expect("register first");
        let s = second.clone();
        registry
            .register(move || Box::new(s.clone()) as Box<dyn Connector>)
            .expect("register second");

        assert_eq!(registry.connector_ids(), vec!["svc"]);
    }

    #[tokio::test]
    async fn overwritten_factory_is_used() {
        let first = MockConnector::succeeding("svc", json!({"from": "first"}));
        let second = MockConnector::succeeding("svc", json!({"from": "second"}));

        let mut registry = ConnectorRegistry::new();
        let f = first.clone();
        registry
            .register(move || Box::new(f.clone()) as Box<dyn Connector>)
            .expect("register first");
        let s = second.clone();
        registry
            .register(move || Box::new(s.clone()) as Box<dyn Connector>)
            .expect("register second");

        let instance = registry.instantiate("svc").expect("instantiate");
        let out = instance.execute("run", &json!({})).await.expect("run");
        assert_eq!(out.get("from"), Some(&json!("second")));
        assert_eq!(first.executions(), 0);
    }

    struct Strict;

    #[async_trait::async_trait]
    impl Connector for Strict {
        fn manifest(&self) -> ConnectorManifest {
            ConnectorManifest::new("strict").with_action(ActionSpec::new("send").with_input_schema(
                json!({
                    "type": "object",
                    "required": ["to"],
                    "properties": {"to": {"type": "string"}}
                }),
            ))
        }

        async fn initialize(
            &mut self,
            _config: &crate::ConnectorConfig,
        ) -> std::result::Result<(), crate::InitError> {
            Ok(())
        }

        async fn execute(
            &self,
            _action_id: &str,
            _inputs: &JsonValue,
        ) -> std::result::Result<crate::OutputMap, crate::ExecutionError> {
            Ok(crate::OutputMap::new())
        }
    }

    fn strict_registry() -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry
            .register(|| Box::new(Strict) as Box<dyn Connector>)
            .expect("register");
        registry
    }

    #[test]
    fn inputs_validated_against_schema() {
        let registry = strict_registry();
        assert!(
            registry
                .validate_inputs("strict", "send", &json!({"to": "ops"}))
                .is_ok()
        );

        let err = registry
            .validate_inputs("strict", "send", &json!({"to": 42}))
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistryError::InvalidInput { violations, .. } if violations.len() == 1
        ));
    }

    #[test]
    fn undeclared_action_is_rejected() {
        let registry = strict_registry();
        let err = registry
            .validate_inputs("strict", "delete", &json!({}))
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistryError::UnsupportedAction { .. }
        ));
    }

    struct BrokenSchema;

    #[async_trait::async_trait]
    impl Connector for BrokenSchema {
        fn manifest(&self) -> ConnectorManifest {
            ConnectorManifest::new("broken")
                .with_action(ActionSpec::new("x").with_input_schema(json!({"type": 17})))
        }

        async fn initialize(
            &mut self,
            _config: &crate::ConnectorConfig,
        ) -> std::result::Result<(), crate::InitError> {
            Ok(())
        }

        async fn execute(
            &self,
            _action_id: &str,
            _inputs: &JsonValue,
        ) -> std::result::Result<crate::OutputMap, crate::ExecutionError> {
            Ok(crate::OutputMap::new())
        }
    }

    #[test]
    fn uncompilable_schema_fails_registration() {
        let mut registry = ConnectorRegistry::new();
        let err = registry
            .register(|| Box::new(BrokenSchema) as Box<dyn Connector>)
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistryError::InvalidSchema { .. }
        ));
        assert!(!registry.contains("broken"));
    }
}
