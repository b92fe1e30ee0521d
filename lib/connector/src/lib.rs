//! Connector contract and registry for flowgate.
//!
//! This crate provides:
//!
//! - **Connector trait**: the fixed capability every executable node implements
//! - **Manifests**: static descriptions of actions and their JSON schemas
//! - **Registry**: an explicitly constructed map from connector id to factory,
//!   with input validation at the boundary
//! - **Reference connectors**: `EchoConnector` and the scriptable `MockConnector`

pub mod connector;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod testing;

pub use connector::{Connector, OutputMap};
pub use error::{ExecutionError, ExecutionErrorKind, InitError, RegistryError};
pub use manifest::{ActionSpec, AuthKind, AuthRequirement, ConnectorConfig, ConnectorManifest};
pub use registry::{ConnectorFactory, ConnectorRegistry};
pub use testing::{EchoConnector, MockConnector};
