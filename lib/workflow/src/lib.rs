//! Workflow engine for flowgate.
//!
//! - **Graph model**: petgraph-backed DAGs of connector and condition nodes
//! - **Execution**: run and step state machines, retries, replay and cancellation
//! - **Engine**: admission-aware run creation, idempotency and the run driver
//! - **Observability**: run events, trace spans and throttled failure alerts

pub mod condition;
pub mod config;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graph;
mod locks;
pub mod node;
pub mod observability;
mod plan;
pub mod resolver;
pub mod retry;
mod runner;
pub mod scope;
mod step;
pub mod store;

pub use condition::{Condition, ConditionError, Operator};
pub use config::EngineConfig;
pub use definition::{WorkflowSettings, WorkflowVersion};
pub use edge::{Branch, Edge};
pub use engine::{AdmissionMode, Engine, EngineBuilder, RunHandle, RunRequest};
pub use error::{EngineError, GraphError, StoreError, TransitionError};
pub use execution::{
    ErrorClass, FailureDetail, ReplayType, Run, RunStatus, RunView, Step, StepStatus,
};
pub use graph::WorkflowGraph;
pub use node::{FailurePolicy, Node, NodeKind};
pub use observability::{
    Alert, AlertDispatcher, AlertNotifier, EventLevel, LogNotifier, MemoryNotifier, MemorySink,
    ObservabilitySink, RunEvent, SinkError, TraceSpan, TracingSink,
};
pub use resolver::{ConfigResolver, ResolveError, StaticConfigResolver};
pub use retry::RetryPolicy;
pub use store::{InMemoryRunStore, InMemoryWorkflowRepository, RunStore, WorkflowRepository};
