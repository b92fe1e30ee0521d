//! flowgate engine process.
//!
//! Wires the connector registry, admission control and the workflow engine
//! together, keeps queued runs moving, and shuts down on Ctrl-C.

mod config;

use crate::config::Settings;
use flowgate_admission::AdmissionController;
use flowgate_connector::{Connector, ConnectorRegistry, EchoConnector};
use flowgate_trigger::IntakePipeline;
use flowgate_workflow::{
    Engine, InMemoryWorkflowRepository, Node, RunStatus, WorkflowGraph, WorkflowVersion,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().expect("failed to load configuration");
    tracing::info!(?settings, "Loaded configuration");

    let mut registry = ConnectorRegistry::new();
    registry
        .register(|| Box::new(EchoConnector) as Box<dyn Connector>)
        .expect("failed to register echo connector");
    let registry = Arc::new(registry);
    let repository = Arc::new(InMemoryWorkflowRepository::new());

    let engine = Engine::builder(Arc::clone(&registry), repository.clone())
        .with_config(settings.engine.clone())
        .with_admission(AdmissionController::new(&settings.admission))
        .build();
    let intake = IntakePipeline::new(engine.clone(), settings.intake.clone());

    let shutdown = CancellationToken::new();
    let pending_loop = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run_pending_loop(shutdown).await })
    };

    if settings.startup_check {
        startup_check(&intake, &repository).await;
    }

    tracing::info!(
        connectors = ?registry.connector_ids(),
        "Engine ready, press Ctrl-C to stop"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!(
        active_runs = engine.active_count(),
        pending_runs = engine.pending_count(),
        "Shutting down"
    );
    shutdown.cancel();
    if let Err(e) = pending_loop.await {
        tracing::warn!(error = %e, "Pending run loop ended abnormally");
    }
}

/// Runs a one-node echo workflow through manual intake and logs the result.
async fn startup_check(intake: &IntakePipeline, repository: &InMemoryWorkflowRepository) {
    let mut graph = WorkflowGraph::new();
    graph.add_node(
        Node::connector("echo", "echo", "echo")
            .with_parameters(json!({"message": "$trigger.message"})),
    );
    let version = WorkflowVersion::new("startup-check", graph);
    let version_id = version.id;
    repository.insert(version);

    let handle = match intake
        .handle_manual(version_id, json!({"message": "hello"}))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Startup check could not start a run");
            return;
        }
    };
    match handle.wait(Duration::from_secs(10)).await {
        Some(RunStatus::Succeeded) => {
            tracing::info!(run_id = %handle.run_id(), "Startup check succeeded");
        }
        Some(status) => {
            tracing::warn!(run_id = %handle.run_id(), %status, "Startup check run did not succeed");
        }
        None => {
            tracing::warn!(run_id = %handle.run_id(), "Startup check run did not finish in time");
        }
    }
}
