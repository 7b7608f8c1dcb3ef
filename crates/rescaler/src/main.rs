//! Rescaler - resource rescaling engine for serverless containers
//!
//! Consumes rescaling requests from the state store, applies them through
//! the host agents and keeps host capacity accounting in sync. Optionally
//! runs the structures snapshotter in the same process.

use anyhow::{Context, Result};
use rescaler_lib::{
    agent::HttpHostAgent,
    config::SCALER_SERVICE,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    rescaler::ScalerBuilder,
    snapshot::Snapshotter,
    store::CouchDbStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const RESCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting rescaler");

    let config = config::RescalerConfig::load()?;
    info!(couchdb_url = %config.couchdb_url, api_port = config.api_port, "Rescaler configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCALER).await;
    if config.snapshotter_enabled {
        health_registry.register(components::SNAPSHOTTER).await;
    }

    let logger = StructuredLogger::new(SCALER_SERVICE);
    logger.log_startup(RESCALER_VERSION, &config.couchdb_url);

    let store = Arc::new(
        CouchDbStore::new(&config.couchdb_url, config.timeout())
            .context("failed to create state store client")?,
    );
    let agent = Arc::new(
        HttpHostAgent::new(config.timeout()).context("failed to create host agent client")?,
    );

    let scaler = ScalerBuilder::new()
        .store(store.clone())
        .agent(agent.clone())
        .persist_policy(config.persist_policy())
        .max_restarts(config.max_restarts)
        .health(health_registry.clone())
        .build()?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    if config.snapshotter_enabled {
        let snapshotter = Snapshotter::new(store, agent, health_registry.clone());
        let shutdown = shutdown_tx.subscribe();
        let health = health_registry.clone();
        tokio::spawn(async move {
            if let Err(e) = snapshotter.run(shutdown).await {
                let message = format!("{e:#}");
                error!(error = %message, "Snapshotter stopped");
                health.set_unhealthy(components::SNAPSHOTTER, message).await;
            }
        });
    }

    let shutdown = shutdown_tx.subscribe();
    let mut scaler_handle = tokio::spawn(async move { scaler.run_with_restarts(shutdown).await });

    health_registry.set_ready(true).await;

    tokio::select! {
        joined = &mut scaler_handle => {
            let _ = shutdown_tx.send(());
            match joined.context("control loop task panicked")? {
                Ok(()) => logger.log_shutdown("control loop stopped"),
                Err(e) => {
                    logger.log_shutdown("control loop failed");
                    return Err(e);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            logger.log_shutdown("SIGINT received");
            let _ = shutdown_tx.send(());
            scaler_handle.await.context("control loop task panicked")??;
        }
    }

    info!("Shutting down");
    Ok(())
}
