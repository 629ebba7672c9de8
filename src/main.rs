// src/main.rs
//! Parrot Workload Replay Engine
//!
//! Streams captured database workload events through the controller and
//! replays them against the configured target with per-session order and
//! timing fidelity.

use anyhow::Result;
use parrot_engine::controller::consumer::{EventConsumer, ReplayConsumer};
use parrot_engine::controller::controller::WorkloadController;
use parrot_engine::controller::summary::WorkloadSummary;
use parrot_engine::events::source::build_source;
use parrot_engine::observability::{init_metrics, init_tracing};
use parrot_engine::replay::connection::build_factory;
use parrot_engine::utils::config::EngineConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, metrics, logging)
    init_tracing()?;
    let metrics_handle = init_metrics()?;

    info!(
        "Starting Parrot Workload Replay Engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    // Build the source, the replay target, and the consumers
    let source = build_source(&config.source)?;
    let factory = build_factory(&config.target)?;
    let cancel = CancellationToken::new();

    let replay = Arc::new(ReplayConsumer::new(&config, factory, &cancel)?);
    let mut controller = WorkloadController::new(source, &config.controller, &cancel);
    controller.add_consumer(Arc::clone(&replay) as Arc<dyn EventConsumer>);
    if config.controller.enable_summary {
        controller.add_consumer(Arc::new(WorkloadSummary::new()));
    }

    // Graceful shutdown handler
    let shutdown_cancel = controller.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
        shutdown_cancel.cancel();
    });

    // Run the controller to completion
    match controller.run().await {
        Ok(report) => {
            let queue = replay.queue_stats();
            let registry = replay.registry_stats();
            info!(
                "Replay finished: {} events read, {} dispatched, {} workers created, {} chunks spilled",
                report.events_read,
                registry.dispatched,
                registry.workers_created,
                queue.spilled_chunks
            );
            debug!("Final metrics:\n{}", metrics_handle.render());
            Ok(())
        }
        Err(e) => {
            error!("Engine error: {}", e);
            Err(e.into())
        }
    }
}
