//! Sector - slave registry and replica placement for a distributed file system master.
//!
//! The master tracks every storage slave's health and capacity, maps slaves onto a
//! hierarchical network topology, and decides which slaves hold or serve each file's
//! replicas while detecting failed slaves and storage pressure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RPC layer (external): register | heartbeat | open | vote   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SlaveManager: one coarse lock, seeded tie-break RNG        │
//! ├──────────────┬──────────────────┬───────────────────────────┤
//! │ NodeRegistry │ PlacementEngine  │ HealthMonitor             │
//! │ ClusterTree  │                  │ Sweeper (tokio task)      │
//! ├──────────────┴──────────────────┴───────────────────────────┤
//! │  Topology: ip -> path, distance                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use sector::config::SectorConfig;
//!
//! #[tokio::main]
//! async fn main() -> sector::Result<()> {
//!     let config = SectorConfig::development();
//!     sector::run(config).await
//! }
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod observability;
pub mod topology;
pub mod types;

// Re-exports
pub use error::{Result, SectorError};
pub use types::*;

use cluster::{SlaveManager, Sweeper};
use config::SectorConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Run the master's slave manager and sweeper until a shutdown signal.
pub async fn run(config: SectorConfig) -> Result<()> {
    observability::init(&config.observability)?;

    let manager = Arc::new(SlaveManager::from_config(&config)?);
    info!(bind_addr = %config.master.bind_addr, "Starting Sector master");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = tokio::spawn(Sweeper::new(manager.clone()).run(shutdown_rx));

    let metrics = if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        let metrics_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config, metrics_rx).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    wait_for_signal().await?;
    info!("Shutting down Sector master gracefully...");

    let _ = shutdown_tx.send(());
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    if let Some(metrics) = metrics {
        if let Err(e) = metrics.await {
            warn!(error = %e, "Metrics task ended abnormally");
        }
    }

    let snapshot = manager.snapshot();
    info!(
        slaves = snapshot.total,
        down = snapshot.down,
        "Sector master shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
