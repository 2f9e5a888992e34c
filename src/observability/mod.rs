//! Observability for the Sector master.
//!
//! Structured logging through `tracing` and registry gauges through `metrics`,
//! exported in Prometheus text format by [`run_metrics_server`].

use crate::cluster::RegistrySnapshot;
use crate::config::ObservabilityConfig;
use crate::error::{Result, SectorError};
use ::tracing::info;
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| SectorError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| SectorError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server until `shutdown_rx` fires.
pub async fn run_metrics_server(
    config: ObservabilityConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        SectorError::Internal(format!("Failed to install metrics recorder: {}", e))
    })?;

    record_registry_gauges(&RegistrySnapshot::default());

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    info!("Metrics server stopped");
    Ok(())
}

/// `/metrics` renders the recorder, `/health` answers `OK`.
fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }))
}

/// Publish registry counters as gauges.
pub fn record_registry_gauges(snapshot: &RegistrySnapshot) {
    gauge!("sector_slaves_total").set(snapshot.total as f64);
    gauge!("sector_slaves_normal").set(snapshot.normal as f64);
    gauge!("sector_slaves_diskfull").set(snapshot.diskfull as f64);
    gauge!("sector_slaves_bad").set(snapshot.bad as f64);
    gauge!("sector_slaves_down").set(snapshot.down as f64);
    gauge!("sector_clusters_total").set(snapshot.clusters as f64);
    gauge!("sector_available_disk_bytes").set(snapshot.available_disk_space as f64);
    gauge!("sector_stored_bytes").set(snapshot.total_file_size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_render_in_prometheus_format() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_registry_gauges(&RegistrySnapshot {
                total: 3,
                normal: 2,
                diskfull: 1,
                clusters: 2,
                ..Default::default()
            })
        });

        let text = handle.render();
        assert!(text.contains("sector_slaves_total 3"));
        assert!(text.contains("sector_slaves_diskfull 1"));
        assert!(text.contains("sector_clusters_total 2"));
    }

    #[tokio::test]
    async fn test_metrics_server_stops_on_shutdown() {
        let config = ObservabilityConfig {
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let (tx, rx) = broadcast::channel(1);
        let server = tokio::spawn(run_metrics_server(config, rx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_gauges_without_recorder() {
        record_registry_gauges(&RegistrySnapshot {
            total: 2,
            normal: 1,
            down: 1,
            ..Default::default()
        });
    }

    #[test]
    fn test_init_twice_fails() {
        let config = ObservabilityConfig::default();
        // Whichever call comes second in this process must fail.
        let first = init(&config);
        let second = init(&config);
        assert!(first.is_err() || second.is_err());
    }
}
