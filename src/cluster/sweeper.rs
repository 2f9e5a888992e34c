//! Background health and balance sweeps.

use super::manager::SlaveManager;
use crate::observability;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Drives the periodic sweeps of a [`SlaveManager`].
pub struct Sweeper {
    manager: Arc<SlaveManager>,
    sweep_interval: Duration,
    balance_interval: Duration,
}

impl Sweeper {
    pub fn new(manager: Arc<SlaveManager>) -> Self {
        let config = manager.health_config();
        let (sweep_interval, balance_interval) = (config.sweep_interval, config.balance_interval);
        Self {
            manager,
            sweep_interval,
            balance_interval,
        }
    }

    /// One health tick: bad/lost sweep and dead slave removal.
    pub fn health_tick(&self) {
        let report = self.manager.sweep_health();
        for addr in &report.retry {
            debug!(addr = %addr, "Down slave waiting for retry window");
        }
        observability::record_registry_gauges(&self.manager.snapshot());
    }

    /// One balance tick: statistics recomputation and storage balance check.
    pub fn balance_tick(&self) {
        let deficits = self.manager.sweep_balance();
        if !deficits.is_empty() {
            warn!(flagged = deficits.len(), "Storage imbalance detected");
        }
        observability::record_registry_gauges(&self.manager.snapshot());
    }

    /// Run until `shutdown_rx` fires.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut health = tokio::time::interval(self.sweep_interval);
        let mut balance = tokio::time::interval(self.balance_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        balance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            balance_interval_ms = self.balance_interval.as_millis() as u64,
            "Sweeper starting"
        );

        loop {
            tokio::select! {
                _ = health.tick() => self.health_tick(),
                _ = balance.tick() => self.balance_tick(),
                _ = shutdown_rx.recv() => {
                    info!("Sweeper shutting down");
                    break;
                }
            }
        }
    }
}
