//! Common test utilities for integration tests.

use sector::cluster::SlaveManager;
use sector::config::{HealthConfig, RegistryConfig};
use sector::topology::StaticTopology;
use sector::{Address, SlaveId, SlaveNode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Reserve floor used by every fixture.
pub const MIN_DISK: u64 = 10 * 1024 * 1024;

pub const SLAVE_PORT: u16 = 6000;

/// Two-level test topology:
///
/// ```text
/// 10.1.1.0/24 -> /1/1   10.1.2.0/24 -> /1/2
/// 10.2.1.0/24 -> /2/1   10.2.2.0/24 -> /2/2
/// everything else -> /0/0
/// ```
pub fn two_level_topology() -> StaticTopology {
    StaticTopology::new(vec![0, 0])
        .with_rule("10.1.1.0/24", vec![1, 1])
        .and_then(|t| t.with_rule("10.1.2.0/24", vec![1, 2]))
        .and_then(|t| t.with_rule("10.2.1.0/24", vec![2, 1]))
        .and_then(|t| t.with_rule("10.2.2.0/24", vec![2, 2]))
        .expect("valid test topology")
}

pub fn addr(ip: &str) -> Address {
    Address::new(ip, SLAVE_PORT)
}

pub fn slave(ip: &str, storage_path: &str, available: u64) -> SlaveNode {
    SlaveNode::new(addr(ip), SLAVE_PORT + 1, storage_path, available, 0)
}

/// Builds a manager over the two-level topology and registers slaves.
pub struct FleetBuilder {
    health: HealthConfig,
    seed: u64,
    slaves: Vec<(String, u64)>,
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self {
            health: HealthConfig::default(),
            seed: 42,
            slaves: Vec::new(),
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn timeouts(mut self, timeout: Duration, retry: Duration) -> Self {
        self.health.slave_timeout = timeout;
        self.health.slave_retry_time = retry;
        self
    }

    /// Add a slave with `available` bytes free under `/data`.
    pub fn slave(mut self, ip: &str, available: u64) -> Self {
        self.slaves.push((ip.to_string(), available));
        self
    }

    pub fn build(self) -> (Arc<SlaveManager>, Vec<SlaveId>) {
        let registry = RegistryConfig {
            min_disk_space: MIN_DISK,
            rng_seed: Some(self.seed),
        };
        let manager = Arc::new(SlaveManager::new(
            Arc::new(two_level_topology()),
            &registry,
            &self.health,
        ));
        let ids = self
            .slaves
            .iter()
            .map(|(ip, available)| {
                manager
                    .register_slave(slave(ip, "/data", *available))
                    .expect("fixture slave registers")
            })
            .collect();
        (manager, ids)
    }
}

impl Default for FleetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Temporary directory holding one config file.
pub struct ConfigFile {
    _dir: TempDir,
    pub path: PathBuf,
}

impl ConfigFile {
    pub fn write(contents: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("sector.json");
        std::fs::write(&path, contents).expect("Failed to write config");
        Self { _dir: dir, path }
    }
}
