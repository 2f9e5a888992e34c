//! Slave manager: the lock-protected facade the master's RPC layer calls.
//!
//! One coarse mutex guards the registry, its cluster tree, and the
//! tie-break RNG. Every operation runs entirely in memory under that lock.

use super::health::{HealthMonitor, StorageDeficit, SweepReport};
use super::placement::PlacementEngine;
use super::registry::NodeRegistry;
use super::tree::ClusterStat;
use super::wire::{self, ClusterRecord, SlaveRecord};
use crate::config::{HealthConfig, RegistryConfig, SectorConfig};
use crate::error::{Result, SectorError};
use crate::topology::{StaticTopology, Topology};
use crate::types::*;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Point-in-time registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub total: usize,
    pub normal: usize,
    pub diskfull: usize,
    pub bad: usize,
    pub down: usize,
    /// Top-level clusters holding slaves.
    pub clusters: usize,
    /// Free space above the reserve floor, serving slaves only.
    pub available_disk_space: u64,
    pub total_file_size: u64,
    pub last_change: u64,
}

struct ManagerState {
    registry: NodeRegistry,
    rng: StdRng,
}

/// Thread-safe slave manager.
pub struct SlaveManager {
    state: Mutex<ManagerState>,
    health: HealthMonitor,
    timeouts: HealthConfig,
}

impl SlaveManager {
    pub fn new(
        topology: Arc<dyn Topology>,
        registry: &RegistryConfig,
        health: &HealthConfig,
    ) -> Self {
        let rng = match registry.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: Mutex::new(ManagerState {
                registry: NodeRegistry::new(topology, registry.min_disk_space),
                rng,
            }),
            health: HealthMonitor::new(health.vote_expiry),
            timeouts: health.clone(),
        }
    }

    /// Build a manager with a [`StaticTopology`] from configuration.
    pub fn from_config(config: &SectorConfig) -> Result<Self> {
        config.validate()?;
        let topology = StaticTopology::from_config(&config.topology)?;
        info!(
            levels = topology.levels(),
            rules = config.topology.rules.len(),
            min_disk_space = config.registry.min_disk_space,
            "Slave manager configured"
        );
        Ok(Self::new(Arc::new(topology), &config.registry, &config.health))
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.timeouts
    }

    // Registration

    /// Register a slave; fails with [`SectorError::DuplicateSlave`] on overlap.
    pub fn register_slave(&self, node: SlaveNode) -> Result<SlaveId> {
        let mut state = self.state.lock();
        state.registry.insert(node, Instant::now())
    }

    pub fn remove_slave(&self, id: SlaveId) -> Result<SlaveNode> {
        self.state.lock().registry.remove(id)
    }

    pub fn remove_slave_by_addr(&self, addr: &Address) -> Result<SlaveNode> {
        let mut state = self.state.lock();
        let id = state
            .registry
            .id_of(addr)
            .ok_or_else(|| SectorError::unknown_addr(addr))?;
        state.registry.remove(id)
    }

    pub fn check_duplicate(&self, ip: &str, storage_path: &str) -> Option<(SlaveId, Address)> {
        self.state.lock().registry.check_duplicate(ip, storage_path)
    }

    // Heartbeats and votes

    /// Apply a heartbeat report; returns the slave's status afterwards.
    pub fn heartbeat(&self, addr: &Address, report: &SlaveReport) -> Result<SlaveStatus> {
        let mut state = self.state.lock();
        self.health
            .update_slave_info(&mut state.registry, addr, report, Instant::now())
    }

    pub fn update_slave_ts(&self, addr: &Address) -> Result<()> {
        let mut state = self.state.lock();
        self.health
            .update_slave_ts(&mut state.registry, addr, Instant::now())
    }

    pub fn vote_bad(&self, voter: &Address, accused: &[Address]) -> Result<usize> {
        let mut state = self.state.lock();
        self.health
            .vote_bad_slaves(&mut state.registry, voter, accused, Instant::now())
    }

    // Placement

    /// Choose one new replica location for a file already stored at `existing`.
    pub fn request_replica_target(
        &self,
        file_size: u64,
        existing: &BTreeSet<Address>,
        max_distance: Option<usize>,
        restrictions: &[TopoPath],
    ) -> Result<SlaveNode> {
        let mut state = self.state.lock();
        let ManagerState { registry, rng } = &mut *state;
        PlacementEngine::new(registry)
            .choose_replica_node(existing, file_size, max_distance, restrictions, rng)
            .cloned()
    }

    /// Choose the slaves to serve one file open, primary first.
    pub fn request_io_targets(
        &self,
        mode: OpenMode,
        existing: &BTreeSet<Address>,
        options: &IoOptions,
        max_distance: Option<usize>,
        restrictions: &[TopoPath],
    ) -> Result<Vec<SlaveNode>> {
        let mut state = self.state.lock();
        let ManagerState { registry, rng } = &mut *state;
        let nodes = PlacementEngine::new(registry).choose_io_nodes(
            existing,
            mode,
            options,
            max_distance,
            restrictions,
            rng,
        )?;
        Ok(nodes.into_iter().cloned().collect())
    }

    /// Choose the replica to drop from an over-replicated file.
    pub fn choose_less_replica(&self, locations: &[Address]) -> Result<Address> {
        let state = self.state.lock();
        PlacementEngine::new(&state.registry).choose_less_replica_node(locations)
    }

    // Sweeps

    /// Run one bad/lost sweep with explicit thresholds. Nothing is removed.
    pub fn check_bad_and_lost(&self, timeout: Duration, retry_time: Duration) -> SweepReport {
        let mut state = self.state.lock();
        self.health
            .check_bad_and_lost(&mut state.registry, timeout, retry_time, Instant::now())
    }

    /// Periodic health sweep: runs the bad/lost check with the configured
    /// thresholds and removes slaves past their retry window.
    pub fn sweep_health(&self) -> SweepReport {
        let mut state = self.state.lock();
        let report = self.health.check_bad_and_lost(
            &mut state.registry,
            self.timeouts.slave_timeout,
            self.timeouts.slave_retry_time,
            Instant::now(),
        );

        for addr in &report.dead {
            let Some(id) = state.registry.id_of(addr) else {
                continue;
            };
            match state.registry.remove(id) {
                Ok(_) => warn!(slave_id = id, addr = %addr, "Dead slave removed"),
                Err(e) => debug!(slave_id = id, error = %e, "Dead slave already gone"),
            }
        }
        report
    }

    pub fn update_cluster_stat(&self) {
        self.state.lock().registry.recompute_stats();
    }

    pub fn check_storage_balance(&self, force_clear: bool) -> Vec<StorageDeficit> {
        let mut state = self.state.lock();
        self.health.check_storage_balance(&mut state.registry, force_clear)
    }

    /// Periodic balance sweep: full statistics recomputation, then a
    /// debounced storage balance check.
    pub fn sweep_balance(&self) -> Vec<StorageDeficit> {
        let mut state = self.state.lock();
        state.registry.recompute_stats();
        self.health.check_storage_balance(&mut state.registry, false)
    }

    // Lookups

    pub fn get_slave_id(&self, addr: &Address) -> Option<SlaveId> {
        self.state.lock().registry.id_of(addr)
    }

    pub fn get_slave_addr(&self, id: SlaveId) -> Option<Address> {
        self.state.lock().registry.get(id).map(|n| n.address.clone())
    }

    pub fn get_slave(&self, id: SlaveId) -> Option<SlaveNode> {
        self.state.lock().registry.get(id).cloned()
    }

    /// Count one more in-flight transaction on the slave.
    pub fn inc_act_trans(&self, id: SlaveId) -> Result<u32> {
        self.state.lock().registry.update_with(id, |node| {
            node.active_transactions = node.active_transactions.saturating_add(1);
            node.active_transactions
        })
    }

    pub fn dec_act_trans(&self, id: SlaveId) -> Result<u32> {
        self.state.lock().registry.update_with(id, |node| {
            node.active_transactions = node.active_transactions.saturating_sub(1);
            node.active_transactions
        })
    }

    pub fn number_of_slaves(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn number_of_clusters(&self) -> usize {
        self.state.lock().registry.tree().top_level().len()
    }

    /// Fleet free space above the reserve floor.
    pub fn total_disk_space(&self) -> u64 {
        self.state.lock().registry.tree().root().available_disk_space
    }

    pub fn total_file_size(&self) -> u64 {
        self.state.lock().registry.tree().root().total_file_size
    }

    pub fn cluster_stat(&self, path: &[i32]) -> Option<ClusterStat> {
        self.state.lock().registry.tree().stat(path).cloned()
    }

    pub fn last_registry_change(&self) -> u64 {
        self.state.lock().registry.last_change()
    }

    /// All slaves, ordered by id.
    pub fn list_slaves(&self) -> Vec<SlaveNode> {
        self.state.lock().registry.slaves().cloned().collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        let registry = &state.registry;
        let mut snapshot = RegistrySnapshot {
            total: registry.len(),
            clusters: registry.tree().top_level().len(),
            available_disk_space: registry.tree().root().available_disk_space,
            total_file_size: registry.tree().root().total_file_size,
            last_change: registry.last_change(),
            ..Default::default()
        };
        for node in registry.slaves() {
            match node.status {
                SlaveStatus::Normal => snapshot.normal += 1,
                SlaveStatus::DiskFull => snapshot.diskfull += 1,
                SlaveStatus::Bad => snapshot.bad += 1,
                SlaveStatus::Down => snapshot.down += 1,
            }
        }
        snapshot
    }

    // Wire replies

    pub fn slave_records(&self) -> Vec<SlaveRecord> {
        self.state
            .lock()
            .registry
            .slaves()
            .map(SlaveRecord::from)
            .collect()
    }

    pub fn cluster_records(&self) -> Vec<ClusterRecord> {
        self.state
            .lock()
            .registry
            .tree()
            .top_level()
            .into_iter()
            .map(|(id, stat)| ClusterRecord::new(id, stat))
            .collect()
    }

    /// Legacy slave-list reply: every slave's record, back to back.
    pub fn serialize_slave_list(&self) -> Bytes {
        wire::encode_slave_list(&self.slave_records())
    }

    /// Legacy cluster-info reply: one record per top-level cluster.
    pub fn serialize_cluster_info(&self) -> Bytes {
        wire::encode_cluster_info(&self.cluster_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 1000;

    fn manager() -> SlaveManager {
        let topo = StaticTopology::new(vec![0, 0])
            .with_rule("10.1.1.0/24", vec![1, 1])
            .unwrap()
            .with_rule("10.1.2.0/24", vec![1, 2])
            .unwrap()
            .with_rule("10.2.1.0/24", vec![2, 1])
            .unwrap();
        let registry = RegistryConfig {
            min_disk_space: MIN,
            rng_seed: Some(3),
        };
        SlaveManager::new(Arc::new(topo), &registry, &HealthConfig::default())
    }

    fn register(mgr: &SlaveManager, ip: &str, avail: u64) -> SlaveId {
        mgr.register_slave(SlaveNode::new(Address::new(ip, 6000), 6001, "/data", avail, 10))
            .unwrap()
    }

    #[test]
    fn test_lookups() {
        let mgr = manager();
        let id = register(&mgr, "10.1.1.5", 2 * MIN);
        let addr = Address::new("10.1.1.5", 6000);

        assert_eq!(mgr.get_slave_id(&addr), Some(id));
        assert_eq!(mgr.get_slave_addr(id), Some(addr.clone()));
        assert_eq!(mgr.get_slave(id).unwrap().path, vec![1, 1]);
        assert_eq!(mgr.get_slave_addr(99), None);

        mgr.remove_slave_by_addr(&addr).unwrap();
        assert_eq!(mgr.get_slave_id(&addr), None);
        assert!(mgr.remove_slave_by_addr(&addr).is_err());
    }

    #[test]
    fn test_totals_and_snapshot() {
        let mgr = manager();
        register(&mgr, "10.1.1.5", 3 * MIN);
        register(&mgr, "10.1.2.5", 2 * MIN);
        let full = register(&mgr, "10.2.1.5", MIN);

        assert_eq!(mgr.number_of_slaves(), 3);
        assert_eq!(mgr.number_of_clusters(), 2);
        assert_eq!(mgr.total_disk_space(), 3 * MIN);
        assert_eq!(mgr.total_file_size(), 30);
        assert_eq!(mgr.cluster_stat(&[1]).unwrap().total_nodes, 2);

        let snap = mgr.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.normal, 2);
        assert_eq!(snap.diskfull, 1);
        assert_eq!(snap.last_change, 3);

        mgr.remove_slave(full).unwrap();
        assert_eq!(mgr.last_registry_change(), 4);
        assert_eq!(mgr.number_of_clusters(), 1);
    }

    #[test]
    fn test_active_transactions_saturate() {
        let mgr = manager();
        let id = register(&mgr, "10.1.1.5", 2 * MIN);

        assert_eq!(mgr.dec_act_trans(id).unwrap(), 0);
        assert_eq!(mgr.inc_act_trans(id).unwrap(), 1);
        assert_eq!(mgr.inc_act_trans(id).unwrap(), 2);
        assert_eq!(mgr.dec_act_trans(id).unwrap(), 1);
        assert!(mgr.inc_act_trans(77).is_err());
    }

    #[test]
    fn test_check_bad_and_lost_leaves_removal_to_caller() {
        let mgr = manager();
        register(&mgr, "10.1.1.5", 2 * MIN);

        let report = mgr.check_bad_and_lost(Duration::ZERO, Duration::from_secs(3600));
        assert_eq!(report.lost.len(), 1);

        let report = mgr.check_bad_and_lost(Duration::ZERO, Duration::ZERO);
        assert_eq!(report.dead.len(), 1);
        assert_eq!(mgr.number_of_slaves(), 1);
    }

    #[test]
    fn test_sweep_health_removes_dead() {
        let topo = StaticTopology::new(vec![0]);
        let registry = RegistryConfig {
            min_disk_space: MIN,
            rng_seed: Some(3),
        };
        let health = HealthConfig {
            slave_timeout: Duration::ZERO,
            slave_retry_time: Duration::ZERO,
            ..Default::default()
        };
        let mgr = SlaveManager::new(Arc::new(topo), &registry, &health);
        register(&mgr, "10.1.1.5", 2 * MIN);

        assert_eq!(mgr.sweep_health().lost.len(), 1);
        assert_eq!(mgr.snapshot().down, 1);

        let report = mgr.sweep_health();
        assert_eq!(report.dead, vec![Address::new("10.1.1.5", 6000)]);
        assert_eq!(mgr.number_of_slaves(), 0);
        assert_eq!(mgr.check_duplicate("10.1.1.5", "/data"), None);
    }

    #[test]
    fn test_replica_target_clones_node() {
        let mgr = manager();
        register(&mgr, "10.1.1.5", 2 * MIN);
        register(&mgr, "10.1.2.5", 2 * MIN);
        register(&mgr, "10.2.1.5", 2 * MIN);

        let existing = BTreeSet::from([Address::new("10.1.1.5", 6000)]);
        let node = mgr.request_replica_target(0, &existing, None, &[]).unwrap();
        assert_eq!(node.path, vec![2, 1]);
    }

    #[test]
    fn test_serialized_replies() {
        let mgr = manager();
        register(&mgr, "10.1.1.5", 2 * MIN);
        register(&mgr, "10.2.1.5", 2 * MIN);

        let slaves = wire::decode_slave_list(&mgr.serialize_slave_list()).unwrap();
        assert_eq!(slaves.len(), 2);
        assert_eq!(slaves[0].ip, "10.1.1.5");
        assert_eq!(slaves[1].leaf_cluster, 1);

        let clusters = wire::decode_cluster_info(&mgr.serialize_cluster_info()).unwrap();
        assert_eq!(clusters.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(clusters[0].available_disk_space, MIN as i64);
    }
}
