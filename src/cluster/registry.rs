//! Slave registry: the authoritative slave table and its indices.
//!
//! Every mutation goes through the registry so that a slave is never visible
//! in the table without its contribution in the [`ClusterTree`], and vice versa.

use super::tree::{ClusterTree, Contribution};
use crate::error::{Result, SectorError};
use crate::topology::Topology;
use crate::types::{paths_overlap, Address, SlaveId, SlaveNode, SlaveStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Slave table, address index, duplicate-detection index, and cluster tree.
pub struct NodeRegistry {
    slaves: BTreeMap<SlaveId, SlaveNode>,
    by_address: BTreeMap<Address, SlaveId>,
    /// Storage roots registered per IP.
    ip_paths: HashMap<String, BTreeSet<String>>,
    tree: ClusterTree,
    topology: Arc<dyn Topology>,
    min_disk_space: u64,
    next_id: SlaveId,
    /// Bumped on every insert and remove.
    last_change: u64,
}

impl NodeRegistry {
    pub fn new(topology: Arc<dyn Topology>, min_disk_space: u64) -> Self {
        Self {
            slaves: BTreeMap::new(),
            by_address: BTreeMap::new(),
            ip_paths: HashMap::new(),
            tree: ClusterTree::new(),
            topology,
            min_disk_space,
            next_id: 1,
            last_change: 0,
        }
    }

    /// Find a registered slave on `ip` whose storage root overlaps `storage_path`.
    pub fn check_duplicate(&self, ip: &str, storage_path: &str) -> Option<(SlaveId, Address)> {
        let storage_path = crate::types::normalize_storage_path(storage_path);
        let roots = self.ip_paths.get(ip)?;
        if !roots.iter().any(|root| paths_overlap(root, &storage_path)) {
            return None;
        }
        self.slaves
            .values()
            .find(|s| s.address.ip == ip && paths_overlap(&s.storage_path, &storage_path))
            .map(|s| (s.id, s.address.clone()))
    }

    /// Register a slave and return its new id.
    pub fn insert(&mut self, mut node: SlaveNode, now: Instant) -> Result<SlaveId> {
        let overlap = self
            .check_duplicate(&node.address.ip, &node.storage_path)
            .or_else(|| {
                self.by_address
                    .get(&node.address)
                    .map(|&id| (id, node.address.clone()))
            });
        if let Some((existing_id, existing_addr)) = overlap {
            return Err(SectorError::DuplicateSlave {
                ip: node.address.ip.clone(),
                path: node.storage_path.clone(),
                existing_id,
                existing_addr,
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        node.id = id;
        node.path = self.topology.lookup(&node.address.ip);
        node.status = if node.available_disk_space > self.min_disk_space {
            SlaveStatus::Normal
        } else {
            SlaveStatus::DiskFull
        };
        node.last_update = now;
        node.last_vote = now;
        node.bad_votes.clear();
        node.active_transactions = 0;
        node.disk_low_warning = false;

        self.tree
            .attach(id, &node.path, Contribution::of(&node, self.min_disk_space));
        self.by_address.insert(node.address.clone(), id);
        self.ip_paths
            .entry(node.address.ip.clone())
            .or_default()
            .insert(node.storage_path.clone());

        info!(
            slave_id = id,
            addr = %node.address,
            storage_path = %node.storage_path,
            path = ?node.path,
            status = %node.status,
            "Slave registered"
        );

        self.slaves.insert(id, node);
        self.last_change += 1;
        Ok(id)
    }

    /// Unregister a slave and return its final record.
    pub fn remove(&mut self, id: SlaveId) -> Result<SlaveNode> {
        let node = self
            .slaves
            .remove(&id)
            .ok_or_else(|| SectorError::unknown_id(id))?;

        self.tree
            .detach(id, &node.path, Contribution::of(&node, self.min_disk_space));
        self.by_address.remove(&node.address);
        if let Some(roots) = self.ip_paths.get_mut(&node.address.ip) {
            roots.remove(&node.storage_path);
            if roots.is_empty() {
                self.ip_paths.remove(&node.address.ip);
            }
        }

        info!(slave_id = id, addr = %node.address, status = %node.status, "Slave removed");

        self.last_change += 1;
        Ok(node)
    }

    /// Mutate one slave, keeping the cluster tree in step with the change.
    pub fn update_with<R>(
        &mut self,
        id: SlaveId,
        f: impl FnOnce(&mut SlaveNode) -> R,
    ) -> Result<R> {
        let min = self.min_disk_space;
        let node = self
            .slaves
            .get_mut(&id)
            .ok_or_else(|| SectorError::unknown_id(id))?;

        let old_status = node.status;
        let before = Contribution::of(node, min);
        let result = f(node);
        let after = Contribution::of(node, min);

        if node.status != old_status {
            debug!(slave_id = id, old = %old_status, new = %node.status, "Slave status changed");
        }
        self.tree.replace(id, &node.path, before, after);
        Ok(result)
    }

    /// Full recomputation of cluster statistics, traffic included.
    pub fn recompute_stats(&mut self) {
        self.tree
            .recompute(&self.slaves, self.topology.as_ref(), self.min_disk_space);
    }

    pub fn get(&self, id: SlaveId) -> Option<&SlaveNode> {
        self.slaves.get(&id)
    }

    pub fn id_of(&self, addr: &Address) -> Option<SlaveId> {
        self.by_address.get(addr).copied()
    }

    pub fn by_address(&self, addr: &Address) -> Option<&SlaveNode> {
        self.id_of(addr).and_then(|id| self.slaves.get(&id))
    }

    pub fn slaves(&self) -> impl Iterator<Item = &SlaveNode> {
        self.slaves.values()
    }

    pub fn ids(&self) -> Vec<SlaveId> {
        self.slaves.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn tree(&self) -> &ClusterTree {
        &self.tree
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn min_disk_space(&self) -> u64 {
        self.min_disk_space
    }

    pub fn last_change(&self) -> u64 {
        self.last_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;

    const MIN: u64 = 1000;

    fn registry() -> NodeRegistry {
        let topo = StaticTopology::new(vec![0, 0])
            .with_rule("10.1.1.0/24", vec![1, 1])
            .unwrap()
            .with_rule("10.1.2.0/24", vec![1, 2])
            .unwrap();
        NodeRegistry::new(Arc::new(topo), MIN)
    }

    fn slave(ip: &str, port: u16, path: &str, avail: u64) -> SlaveNode {
        SlaveNode::new(Address::new(ip, port), port + 1, path, avail, 100)
    }

    #[test]
    fn test_insert_assigns_id_path_and_status() {
        let mut reg = registry();
        let now = Instant::now();

        let a = reg.insert(slave("10.1.1.5", 6000, "/data", 5000), now).unwrap();
        let b = reg.insert(slave("10.1.2.5", 6000, "/data", MIN), now).unwrap();

        assert_ne!(a, b);
        assert_eq!(reg.get(a).unwrap().path, vec![1, 1]);
        assert_eq!(reg.get(a).unwrap().status, SlaveStatus::Normal);
        assert_eq!(reg.get(b).unwrap().status, SlaveStatus::DiskFull);
        assert_eq!(reg.id_of(&Address::new("10.1.2.5", 6000)), Some(b));
        assert_eq!(reg.tree().root().total_nodes, 2);
        assert_eq!(reg.tree().root().available_disk_space, 4000);
        assert_eq!(reg.last_change(), 2);
    }

    #[test]
    fn test_duplicate_rejected_and_count_unchanged() {
        let mut reg = registry();
        let now = Instant::now();
        reg.insert(slave("10.1.1.5", 6000, "/data", 5000), now).unwrap();

        let err = reg
            .insert(slave("10.1.1.5", 6100, "/data/", 5000), now)
            .unwrap_err();
        assert!(matches!(err, SectorError::DuplicateSlave { existing_id: 1, .. }));

        // Nested roots overlap in either direction.
        assert!(reg.insert(slave("10.1.1.5", 6200, "/data/sub", 5000), now).is_err());
        assert!(reg.insert(slave("10.1.1.5", 6300, "/", 5000), now).is_err());
        assert_eq!(reg.len(), 1);

        // Same path on another host is fine.
        reg.insert(slave("10.1.1.6", 6000, "/data", 5000), now).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_same_address_rejected() {
        let mut reg = registry();
        let now = Instant::now();
        reg.insert(slave("10.1.1.5", 6000, "/a", 5000), now).unwrap();
        let err = reg.insert(slave("10.1.1.5", 6000, "/b", 5000), now).unwrap_err();
        assert!(matches!(err, SectorError::DuplicateSlave { .. }));
    }

    #[test]
    fn test_check_duplicate() {
        let mut reg = registry();
        let id = reg
            .insert(slave("10.1.1.5", 6000, "/data", 5000), Instant::now())
            .unwrap();
        assert_eq!(
            reg.check_duplicate("10.1.1.5", "/data/x"),
            Some((id, Address::new("10.1.1.5", 6000)))
        );
        assert_eq!(reg.check_duplicate("10.1.1.5", "/other"), None);
        assert_eq!(reg.check_duplicate("10.1.1.9", "/data"), None);
    }

    #[test]
    fn test_insert_remove_round_trip() {
        let mut reg = registry();
        let now = Instant::now();
        reg.insert(slave("10.1.1.5", 6000, "/data", 5000), now).unwrap();
        let before = reg.tree().root().clone();
        let leaf_before = reg.tree().stat(&[1, 1]).cloned();

        let id = reg.insert(slave("10.1.1.6", 6000, "/data", 9000), now).unwrap();
        reg.remove(id).unwrap();

        assert_eq!(reg.tree().root(), &before);
        assert_eq!(reg.tree().stat(&[1, 1]).cloned(), leaf_before);
        assert_eq!(reg.id_of(&Address::new("10.1.1.6", 6000)), None);
        assert_eq!(reg.check_duplicate("10.1.1.6", "/data"), None);
    }

    #[test]
    fn test_remove_unknown() {
        let mut reg = registry();
        assert!(matches!(reg.remove(42), Err(SectorError::SlaveNotFound(_))));
    }

    #[test]
    fn test_update_with_tracks_contribution() {
        let mut reg = registry();
        let id = reg
            .insert(slave("10.1.1.5", 6000, "/data", 5000), Instant::now())
            .unwrap();

        reg.update_with(id, |n| n.status = SlaveStatus::Down).unwrap();
        assert_eq!(reg.tree().root().total_nodes, 0);
        assert_eq!(reg.tree().root().available_disk_space, 0);

        // Removing a down slave leaves the tree empty, not underflowed.
        reg.remove(id).unwrap();
        assert_eq!(reg.tree().root().total_nodes, 0);
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let mut reg = registry();
        let now = Instant::now();
        let a = reg.insert(slave("10.1.1.5", 6000, "/data", 5000), now).unwrap();
        reg.insert(slave("10.1.2.5", 6000, "/data", 7000), now).unwrap();
        reg.update_with(a, |n| n.available_disk_space = 2500).unwrap();

        let incremental = reg.tree().root().clone();
        reg.recompute_stats();
        assert_eq!(reg.tree().root(), &incremental);
    }
}
