//! Hierarchical cluster statistics mirroring the topology.
//!
//! Clusters live in a flat arena and link to their children by index, so
//! walking a path never holds more than one mutable borrow.

use crate::topology::Topology;
use crate::types::{SlaveId, SlaveNode, TopoPath};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const ROOT: usize = 0;

/// Aggregated statistics for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStat {
    /// Serving (NORMAL or DISKFULL) slaves in the subtree.
    pub total_nodes: u64,
    /// Free space above the reserve floor.
    pub available_disk_space: u64,
    pub total_file_size: u64,
    /// Bytes crossing into the cluster, keyed by outside peer IP.
    pub traffic_in: BTreeMap<String, u64>,
    /// Bytes crossing out of the cluster, keyed by outside peer IP.
    pub traffic_out: BTreeMap<String, u64>,
}

impl ClusterStat {
    pub fn total_in(&self) -> u64 {
        self.traffic_in.values().sum()
    }

    pub fn total_out(&self) -> u64 {
        self.traffic_out.values().sum()
    }
}

/// What one slave adds to every cluster on its path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contribution {
    pub nodes: u64,
    pub space: u64,
    pub file_size: u64,
}

impl Contribution {
    /// Contribution of `node` in its current state. BAD and DOWN slaves add nothing.
    pub fn of(node: &SlaveNode, min_disk_space: u64) -> Self {
        if !node.status.is_serving() {
            return Self::default();
        }
        Self {
            nodes: 1,
            space: node.usable_space(min_disk_space),
            file_size: node.total_file_size,
        }
    }
}

#[derive(Debug, Clone)]
struct Cluster {
    id: i32,
    path: TopoPath,
    children: BTreeMap<i32, usize>,
    /// Registered slaves in this leaf, any status.
    members: BTreeSet<SlaveId>,
    /// Registered slaves in the subtree, any status.
    slave_count: usize,
    stat: ClusterStat,
}

impl Cluster {
    fn new(id: i32, path: TopoPath) -> Self {
        Self {
            id,
            path,
            children: BTreeMap::new(),
            members: BTreeSet::new(),
            slave_count: 0,
            stat: ClusterStat::default(),
        }
    }
}

/// Traffic one slave added to one cluster during the last recompute.
#[derive(Debug, Clone)]
struct Crossing {
    cluster: usize,
    peer: String,
    bytes: u64,
    inbound: bool,
}

/// Cluster tree rooted at the whole fleet.
#[derive(Debug, Clone)]
pub struct ClusterTree {
    clusters: Vec<Cluster>,
    /// Per-slave traffic currently counted in `clusters`.
    crossings: BTreeMap<SlaveId, Vec<Crossing>>,
}

impl ClusterTree {
    pub fn new() -> Self {
        Self {
            clusters: vec![Cluster::new(0, Vec::new())],
            crossings: BTreeMap::new(),
        }
    }

    /// Fleet-wide statistics.
    pub fn root(&self) -> &ClusterStat {
        &self.clusters[ROOT].stat
    }

    /// Statistics of the cluster at `path`, if it exists.
    pub fn stat(&self, path: &[i32]) -> Option<&ClusterStat> {
        self.find(path).map(|idx| &self.clusters[idx].stat)
    }

    /// Registered slaves of the leaf cluster at `path`.
    pub fn members(&self, path: &[i32]) -> Option<&BTreeSet<SlaveId>> {
        self.find(path).map(|idx| &self.clusters[idx].members)
    }

    /// Top-level clusters that still hold registered slaves.
    pub fn top_level(&self) -> Vec<(i32, &ClusterStat)> {
        self.clusters[ROOT]
            .children
            .values()
            .map(|&idx| &self.clusters[idx])
            .filter(|c| c.slave_count > 0)
            .map(|c| (c.id, &c.stat))
            .collect()
    }

    /// Leaf clusters that hold registered slaves, with their members.
    pub fn leaves(&self) -> Vec<(&TopoPath, &BTreeSet<SlaveId>)> {
        self.clusters
            .iter()
            .filter(|c| !c.members.is_empty())
            .map(|c| (&c.path, &c.members))
            .collect()
    }

    /// Place `id` in its leaf cluster and add its contribution along the path.
    pub fn attach(&mut self, id: SlaveId, path: &[i32], contribution: Contribution) {
        let chain = self.ensure_path(path);
        for &idx in &chain {
            let cluster = &mut self.clusters[idx];
            cluster.slave_count += 1;
            add(&mut cluster.stat, &contribution);
        }
        if let Some(&leaf) = chain.last() {
            self.clusters[leaf].members.insert(id);
        }
    }

    /// Inverse of [`attach`](Self::attach). Also withdraws the slave's traffic.
    pub fn detach(&mut self, id: SlaveId, path: &[i32], contribution: Contribution) {
        self.withdraw_traffic(id);
        let chain = self.chain(path);
        for &idx in &chain {
            let cluster = &mut self.clusters[idx];
            cluster.slave_count = cluster.slave_count.saturating_sub(1);
            sub(&mut cluster.stat, &contribution);
        }
        if let Some(&leaf) = chain.last() {
            self.clusters[leaf].members.remove(&id);
        }
    }

    /// Swap one slave's old contribution for its new one along the path.
    ///
    /// A slave that stops serving loses its traffic along with its capacity.
    pub fn replace(&mut self, id: SlaveId, path: &[i32], old: Contribution, new: Contribution) {
        if new.nodes == 0 {
            self.withdraw_traffic(id);
        }
        if old == new {
            return;
        }
        for idx in self.chain(path) {
            let stat = &mut self.clusters[idx].stat;
            sub(stat, &old);
            add(stat, &new);
        }
    }

    /// Full bottom-up recomputation from the slave table.
    ///
    /// Traffic is only counted at clusters it actually crosses: a peer whose
    /// path lies inside a cluster's subtree does not count for that cluster.
    pub fn recompute(
        &mut self,
        slaves: &BTreeMap<SlaveId, SlaveNode>,
        topology: &dyn Topology,
        min_disk_space: u64,
    ) {
        for cluster in &mut self.clusters {
            cluster.stat = ClusterStat::default();
        }
        self.crossings.clear();

        let mut peer_paths: BTreeMap<&str, TopoPath> = BTreeMap::new();

        for (&id, node) in slaves {
            if !node.status.is_serving() {
                continue;
            }
            let contribution = Contribution::of(node, min_disk_space);
            let chain = self.chain(&node.path);
            let mut crossings = Vec::new();

            for (peers, inbound) in [
                (&node.sys_in, true),
                (&node.cli_in, true),
                (&node.sys_out, false),
                (&node.cli_out, false),
            ] {
                for (peer, &bytes) in peers {
                    let peer_path = peer_paths
                        .entry(peer.as_str())
                        .or_insert_with(|| topology.lookup(peer));
                    for &idx in &chain {
                        let cluster = &mut self.clusters[idx];
                        if peer_path.starts_with(&cluster.path) {
                            continue;
                        }
                        let traffic = if inbound {
                            &mut cluster.stat.traffic_in
                        } else {
                            &mut cluster.stat.traffic_out
                        };
                        *traffic.entry(peer.clone()).or_insert(0) += bytes;
                        crossings.push(Crossing {
                            cluster: idx,
                            peer: peer.clone(),
                            bytes,
                            inbound,
                        });
                    }
                }
            }
            if !crossings.is_empty() {
                self.crossings.insert(id, crossings);
            }

            for &idx in &chain {
                add(&mut self.clusters[idx].stat, &contribution);
            }
        }

        debug!(
            clusters = self.clusters.len(),
            nodes = self.root().total_nodes,
            available = self.root().available_disk_space,
            "Cluster statistics recomputed"
        );
    }

    /// Take the traffic `id` added at the last recompute back out of every cluster.
    fn withdraw_traffic(&mut self, id: SlaveId) {
        let Some(crossings) = self.crossings.remove(&id) else {
            return;
        };
        for crossing in crossings {
            let stat = &mut self.clusters[crossing.cluster].stat;
            let traffic = if crossing.inbound {
                &mut stat.traffic_in
            } else {
                &mut stat.traffic_out
            };
            if let Some(total) = traffic.get_mut(&crossing.peer) {
                *total = total.saturating_sub(crossing.bytes);
                if *total == 0 {
                    traffic.remove(&crossing.peer);
                }
            }
        }
    }

    fn find(&self, path: &[i32]) -> Option<usize> {
        let mut idx = ROOT;
        for id in path {
            idx = *self.clusters[idx].children.get(id)?;
        }
        Some(idx)
    }

    /// Indices from root to the deepest existing cluster on `path`.
    fn chain(&self, path: &[i32]) -> Vec<usize> {
        let mut chain = Vec::with_capacity(path.len() + 1);
        let mut idx = ROOT;
        chain.push(idx);
        for id in path {
            match self.clusters[idx].children.get(id) {
                Some(&child) => {
                    idx = child;
                    chain.push(idx);
                }
                None => break,
            }
        }
        chain
    }

    fn ensure_path(&mut self, path: &[i32]) -> Vec<usize> {
        let mut chain = Vec::with_capacity(path.len() + 1);
        let mut idx = ROOT;
        chain.push(idx);
        for (depth, &id) in path.iter().enumerate() {
            idx = match self.clusters[idx].children.get(&id) {
                Some(&child) => child,
                None => {
                    let child = self.clusters.len();
                    self.clusters.push(Cluster::new(id, path[..=depth].to_vec()));
                    self.clusters[idx].children.insert(id, child);
                    child
                }
            };
            chain.push(idx);
        }
        chain
    }
}

impl Default for ClusterTree {
    fn default() -> Self {
        Self::new()
    }
}

fn add(stat: &mut ClusterStat, c: &Contribution) {
    stat.total_nodes += c.nodes;
    stat.available_disk_space += c.space;
    stat.total_file_size += c.file_size;
}

fn sub(stat: &mut ClusterStat, c: &Contribution) {
    stat.total_nodes = stat.total_nodes.saturating_sub(c.nodes);
    stat.available_disk_space = stat.available_disk_space.saturating_sub(c.space);
    stat.total_file_size = stat.total_file_size.saturating_sub(c.file_size);
}
