//! Placement engine: picks slaves to hold or serve file replicas.
//!
//! Selection never mutates the registry. Every selector returns
//! [`SectorError::NoDisk`] when nothing qualifies; callers retry later.

use super::registry::NodeRegistry;
use crate::error::{Result, SectorError};
use crate::topology::{path_allowed, Topology};
use crate::types::*;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Placement engine over a borrowed registry snapshot.
///
/// The caller holds the registry lock for the engine's whole lifetime, so a
/// multi-step selection sees one consistent view.
pub struct PlacementEngine<'a> {
    registry: &'a NodeRegistry,
}

impl<'a> PlacementEngine<'a> {
    pub fn new(registry: &'a NodeRegistry) -> Self {
        Self { registry }
    }

    fn topology(&self) -> &'a dyn Topology {
        self.registry.topology()
    }

    fn min_disk_space(&self) -> u64 {
        self.registry.min_disk_space()
    }

    /// Choose a new replica location as far as possible from `existing`.
    ///
    /// Candidates are bucketed by their distance to the nearest existing
    /// replica and the farthest non-empty bucket wins. `max_distance` caps
    /// the accepted distance; `restrictions` limits candidates to the given
    /// topology subtrees.
    pub fn choose_replica_node<R: Rng + ?Sized>(
        &self,
        existing: &BTreeSet<Address>,
        file_size: u64,
        max_distance: Option<usize>,
        restrictions: &[TopoPath],
        rng: &mut R,
    ) -> Result<&'a SlaveNode> {
        let topology = self.topology();
        let min = self.min_disk_space();

        let existing_paths: Vec<TopoPath> = existing
            .iter()
            .map(|addr| match self.registry.by_address(addr) {
                Some(node) => node.path.clone(),
                None => topology.lookup(&addr.ip),
            })
            .collect();
        let used_ips: BTreeSet<&str> = existing.iter().map(|addr| addr.ip.as_str()).collect();

        let mut buckets: BTreeMap<usize, Vec<&'a SlaveNode>> = BTreeMap::new();
        for node in self.registry.slaves() {
            if node.status != SlaveStatus::Normal || existing.contains(&node.address) {
                continue;
            }
            if !node.can_hold(file_size, min) || !path_allowed(restrictions, &node.path) {
                continue;
            }

            let level = topology.min_distance(&node.path, &existing_paths);
            if max_distance.map_or(false, |max| level > max) {
                continue;
            }
            // Never on the same leaf as a replica, nor on a replica's host next door.
            if level == 0 || (level == 1 && used_ips.contains(node.address.ip.as_str())) {
                continue;
            }
            buckets.entry(level).or_default().push(node);
        }

        let (level, candidates) = buckets
            .into_iter()
            .next_back()
            .ok_or_else(|| SectorError::NoDisk("no slave can hold a new replica".to_string()))?;

        let chosen = tie_break(candidates, rng);
        debug!(
            slave_id = chosen.id,
            addr = %chosen.address,
            level,
            file_size,
            "Replica target chosen"
        );
        Ok(chosen)
    }

    /// Choose the slaves a client should talk to for one file open.
    ///
    /// With existing replicas, the nearest serving replica comes first; writes
    /// fan out to every other serving replica after it. A new file gets a
    /// primary near the client plus up to `replica_num - 1` spread replicas.
    pub fn choose_io_nodes<R: Rng + ?Sized>(
        &self,
        existing: &BTreeSet<Address>,
        mode: OpenMode,
        options: &IoOptions,
        max_distance: Option<usize>,
        restrictions: &[TopoPath],
        rng: &mut R,
    ) -> Result<Vec<&'a SlaveNode>> {
        if !existing.is_empty() {
            let replicas: Vec<&'a SlaveNode> = existing
                .iter()
                .filter_map(|addr| self.registry.by_address(addr))
                .filter(|node| node.status.is_serving())
                .collect();

            let primary = self.find_nearest_node(&replicas, &options.client_ip, rng)?;
            let mut nodes = vec![primary];
            if !mode.is_read_only() {
                nodes.extend(replicas.into_iter().filter(|n| n.id != primary.id));
            }
            return Ok(nodes);
        }

        let min = self.min_disk_space();
        let candidates: Vec<&'a SlaveNode> = self
            .registry
            .slaves()
            .filter(|node| node.status == SlaveStatus::Normal)
            .filter(|node| node.can_hold(options.reserved_size, min))
            .filter(|node| path_allowed(&options.cluster, &node.path))
            .filter(|node| path_allowed(restrictions, &node.path))
            .collect();

        let primary = self.find_nearest_node(&candidates, &options.client_ip, rng)?;
        let mut nodes = vec![primary];
        let mut locations: BTreeSet<Address> = BTreeSet::from([primary.address.clone()]);

        let wanted = options.replica_num.max(1);
        while nodes.len() < wanted {
            match self.choose_replica_node(
                &locations,
                options.reserved_size,
                max_distance,
                restrictions,
                rng,
            ) {
                Ok(node) => {
                    locations.insert(node.address.clone());
                    nodes.push(node);
                }
                Err(_) => break,
            }
        }

        debug!(
            primary = %primary.address,
            replicas = nodes.len(),
            wanted,
            "I/O targets chosen for new file"
        );
        Ok(nodes)
    }

    /// Choose the replica to drop from an over-replicated file.
    ///
    /// Drops the replica whose removal leaves the largest minimum pairwise
    /// distance among the rest; ties drop the slave with the least free space.
    pub fn choose_less_replica_node(&self, locations: &[Address]) -> Result<Address> {
        let nodes: Vec<&SlaveNode> = locations
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|addr| self.registry.by_address(addr))
            .collect();

        if nodes.len() <= 1 {
            return nodes
                .first()
                .map(|node| node.address.clone())
                .ok_or_else(|| {
                    SectorError::SlaveNotFound(
                        "no registered slave among replica locations".to_string(),
                    )
                });
        }

        let mut best: Option<(usize, u64, &SlaveNode)> = None;
        for (skip, &candidate) in nodes.iter().enumerate() {
            let rest: Vec<&SlaveNode> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, node)| *node)
                .collect();
            let spread = self.min_pairwise_distance(&rest);
            let space = candidate.available_disk_space;

            let better = match best {
                None => true,
                Some((best_spread, best_space, _)) => {
                    spread > best_spread || (spread == best_spread && space < best_space)
                }
            };
            if better {
                best = Some((spread, space, candidate));
            }
        }

        best.map(|(_, _, node)| node.address.clone())
            .ok_or_else(|| SectorError::Internal("no replica chosen for removal".to_string()))
    }

    /// Choose the candidate nearest to `hint_ip`, least busy among equals.
    pub fn find_nearest_node<R: Rng + ?Sized>(
        &self,
        candidates: &[&'a SlaveNode],
        hint_ip: &str,
        rng: &mut R,
    ) -> Result<&'a SlaveNode> {
        let topology = self.topology();
        let hint_path = topology.lookup(hint_ip);

        let mut buckets: BTreeMap<usize, Vec<&'a SlaveNode>> = BTreeMap::new();
        for &node in candidates {
            let distance = if node.address.ip == hint_ip {
                0
            } else {
                topology.distance(&hint_path, &node.path)
            };
            buckets.entry(distance).or_default().push(node);
        }

        buckets
            .into_values()
            .next()
            .map(|nearest| least_busy(&nearest, rng))
            .ok_or_else(|| SectorError::NoDisk("no slave available for I/O".to_string()))
    }

    fn min_pairwise_distance(&self, nodes: &[&SlaveNode]) -> usize {
        let topology = self.topology();
        let mut min = usize::MAX;
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let distance = if a.address.ip == b.address.ip {
                    0
                } else {
                    topology.distance(&a.path, &b.path)
                };
                min = min.min(distance);
            }
        }
        min
    }
}

/// Keep the roomier half of `candidates`, then pick the least busy of those.
fn tie_break<'a, R: Rng + ?Sized>(
    mut candidates: Vec<&'a SlaveNode>,
    rng: &mut R,
) -> &'a SlaveNode {
    candidates.sort_by(|a, b| {
        b.available_disk_space
            .cmp(&a.available_disk_space)
            .then(a.id.cmp(&b.id))
    });
    candidates.truncate(candidates.len().div_ceil(2));
    least_busy(&candidates, rng)
}

/// Circular scan from a random start for the fewest active transactions.
///
/// `candidates` must be non-empty.
fn least_busy<'a, R: Rng + ?Sized>(candidates: &[&'a SlaveNode], rng: &mut R) -> &'a SlaveNode {
    let len = candidates.len();
    let start = rng.gen_range(0..len);
    let mut best = candidates[start];
    for offset in 0..len {
        let node = candidates[(start + offset) % len];
        if node.active_transactions == 0 {
            return node;
        }
        if node.active_transactions < best.active_transactions {
            best = node;
        }
    }
    best
}
