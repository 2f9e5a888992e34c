//! Slave health state machine.
//!
//! `NORMAL <-> DISKFULL` follows capacity on every heartbeat. A vote majority
//! moves a slave to `BAD` and heartbeat silence moves it to `DOWN`; both stick
//! until the slave is removed and registers again.
//!
//! Every operation takes `now` explicitly so sweeps are deterministic under test.

use super::registry::NodeRegistry;
use crate::error::{Result, SectorError};
use crate::types::{Address, SlaveId, SlaveNode, SlaveReport, SlaveStatus};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one bad/lost sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Newly promoted to BAD by vote majority.
    pub bad: Vec<Address>,
    /// Newly marked DOWN by heartbeat timeout.
    pub lost: Vec<Address>,
    /// DOWN and still within the retry window.
    pub retry: Vec<Address>,
    /// DOWN past the retry window; the caller should remove these.
    pub dead: Vec<Address>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.bad.is_empty() && self.lost.is_empty() && self.retry.is_empty() && self.dead.is_empty()
    }
}

/// A slave flagged by the storage balance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDeficit {
    /// Leaf cluster average free space minus the slave's free space.
    pub deficit: u64,
    pub address: Address,
}

/// Health transitions over a [`NodeRegistry`].
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    vote_expiry: Duration,
}

impl HealthMonitor {
    pub fn new(vote_expiry: Duration) -> Self {
        Self { vote_expiry }
    }

    /// Apply a heartbeat report.
    ///
    /// DOWN and BAD slaves are rejected: they must re-register.
    pub fn update_slave_info(
        &self,
        registry: &mut NodeRegistry,
        addr: &Address,
        report: &SlaveReport,
        now: Instant,
    ) -> Result<SlaveStatus> {
        let id = live_id(registry, addr)?;
        let min = registry.min_disk_space();

        registry.update_with(id, |node| {
            node.apply_report(report);
            node.last_update = now;
            apply_capacity_rule(node, min);
            node.status
        })
    }

    /// Refresh a slave's heartbeat time without a report.
    pub fn update_slave_ts(
        &self,
        registry: &mut NodeRegistry,
        addr: &Address,
        now: Instant,
    ) -> Result<()> {
        let id = live_id(registry, addr)?;
        registry.update_with(id, |node| node.last_update = now)
    }

    /// Record `voter`'s accusation against each of `accused`.
    ///
    /// Unknown accused addresses and self-votes are ignored. Returns the
    /// number of votes recorded.
    pub fn vote_bad_slaves(
        &self,
        registry: &mut NodeRegistry,
        voter: &Address,
        accused: &[Address],
        now: Instant,
    ) -> Result<usize> {
        let voter_id = registry
            .id_of(voter)
            .ok_or_else(|| SectorError::unknown_addr(voter))?;

        let mut recorded = 0;
        for addr in accused {
            let Some(id) = registry.id_of(addr) else {
                debug!(voter = %voter, accused = %addr, "Ignoring vote against unknown slave");
                continue;
            };
            if id == voter_id {
                continue;
            }
            registry.update_with(id, |node| {
                node.bad_votes.insert(voter_id);
                node.last_vote = now;
            })?;
            recorded += 1;
        }

        if recorded > 0 {
            debug!(voter = %voter, recorded, "Bad votes recorded");
        }
        Ok(recorded)
    }

    /// One sweep over every slave: expire stale votes, apply vote majorities,
    /// time out silent slaves, and bucket DOWN slaves by retry window.
    ///
    /// The vote threshold counts every registered slave, live or not.
    pub fn check_bad_and_lost(
        &self,
        registry: &mut NodeRegistry,
        timeout: Duration,
        retry_time: Duration,
        now: Instant,
    ) -> SweepReport {
        let total = registry.len();
        let mut report = SweepReport::default();

        for id in registry.ids() {
            let Some(node) = registry.get(id) else {
                continue;
            };
            let addr = node.address.clone();
            let silent = now.saturating_duration_since(node.last_update);

            if node.status == SlaveStatus::Down {
                if silent >= retry_time {
                    report.dead.push(addr);
                } else {
                    report.retry.push(addr);
                }
                continue;
            }

            let votes_stale = !node.bad_votes.is_empty()
                && now.saturating_duration_since(node.last_vote) > self.vote_expiry;
            let status = node.status;

            let outcome = registry.update_with(id, |node| {
                if votes_stale {
                    node.bad_votes.clear();
                }
                let mut promoted_bad = false;
                if status != SlaveStatus::Bad && node.bad_votes.len() * 2 > total {
                    node.status = SlaveStatus::Bad;
                    promoted_bad = true;
                }
                let lost = silent >= timeout;
                if lost {
                    node.status = SlaveStatus::Down;
                }
                (promoted_bad, lost, node.bad_votes.len())
            });

            match outcome {
                Ok((promoted_bad, lost, votes)) => {
                    if votes_stale {
                        debug!(slave_id = id, addr = %addr, "Stale bad votes cleared");
                    }
                    if promoted_bad {
                        warn!(slave_id = id, addr = %addr, votes, total, "Slave voted bad");
                        report.bad.push(addr.clone());
                    }
                    if lost {
                        warn!(
                            slave_id = id,
                            addr = %addr,
                            silent_secs = silent.as_secs(),
                            "Slave lost"
                        );
                        report.lost.push(addr);
                    }
                }
                Err(e) => debug!(slave_id = id, error = %e, "Slave vanished during sweep"),
            }
        }

        if !report.is_empty() {
            info!(
                bad = report.bad.len(),
                lost = report.lost.len(),
                retry = report.retry.len(),
                dead = report.dead.len(),
                "Health sweep complete"
            );
        }
        report
    }

    /// Flag NORMAL slaves sitting at or below the reserve floor while their
    /// leaf cluster has room elsewhere.
    ///
    /// Flagged slaves become DISKFULL with the warning flag set, and are not
    /// flagged again until a healthy heartbeat clears it. `force_clear` resets
    /// the flag on every NORMAL slave first. Results are sorted by deficit,
    /// largest first.
    pub fn check_storage_balance(
        &self,
        registry: &mut NodeRegistry,
        force_clear: bool,
    ) -> Vec<StorageDeficit> {
        let min = registry.min_disk_space();

        if force_clear {
            let normal: Vec<SlaveId> = registry
                .slaves()
                .filter(|n| n.status == SlaveStatus::Normal)
                .map(|n| n.id)
                .collect();
            for id in normal {
                if let Err(e) = registry.update_with(id, |node| node.disk_low_warning = false) {
                    debug!(slave_id = id, error = %e, "Slave vanished during balance check");
                }
            }
        }

        let leaves: Vec<Vec<SlaveId>> = registry
            .tree()
            .leaves()
            .into_iter()
            .map(|(_, members)| members.iter().copied().collect())
            .collect();

        let mut flagged = Vec::new();
        for members in leaves {
            let normal: Vec<&SlaveNode> = members
                .iter()
                .filter_map(|id| registry.get(*id))
                .filter(|n| n.status == SlaveStatus::Normal)
                .collect();
            if normal.is_empty() {
                continue;
            }
            let average =
                normal.iter().map(|n| n.available_disk_space).sum::<u64>() / normal.len() as u64;

            let low: Vec<(SlaveId, u64)> = normal
                .iter()
                .filter(|n| n.available_disk_space <= min && !n.disk_low_warning)
                .filter(|n| average > n.available_disk_space)
                .map(|n| (n.id, average - n.available_disk_space))
                .collect();

            for (id, deficit) in low {
                let flagged_addr = registry.update_with(id, |node| {
                    node.status = SlaveStatus::DiskFull;
                    node.disk_low_warning = true;
                    node.address.clone()
                });
                if let Ok(address) = flagged_addr {
                    warn!(slave_id = id, addr = %address, deficit, "Slave low on disk space");
                    flagged.push(StorageDeficit { deficit, address });
                }
            }
        }

        flagged.sort_by(|a, b| b.deficit.cmp(&a.deficit).then_with(|| a.address.cmp(&b.address)));
        flagged
    }
}

/// Resolve `addr` to a slave that still accepts heartbeats.
fn live_id(registry: &NodeRegistry, addr: &Address) -> Result<SlaveId> {
    let node = registry
        .by_address(addr)
        .ok_or_else(|| SectorError::unknown_addr(addr))?;
    match node.status {
        SlaveStatus::Down | SlaveStatus::Bad => Err(SectorError::SlaveRejected {
            addr: addr.clone(),
            status: node.status,
        }),
        _ => Ok(node.id),
    }
}

/// Capacity hysteresis: below the floor is DISKFULL, above it NORMAL, and
/// exactly at the floor keeps the current status.
fn apply_capacity_rule(node: &mut SlaveNode, min_disk_space: u64) {
    if node.available_disk_space < min_disk_space {
        node.status = SlaveStatus::DiskFull;
    } else if node.available_disk_space > min_disk_space {
        node.status = SlaveStatus::Normal;
        node.disk_low_warning = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;
    use std::sync::Arc;

    const MIN: u64 = 1000;
    const TIMEOUT: Duration = Duration::from_secs(300);
    const RETRY: Duration = Duration::from_secs(3600);

    fn setup(nodes: &[(&str, u64)]) -> (NodeRegistry, HealthMonitor, Instant) {
        let topo = StaticTopology::new(vec![0, 0])
            .with_rule("10.1.1.0/24", vec![1, 1])
            .unwrap()
            .with_rule("10.2.1.0/24", vec![2, 1])
            .unwrap();
        let mut reg = NodeRegistry::new(Arc::new(topo), MIN);
        let now = Instant::now();
        for (ip, avail) in nodes {
            let node = SlaveNode::new(Address::new(*ip, 6000), 6001, "/data", *avail, 0);
            reg.insert(node, now).unwrap();
        }
        (reg, HealthMonitor::new(Duration::from_secs(24 * 3600)), now)
    }

    fn addr(ip: &str) -> Address {
        Address::new(ip, 6000)
    }

    fn report(avail: u64) -> SlaveReport {
        SlaveReport {
            available_disk_space: avail,
            total_file_size: 42,
            ..Default::default()
        }
    }

    fn status(reg: &NodeRegistry, ip: &str) -> SlaveStatus {
        reg.by_address(&addr(ip)).unwrap().status
    }

    #[test]
    fn test_heartbeat_capacity_transitions() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN)]);
        let a = addr("10.1.1.5");

        hm.update_slave_info(&mut reg, &a, &report(MIN - 1), now).unwrap();
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::DiskFull);
        assert_eq!(reg.tree().root().total_nodes, 1);
        assert_eq!(reg.tree().root().available_disk_space, 0);

        // At the floor the status holds.
        hm.update_slave_info(&mut reg, &a, &report(MIN), now).unwrap();
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::DiskFull);

        hm.update_slave_info(&mut reg, &a, &report(3 * MIN), now).unwrap();
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::Normal);
        assert_eq!(reg.tree().root().available_disk_space, 2 * MIN);
        assert_eq!(reg.tree().root().total_file_size, 42);
    }

    #[test]
    fn test_heartbeat_rejected_for_down_and_bad() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN), ("10.1.1.6", 5 * MIN)]);
        let down = reg.id_of(&addr("10.1.1.5")).unwrap();
        let bad = reg.id_of(&addr("10.1.1.6")).unwrap();
        reg.update_with(down, |n| n.status = SlaveStatus::Down).unwrap();
        reg.update_with(bad, |n| n.status = SlaveStatus::Bad).unwrap();

        for ip in ["10.1.1.5", "10.1.1.6"] {
            let err = hm.update_slave_info(&mut reg, &addr(ip), &report(MIN), now).unwrap_err();
            assert!(matches!(err, SectorError::SlaveRejected { .. }));
            assert!(hm.update_slave_ts(&mut reg, &addr(ip), now).is_err());
        }
        // The rejected report was not applied.
        assert_eq!(reg.get(down).unwrap().available_disk_space, 5 * MIN);

        let err = hm.update_slave_ts(&mut reg, &addr("10.9.9.9"), now).unwrap_err();
        assert!(matches!(err, SectorError::SlaveNotFound(_)));
    }

    #[test]
    fn test_vote_majority_of_all_registered() {
        let (mut reg, hm, now) = setup(&[
            ("10.1.1.1", 5 * MIN),
            ("10.1.1.2", 5 * MIN),
            ("10.1.1.3", 5 * MIN),
            ("10.1.1.4", 5 * MIN),
        ]);
        let target = addr("10.1.1.4");

        // 2 of 4 is exactly half: not enough.
        for voter in ["10.1.1.1", "10.1.1.2"] {
            hm.vote_bad_slaves(&mut reg, &addr(voter), &[target.clone()], now).unwrap();
        }
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now);
        assert!(sweep.bad.is_empty());
        assert_eq!(status(&reg, "10.1.1.4"), SlaveStatus::Normal);

        hm.vote_bad_slaves(&mut reg, &addr("10.1.1.3"), &[target.clone()], now).unwrap();
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now);
        assert_eq!(sweep.bad, vec![target.clone()]);
        assert_eq!(status(&reg, "10.1.1.4"), SlaveStatus::Bad);
        assert_eq!(reg.tree().root().total_nodes, 3);

        // Reported once.
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now);
        assert!(sweep.bad.is_empty());
    }

    #[test]
    fn test_duplicate_and_self_votes_ignored() {
        let (mut reg, hm, now) = setup(&[("10.1.1.1", 5 * MIN), ("10.1.1.2", 5 * MIN)]);
        let voter = addr("10.1.1.1");

        let accused = [addr("10.1.1.2"), addr("10.1.1.2"), voter.clone(), addr("10.9.9.9")];
        let n = hm.vote_bad_slaves(&mut reg, &voter, &accused, now).unwrap();
        assert_eq!(n, 2);
        assert_eq!(reg.by_address(&addr("10.1.1.2")).unwrap().bad_votes.len(), 1);
        assert!(reg.by_address(&voter).unwrap().bad_votes.is_empty());

        let err = hm.vote_bad_slaves(&mut reg, &addr("10.9.9.9"), &[voter], now);
        assert!(err.is_err());
    }

    #[test]
    fn test_stale_votes_expire_en_masse() {
        let (mut reg, hm, now) = setup(&[
            ("10.1.1.1", 5 * MIN),
            ("10.1.1.2", 5 * MIN),
            ("10.1.1.3", 5 * MIN),
        ]);
        let target = addr("10.1.1.3");
        for voter in ["10.1.1.1", "10.1.1.2"] {
            hm.vote_bad_slaves(&mut reg, &addr(voter), &[target.clone()], now).unwrap();
        }

        // The majority went quiet for longer than the expiry window.
        let later = now + Duration::from_secs(25 * 3600);
        for ip in ["10.1.1.1", "10.1.1.2", "10.1.1.3"] {
            hm.update_slave_ts(&mut reg, &addr(ip), later).unwrap();
        }
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, later);
        assert!(sweep.bad.is_empty());
        assert!(reg.by_address(&target).unwrap().bad_votes.is_empty());

        // A fresh vote after expiry starts from zero.
        hm.vote_bad_slaves(&mut reg, &addr("10.1.1.2"), &[target.clone()], later).unwrap();
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, later);
        assert!(sweep.bad.is_empty());
        assert_eq!(reg.by_address(&target).unwrap().bad_votes.len(), 1);
    }

    #[test]
    fn test_timeout_then_retry_then_dead() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN), ("10.1.1.6", 5 * MIN)]);

        let t1 = now + TIMEOUT;
        hm.update_slave_ts(&mut reg, &addr("10.1.1.6"), t1).unwrap();
        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, t1);
        assert_eq!(sweep.lost, vec![addr("10.1.1.5")]);
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::Down);
        assert_eq!(status(&reg, "10.1.1.6"), SlaveStatus::Normal);
        assert_eq!(reg.tree().root().total_nodes, 1);

        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now + Duration::from_secs(600));
        assert_eq!(sweep.retry, vec![addr("10.1.1.5")]);
        assert!(!sweep.lost.contains(&addr("10.1.1.5")));

        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now + RETRY);
        assert_eq!(sweep.dead, vec![addr("10.1.1.5")]);
        // The sweep does not remove anything itself.
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_bad_slave_still_times_out() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN)]);
        let id = reg.id_of(&addr("10.1.1.5")).unwrap();
        reg.update_with(id, |n| n.status = SlaveStatus::Bad).unwrap();

        let sweep = hm.check_bad_and_lost(&mut reg, TIMEOUT, RETRY, now + TIMEOUT);
        assert_eq!(sweep.lost, vec![addr("10.1.1.5")]);
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::Down);
    }

    #[test]
    fn test_storage_balance_debounced() {
        let (mut reg, hm, now) = setup(&[
            ("10.1.1.5", 5 * MIN),
            ("10.1.1.6", 3 * MIN),
            ("10.2.1.5", MIN + 1),
        ]);
        let low = addr("10.1.1.5");
        // Drop to exactly the floor; the hysteresis keeps it NORMAL.
        hm.update_slave_info(&mut reg, &low, &report(MIN), now).unwrap();
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::Normal);

        let flagged = hm.check_storage_balance(&mut reg, false);
        assert_eq!(
            flagged,
            vec![StorageDeficit {
                deficit: (MIN + 3 * MIN) / 2 - MIN,
                address: low.clone(),
            }]
        );
        let node = reg.by_address(&low).unwrap();
        assert_eq!(node.status, SlaveStatus::DiskFull);
        assert!(node.disk_low_warning);

        assert!(hm.check_storage_balance(&mut reg, false).is_empty());
    }

    #[test]
    fn test_storage_balance_force_clear_and_heartbeat_reset() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN), ("10.1.1.6", 3 * MIN)]);
        let low = addr("10.1.1.5");
        hm.update_slave_info(&mut reg, &low, &report(MIN), now).unwrap();
        assert_eq!(hm.check_storage_balance(&mut reg, false).len(), 1);

        // A healthy heartbeat clears the flag; dropping again re-arms the check.
        hm.update_slave_info(&mut reg, &low, &report(2 * MIN), now).unwrap();
        assert!(!reg.by_address(&low).unwrap().disk_low_warning);
        hm.update_slave_info(&mut reg, &low, &report(MIN), now).unwrap();
        assert_eq!(hm.check_storage_balance(&mut reg, false).len(), 1);

        // Force clear only touches NORMAL slaves; the flagged one is DISKFULL now.
        assert!(hm.check_storage_balance(&mut reg, true).is_empty());
    }

    #[test]
    fn test_storage_balance_skips_lone_low_slave() {
        let (mut reg, hm, now) = setup(&[("10.1.1.5", 5 * MIN)]);
        hm.update_slave_info(&mut reg, &addr("10.1.1.5"), &report(MIN), now).unwrap();
        // Deficit against its own average is zero.
        assert!(hm.check_storage_balance(&mut reg, false).is_empty());
        assert_eq!(status(&reg, "10.1.1.5"), SlaveStatus::Normal);
    }
}
