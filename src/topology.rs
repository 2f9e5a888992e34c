//! Network topology: maps slave IPs onto a fixed-depth cluster hierarchy.
//!
//! The master only consumes topology through the [`Topology`] trait. The
//! bundled [`StaticTopology`] resolves IPs with a longest-prefix CIDR rule
//! table loaded from configuration.

use crate::config::TopologyConfig;
use crate::error::{Result, SectorError};
use crate::types::TopoPath;
use std::net::Ipv4Addr;

/// Topology lookups and distances.
///
/// Paths have exactly [`levels`](Topology::levels) entries; the last one is the
/// leaf cluster id. Distance counts the levels below the deepest shared
/// ancestor, so two slaves in the same leaf cluster are at distance 0.
pub trait Topology: Send + Sync {
    /// Number of entries in every path.
    fn levels(&self) -> usize;

    /// Resolve an IP to its topology path.
    fn lookup(&self, ip: &str) -> TopoPath;

    /// Distance between two paths. Paths of mismatched length are treated
    /// as farther apart than any valid pair.
    fn distance(&self, a: &[i32], b: &[i32]) -> usize {
        if a.len() != b.len() {
            return self.levels() + 1;
        }
        let common = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
        a.len() - common
    }

    /// Distance between two IPs; identical IPs are at distance 0.
    fn distance_ip(&self, a: &str, b: &str) -> usize {
        if a == b {
            return 0;
        }
        self.distance(&self.lookup(a), &self.lookup(b))
    }

    /// Smallest distance from `path` to any of `others`.
    fn min_distance(&self, path: &[i32], others: &[TopoPath]) -> usize {
        others
            .iter()
            .map(|other| self.distance(path, other))
            .min()
            .unwrap_or(self.levels() + 1)
    }
}

#[derive(Debug, Clone)]
struct CidrRule {
    network: u32,
    prefix_len: u32,
    path: TopoPath,
}

impl CidrRule {
    fn matches(&self, ip: u32) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix_len);
        ip & mask == self.network & mask
    }
}

/// Rule-table topology. IPs matching no rule (or not IPv4) land on the default path.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    levels: usize,
    default_path: TopoPath,
    rules: Vec<CidrRule>,
}

impl StaticTopology {
    /// A topology with no rules: every slave shares `default_path`.
    pub fn new(default_path: TopoPath) -> Self {
        Self {
            levels: default_path.len(),
            default_path,
            rules: Vec::new(),
        }
    }

    /// Add a `a.b.c.d/n -> path` rule.
    pub fn with_rule(mut self, cidr: &str, path: TopoPath) -> Result<Self> {
        self.add_rule(cidr, path)?;
        Ok(self)
    }

    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        if config.levels == 0 {
            return Err(SectorError::InvalidConfig {
                field: "topology.levels".to_string(),
                reason: "Topology needs at least one level".to_string(),
            });
        }
        let default_path = parse_topo(&config.default_path)?;
        if default_path.len() != config.levels {
            return Err(SectorError::InvalidConfig {
                field: "topology.default_path".to_string(),
                reason: format!("Expected {} levels, got {}", config.levels, default_path.len()),
            });
        }

        let mut topology = Self::new(default_path);
        for rule in &config.rules {
            let path = parse_topo(&rule.path)?;
            topology.add_rule(&rule.cidr, path)?;
        }
        Ok(topology)
    }

    fn add_rule(&mut self, cidr: &str, path: TopoPath) -> Result<()> {
        if path.len() != self.levels {
            return Err(SectorError::InvalidConfig {
                field: "topology.rules".to_string(),
                reason: format!(
                    "Rule {} has {} levels, topology has {}",
                    cidr,
                    path.len(),
                    self.levels
                ),
            });
        }
        let (network, prefix_len) = parse_cidr(cidr)?;
        self.rules.push(CidrRule {
            network,
            prefix_len,
            path,
        });
        // Longest prefix first so lookup can stop at the first match.
        self.rules.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
        Ok(())
    }
}

impl Topology for StaticTopology {
    fn levels(&self) -> usize {
        self.levels
    }

    fn lookup(&self, ip: &str) -> TopoPath {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return self.default_path.clone();
        };
        let ip = u32::from(addr);
        self.rules
            .iter()
            .find(|rule| rule.matches(ip))
            .map(|rule| rule.path.clone())
            .unwrap_or_else(|| self.default_path.clone())
    }
}

fn parse_cidr(cidr: &str) -> Result<(u32, u32)> {
    let invalid = |reason: &str| SectorError::InvalidConfig {
        field: "topology.rules".to_string(),
        reason: format!("Bad CIDR '{}': {}", cidr, reason),
    };

    let (ip, len) = cidr.split_once('/').unwrap_or((cidr, "32"));
    let addr: Ipv4Addr = ip.trim().parse().map_err(|_| invalid("not an IPv4 address"))?;
    let prefix_len: u32 = len.trim().parse().map_err(|_| invalid("bad prefix length"))?;
    if prefix_len > 32 {
        return Err(invalid("prefix length above 32"));
    }
    Ok((u32::from(addr), prefix_len))
}

/// Parse a topology path string such as `/1/3`.
///
/// `/` alone is the empty path (the whole fleet).
pub fn parse_topo(s: &str) -> Result<TopoPath> {
    let s = s.trim();
    let rest = s.strip_prefix('/').ok_or_else(|| {
        SectorError::InvalidTopologyRestriction(format!("'{}' must start with '/'", s))
    })?;

    rest.split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            seg.parse::<i32>()
                .ok()
                .filter(|id| *id >= 0)
                .ok_or_else(|| {
                    SectorError::InvalidTopologyRestriction(format!(
                        "'{}' has non-numeric cluster id '{}'",
                        s, seg
                    ))
                })
        })
        .collect()
}

/// Parse a comma or whitespace separated list of topology paths.
pub fn parse_topo_list(s: &str) -> Result<Vec<TopoPath>> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(parse_topo)
        .collect()
}

/// Whether `path` lies under any of `restrictions`. An empty list allows everything.
pub fn path_allowed(restrictions: &[TopoPath], path: &[i32]) -> bool {
    restrictions.is_empty() || restrictions.iter().any(|r| path.starts_with(r))
}
