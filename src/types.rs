//! Core type definitions for the Sector master.
//!
//! # Key Types
//!
//! - [`Address`]: `(ip, port)` key a slave registers and heartbeats under
//! - [`SlaveNode`]: registry record for one storage daemon
//! - [`SlaveStatus`]: per-slave liveness state
//! - [`SlaveReport`]: capacity and traffic figures pushed with each heartbeat
//!
//! # Type Aliases
//!
//! - [`SlaveId`] = `u32`: registry-assigned slave identifier
//! - [`TopoPath`] = `Vec<i32>`: cluster ids from the fleet root down to the leaf cluster
//!
//! # Examples
//!
//! ```rust
//! use sector::types::{normalize_storage_path, paths_overlap, Address};
//!
//! let addr: Address = "10.0.0.7:6000".parse().unwrap();
//! assert_eq!(addr.ip, "10.0.0.7");
//!
//! assert_eq!(normalize_storage_path("//data/./sector/"), "/data/sector");
//! assert!(paths_overlap("/data", "/data/sector"));
//! assert!(!paths_overlap("/data", "/database"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Unique identifier for a registered slave.
pub type SlaveId = u32;

/// Topology path: cluster ids from the root to the leaf cluster.
pub type TopoPath = Vec<i32>;

/// Network address of a slave. Ordered by `(ip, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address '{}'", s))?;
        if ip.is_empty() {
            return Err(format!("missing ip in address '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in address '{}': {}", s, e))?;
        Ok(Self::new(ip, port))
    }
}

/// Slave liveness state.
///
/// `Normal <-> DiskFull` follows capacity on every heartbeat. `Bad` is set by a
/// vote majority and `Down` by heartbeat timeout; neither is left automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlaveStatus {
    Normal,
    DiskFull,
    Bad,
    Down,
}

impl SlaveStatus {
    /// Wire code used in legacy slave-list records.
    pub fn code(&self) -> i64 {
        match self {
            SlaveStatus::Normal => 1,
            SlaveStatus::DiskFull => 2,
            SlaveStatus::Bad => 3,
            SlaveStatus::Down => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(SlaveStatus::Normal),
            2 => Some(SlaveStatus::DiskFull),
            3 => Some(SlaveStatus::Bad),
            4 => Some(SlaveStatus::Down),
            _ => None,
        }
    }

    /// Whether the slave counts toward cluster capacity and can serve reads.
    pub fn is_serving(&self) -> bool {
        matches!(self, SlaveStatus::Normal | SlaveStatus::DiskFull)
    }
}

impl fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlaveStatus::Normal => "NORMAL",
            SlaveStatus::DiskFull => "DISKFULL",
            SlaveStatus::Bad => "BAD",
            SlaveStatus::Down => "DOWN",
        };
        f.write_str(name)
    }
}

/// Capacity and traffic figures carried by a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveReport {
    /// Slave-local timestamp of the report (seconds since epoch).
    pub timestamp: i64,
    /// Raw free space in bytes, not reduced by the reserve floor.
    pub available_disk_space: u64,
    /// Bytes of file data stored on the slave.
    pub total_file_size: u64,
    pub mem_used: u64,
    pub cpu_used: u64,
    /// Bytes received from / sent to other slaves, keyed by peer IP.
    pub sys_in: BTreeMap<String, u64>,
    pub sys_out: BTreeMap<String, u64>,
    /// Bytes received from / sent to clients, keyed by peer IP.
    pub cli_in: BTreeMap<String, u64>,
    pub cli_out: BTreeMap<String, u64>,
}

/// Registry record for one storage daemon.
#[derive(Debug, Clone)]
pub struct SlaveNode {
    pub id: SlaveId,
    pub address: Address,
    pub data_port: u16,
    /// Normalized absolute storage root.
    pub storage_path: String,

    /// Topology path, resolved on insert.
    pub path: TopoPath,

    pub available_disk_space: u64,
    pub total_file_size: u64,
    pub mem_used: u64,
    pub cpu_used: u64,
    pub sys_in: BTreeMap<String, u64>,
    pub sys_out: BTreeMap<String, u64>,
    pub cli_in: BTreeMap<String, u64>,
    pub cli_out: BTreeMap<String, u64>,
    pub report_timestamp: i64,

    pub status: SlaveStatus,
    pub last_update: Instant,
    pub last_vote: Instant,
    /// Ids of slaves that voted this one bad.
    pub bad_votes: BTreeSet<SlaveId>,
    pub active_transactions: u32,
    /// Set when the balance check flagged this slave; cleared by a healthy heartbeat.
    pub disk_low_warning: bool,
}

impl SlaveNode {
    /// Build an unregistered record. Id, path, and status are assigned by the registry.
    pub fn new(
        address: Address,
        data_port: u16,
        storage_path: &str,
        available_disk_space: u64,
        total_file_size: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: 0,
            address,
            data_port,
            storage_path: normalize_storage_path(storage_path),
            path: Vec::new(),
            available_disk_space,
            total_file_size,
            mem_used: 0,
            cpu_used: 0,
            sys_in: BTreeMap::new(),
            sys_out: BTreeMap::new(),
            cli_in: BTreeMap::new(),
            cli_out: BTreeMap::new(),
            report_timestamp: 0,
            status: SlaveStatus::Normal,
            last_update: now,
            last_vote: now,
            bad_votes: BTreeSet::new(),
            active_transactions: 0,
            disk_low_warning: false,
        }
    }

    /// Free space above the reserve floor.
    #[inline]
    pub fn usable_space(&self, min_disk_space: u64) -> u64 {
        self.available_disk_space.saturating_sub(min_disk_space)
    }

    /// Whether the slave can take `size` more bytes without crossing the floor.
    #[inline]
    pub fn can_hold(&self, size: u64, min_disk_space: u64) -> bool {
        self.available_disk_space >= min_disk_space.saturating_add(size)
    }

    pub fn leaf_cluster(&self) -> i32 {
        self.path.last().copied().unwrap_or(0)
    }

    /// Total bytes received, slave and client traffic combined.
    pub fn total_in(&self) -> u64 {
        self.sys_in.values().chain(self.cli_in.values()).sum()
    }

    /// Total bytes sent, slave and client traffic combined.
    pub fn total_out(&self) -> u64 {
        self.sys_out.values().chain(self.cli_out.values()).sum()
    }

    pub(crate) fn apply_report(&mut self, report: &SlaveReport) {
        self.report_timestamp = report.timestamp;
        self.available_disk_space = report.available_disk_space;
        self.total_file_size = report.total_file_size;
        self.mem_used = report.mem_used;
        self.cpu_used = report.cpu_used;
        self.sys_in = report.sys_in.clone();
        self.sys_out = report.sys_out.clone();
        self.cli_in = report.cli_in.clone();
        self.cli_out = report.cli_out.clone();
    }
}

/// File open mode as requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, OpenMode::Read)
    }
}

/// Client-side hints for choosing I/O nodes.
#[derive(Debug, Clone, Default)]
pub struct IoOptions {
    /// IP the client connects from; nearest replica wins.
    pub client_ip: String,
    /// Space to reserve on each chosen node for a new file.
    pub reserved_size: u64,
    /// Total replicas wanted for a new file.
    pub replica_num: usize,
    /// Only place a new file under these topology paths.
    pub cluster: Vec<TopoPath>,
}

/// Normalize a storage root: absolute, no empty or `.` segments, `..` resolved.
pub fn normalize_storage_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether two normalized storage roots contain one another.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    fn contains(outer: &str, inner: &str) -> bool {
        if outer == "/" || outer == inner {
            return true;
        }
        inner
            .strip_prefix(outer)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }
    contains(a, b) || contains(b, a)
}
