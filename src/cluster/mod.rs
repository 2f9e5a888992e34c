//! Slave management for the Sector master.
//!
//! This module handles:
//! - Slave registration and duplicate detection ([`NodeRegistry`])
//! - Topology-shaped capacity and traffic statistics ([`ClusterTree`])
//! - Replica and I/O node selection ([`PlacementEngine`])
//! - Failure votes, heartbeat timeouts, and storage balance ([`HealthMonitor`])
//! - The lock-protected facade and its periodic sweeps ([`SlaveManager`], [`Sweeper`])

mod health;
mod manager;
mod placement;
mod registry;
mod sweeper;
mod tree;
pub mod wire;

pub use health::{HealthMonitor, StorageDeficit, SweepReport};
pub use manager::{RegistrySnapshot, SlaveManager};
pub use placement::PlacementEngine;
pub use registry::NodeRegistry;
pub use sweeper::Sweeper;
pub use tree::{ClusterStat, ClusterTree, Contribution};
