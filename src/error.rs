//! Error types for the Sector master.
//!
//! This module provides a unified error type [`SectorError`] for registry,
//! placement, and health operations, along with a convenient [`Result`] alias.
//!
//! # Error Categories
//!
//! - **Placement**: no node satisfies capacity or topology constraints
//! - **Registry**: duplicate registrations, unknown slaves, rejected heartbeats
//! - **Topology**: unparseable cluster/location restriction strings
//! - **Configuration**: invalid settings or unreadable config files
//!
//! # Example
//!
//! ```rust
//! use sector::error::{Result, SectorError};
//!
//! fn pick(candidates: &[u32]) -> Result<u32> {
//!     candidates
//!         .first()
//!         .copied()
//!         .ok_or_else(|| SectorError::NoDisk("no candidate".into()))
//! }
//!
//! let err = pick(&[]).unwrap_err();
//! assert!(err.is_retryable());
//! ```

use crate::types::{Address, SlaveId, SlaveStatus};
use std::io;
use thiserror::Error;

/// Main error type for Sector master operations.
#[derive(Error, Debug)]
pub enum SectorError {
    // Placement errors
    #[error("No slave has enough disk space: {0}")]
    NoDisk(String),

    // Registry errors
    #[error("Slave {ip}:{path} overlaps existing slave {existing_id} at {existing_addr}")]
    DuplicateSlave {
        ip: String,
        path: String,
        existing_id: SlaveId,
        existing_addr: Address,
    },

    #[error("Slave not found: {0}")]
    SlaveNotFound(String),

    #[error("Slave {addr} rejected while {status}")]
    SlaveRejected { addr: Address, status: SlaveStatus },

    // Topology errors
    #[error("Invalid topology restriction: {0}")]
    InvalidTopologyRestriction(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SectorError {
    /// Check if error is retryable.
    ///
    /// Only placement failures qualify: the cluster may gain space or nodes later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SectorError::NoDisk(_))
    }

    /// Shorthand for an unknown slave id.
    pub fn unknown_id(id: SlaveId) -> Self {
        SectorError::SlaveNotFound(format!("id {}", id))
    }

    /// Shorthand for an unknown slave address.
    pub fn unknown_addr(addr: &Address) -> Self {
        SectorError::SlaveNotFound(addr.to_string())
    }
}

impl From<bincode::Error> for SectorError {
    fn from(e: bincode::Error) -> Self {
        SectorError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SectorError {
    fn from(e: serde_json::Error) -> Self {
        SectorError::Serialization(e.to_string())
    }
}

/// Result type alias for Sector operations.
pub type Result<T> = std::result::Result<T, SectorError>;
