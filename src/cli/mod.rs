//! Command-line interface for the Sector master.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sector master - slave registry and replica placement.
#[derive(Parser)]
#[command(name = "sector-master")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "SECTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "SECTOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the master's slave manager
    Run {
        /// Address the RPC layer binds
        #[arg(long)]
        bind_addr: Option<String>,

        /// Reserve floor per slave in bytes
        #[arg(long)]
        min_disk_space: Option<u64>,

        /// Seed for placement tie-breaks
        #[arg(long)]
        seed: Option<u64>,

        /// Emit JSON logs
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate the configuration and print it
    CheckConfig,

    /// Print the topology path of each IP
    Lookup {
        /// IP addresses to resolve
        #[arg(required = true)]
        ips: Vec<String>,
    },

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
