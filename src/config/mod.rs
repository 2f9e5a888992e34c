//! Configuration module for the Sector master.

use crate::error::{Result, SectorError};
use crate::topology::StaticTopology;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a Sector master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectorConfig {
    /// Master process configuration.
    #[serde(default)]
    pub master: MasterConfig,
    /// Slave registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Failure detection and balance sweeps.
    #[serde(default)]
    pub health: HealthConfig,
    /// Topology rule table.
    #[serde(default)]
    pub topology: TopologyConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SectorConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SectorError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SectorError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        // Builds the rule table, so bad levels, paths and CIDRs all surface here.
        StaticTopology::from_config(&self.topology)?;

        if self.health.slave_retry_time < self.health.slave_timeout {
            return Err(SectorError::InvalidConfig {
                field: "health.slave_retry_time".to_string(),
                reason: "Retry time must not be shorter than the slave timeout".to_string(),
            });
        }

        if self.health.sweep_interval.is_zero() || self.health.balance_interval.is_zero() {
            return Err(SectorError::InvalidConfig {
                field: "health.sweep_interval".to_string(),
                reason: "Sweep intervals must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            master: MasterConfig {
                bind_addr: "127.0.0.1:6000".parse().expect("valid socket address"),
            },
            registry: RegistryConfig {
                min_disk_space: 64 * 1024 * 1024,
                rng_seed: Some(1),
            },
            health: HealthConfig {
                slave_timeout: Duration::from_secs(30),
                slave_retry_time: Duration::from_secs(120),
                vote_expiry: Duration::from_secs(24 * 3600),
                sweep_interval: Duration::from_secs(5),
                balance_interval: Duration::from_secs(30),
            },
            topology: TopologyConfig::default(),
            observability: ObservabilityConfig {
                metrics_enabled: false,
                metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Master process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Address the master's RPC layer binds.
    pub bind_addr: SocketAddr,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6000".parse().expect("valid socket address"),
        }
    }
}

/// Slave registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Reserve floor in bytes; placement never fills a slave below it.
    pub min_disk_space: u64,
    /// Seed for placement tie-breaks. Entropy when unset.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_disk_space: 10 * 1024 * 1024 * 1024, // 10GB
            rng_seed: None,
        }
    }
}

/// Failure detection and balance sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat silence after which a slave is marked down.
    #[serde(with = "humantime_serde")]
    pub slave_timeout: Duration,
    /// Silence after which a down slave is removed.
    #[serde(with = "humantime_serde")]
    pub slave_retry_time: Duration,
    /// Bad votes are dropped after this long without a new vote.
    #[serde(with = "humantime_serde")]
    pub vote_expiry: Duration,
    /// How often to run the bad/lost sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How often to recompute cluster stats and check storage balance.
    #[serde(with = "humantime_serde")]
    pub balance_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            slave_timeout: Duration::from_secs(300),
            slave_retry_time: Duration::from_secs(3600),
            vote_expiry: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(30),
            balance_interval: Duration::from_secs(300),
        }
    }
}

/// Topology rule table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Number of entries in each topology path.
    pub levels: usize,
    /// Path for IPs that match no rule, e.g. `/0/0`.
    pub default_path: String,
    /// CIDR rules, longest prefix wins.
    #[serde(default)]
    pub rules: Vec<TopologyRule>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            levels: 1,
            default_path: "/0".to_string(),
            rules: Vec::new(),
        }
    }
}

/// One `cidr -> path` topology rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyRule {
    pub cidr: String,
    pub path: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Metrics bind address.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
            metrics_addr: default_metrics_addr(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
