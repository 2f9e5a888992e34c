//! Configuration integration tests
//!
//! Loading config files from disk and building a manager from them.

#[allow(dead_code)]
mod common;

use common::ConfigFile;
use sector::cluster::SlaveManager;
use sector::config::SectorConfig;
use sector::{Address, SectorError, SlaveNode};
use std::collections::BTreeSet;
use std::time::Duration;

const CONFIG: &str = r#"{
    "registry": { "min_disk_space": 1000, "rng_seed": 5 },
    "health": {
        "slave_timeout": "2m",
        "slave_retry_time": "1h",
        "vote_expiry": "24h",
        "sweep_interval": "10s",
        "balance_interval": "5m"
    },
    "topology": {
        "levels": 2,
        "default_path": "/0/0",
        "rules": [
            { "cidr": "192.168.1.0/24", "path": "/1/1" },
            { "cidr": "192.168.2.0/24", "path": "/2/1" }
        ]
    },
    "observability": { "log_level": "debug", "json_logs": true }
}"#;

#[test]
fn test_load_config_file() {
    let file = ConfigFile::write(CONFIG);
    let config = SectorConfig::from_file(&file.path).unwrap();

    assert_eq!(config.registry.min_disk_space, 1000);
    assert_eq!(config.health.slave_timeout, Duration::from_secs(120));
    assert_eq!(config.health.balance_interval, Duration::from_secs(300));
    assert_eq!(config.topology.rules.len(), 2);
    assert!(config.observability.json_logs);
    assert_eq!(config.master.bind_addr.port(), 6000);
    assert!(config.observability.metrics_enabled);
    assert_eq!(config.observability.metrics_addr.port(), 9090);
}

#[test]
fn test_manager_from_config_uses_topology() {
    let file = ConfigFile::write(CONFIG);
    let config = SectorConfig::from_file(&file.path).unwrap();
    let mgr = SlaveManager::from_config(&config).unwrap();

    for ip in ["192.168.1.10", "192.168.2.10", "172.16.0.1"] {
        mgr.register_slave(SlaveNode::new(Address::new(ip, 6000), 6001, "/srv", 5000, 0))
            .unwrap();
    }
    let id = mgr.get_slave_id(&Address::new("172.16.0.1", 6000)).unwrap();
    assert_eq!(mgr.get_slave(id).unwrap().path, vec![0, 0]);
    assert_eq!(mgr.number_of_clusters(), 3);

    let existing = BTreeSet::from([Address::new("192.168.1.10", 6000)]);
    let target = mgr.request_replica_target(100, &existing, None, &[vec![2]]).unwrap();
    assert_eq!(target.path, vec![2, 1]);
}

#[test]
fn test_invalid_config_rejected() {
    let file = ConfigFile::write(r#"{ "topology": { "levels": 2, "default_path": "/0" } }"#);
    assert!(matches!(
        SectorConfig::from_file(&file.path),
        Err(SectorError::InvalidConfig { .. })
    ));

    let file = ConfigFile::write(
        r#"{ "topology": {
            "levels": 1,
            "default_path": "/0",
            "rules": [
                { "cidr": "10.1.1.0/24", "path": "/1" },
                { "cidr": "rack7", "path": "/2" }
            ]
        } }"#,
    );
    assert!(matches!(
        SectorConfig::from_file(&file.path),
        Err(SectorError::InvalidConfig { field, .. }) if field == "topology.rules"
    ));

    let file = ConfigFile::write("{ not json");
    assert!(matches!(SectorConfig::from_file(&file.path), Err(SectorError::Config(_))));

    let missing = file.path.with_file_name("absent.json");
    assert!(SectorConfig::from_file(&missing).is_err());
}
