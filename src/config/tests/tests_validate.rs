//! Tests for `DbConfig` defaults and validation.

use crate::config::{DbConfig, WalSyncMode};

#[test]
fn default_config_is_valid() {
    assert!(DbConfig::default().validate().is_ok());
}

#[test]
fn zero_memtable_size_is_rejected() {
    let config = DbConfig {
        memtable_size: 0,
        ..DbConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn l0_thresholds_must_be_ordered() {
    let config = DbConfig {
        l0_compaction_trigger: 4,
        l0_slowdown: 3,
        ..DbConfig::default()
    };
    assert!(config.validate().is_err());

    let config = DbConfig {
        l0_slowdown: 8,
        l0_stop: 7,
        ..DbConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn zero_sync_interval_is_rejected() {
    let config = DbConfig {
        wal_sync_mode: WalSyncMode::IntervalMs(0),
        ..DbConfig::default()
    };
    assert!(config.validate().is_err());

    let config = DbConfig {
        wal_sync_mode: WalSyncMode::IntervalMs(50),
        ..DbConfig::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn small_size_ratio_is_rejected() {
    let config = DbConfig {
        size_ratio: 1,
        ..DbConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn target_level_bytes_grows_by_ratio() {
    let config = DbConfig {
        level0_size: 100,
        size_ratio: 10,
        ..DbConfig::default()
    };
    assert_eq!(config.target_level_bytes(1), 100);
    assert_eq!(config.target_level_bytes(2), 1_000);
    assert_eq!(config.target_level_bytes(3), 10_000);
}
