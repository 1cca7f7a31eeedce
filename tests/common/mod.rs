//! Shared setup for tests that launch the real `rig-node` and `rig-bridge`
//! binaries.

#![allow(dead_code)]

use std::path::PathBuf;

use clusterrig::config::Config;

pub fn rig_node() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rig-node"))
}

pub fn rig_bridge() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rig-bridge"))
}

/// Defaults with the test binaries and tight timings.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.binaries.server = rig_node();
    config.binaries.router = rig_node();
    config.binaries.bridge = rig_bridge();

    config.timeouts.startup_ms = 20_000;
    config.timeouts.startup_poll_ms = 50;
    config.timeouts.convergence_ms = 60_000;
    config.timeouts.poll_interval_ms = 100;
    config.timeouts.command_ms = 1_000;
    config.timeouts.shutdown_grace_ms = 5_000;

    config.replica_pair.data_node.election_timeout_ms = 1_000;
    config.replica_pair.data_node.heartbeat_interval_ms = 200;
    config.data.process_logs = false;
    config
}
