//! Configuration loading and types for the harness.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section is optional: a missing file section
//! falls back to the documented defaults, so `Config::default()` and an
//! empty YAML document describe the same harness.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::ClusterTopology;
use crate::options::{ArbiterOptions, DataNodeOptions};
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Executables the harness launches.
    #[serde(default)]
    pub binaries: BinaryConfig,

    /// Retry budgets and poll cadence.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Port range handed to the allocator.
    #[serde(default)]
    pub ports: PortConfig,

    /// Where node data directories and process logs live.
    #[serde(default)]
    pub data: DataConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Replica pair scenario settings.
    #[serde(default)]
    pub replica_pair: ReplicaPairSettings,

    /// Routed cluster topology.
    #[serde(default)]
    pub cluster: ClusterTopology,
}

/// Paths of the external executables.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryConfig {
    /// Server binary for data-bearing, arbiter and config processes.
    #[serde(default = "default_server_binary")]
    pub server: PathBuf,

    /// Router binary.
    #[serde(default = "default_server_binary")]
    pub router: PathBuf,

    /// Relay binary used for every link.
    #[serde(default = "default_bridge_binary")]
    pub bridge: PathBuf,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            server: default_server_binary(),
            router: default_server_binary(),
            bridge: default_bridge_binary(),
        }
    }
}

/// Timeouts, expressed in milliseconds in the YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Budget for a started process to accept connections.
    #[serde(default = "default_startup_ms")]
    pub startup_ms: u64,

    /// Delay between startup connection attempts.
    #[serde(default = "default_startup_poll_ms")]
    pub startup_poll_ms: u64,

    /// Default budget for a convergence wait.
    #[serde(default = "default_convergence_ms")]
    pub convergence_ms: u64,

    /// Delay between convergence polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for the poll delay once backoff kicks in.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Multiplier applied to the poll delay after every attempt (1.0 = fixed).
    #[serde(default = "default_backoff")]
    pub backoff: f64,

    /// Number of consecutive polls a predicate must hold.
    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,

    /// Budget for a single administrative command round trip.
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,

    /// How long a SIGTERM'd process may take before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_ms: default_startup_ms(),
            startup_poll_ms: default_startup_poll_ms(),
            convergence_ms: default_convergence_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            backoff: default_backoff(),
            stable_polls: default_stable_polls(),
            command_ms: default_command_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Retry policy for waiting on a freshly started process.
    pub fn startup_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_millis(self.startup_poll_ms),
            Duration::from_millis(self.startup_ms),
        )
    }

    /// Retry policy for convergence waits, minus the timeout which the
    /// caller supplies per wait.
    pub fn poll_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.poll_interval_ms), timeout).with_backoff(
            self.backoff,
            Duration::from_millis(self.max_poll_interval_ms),
        )
    }

    pub fn convergence(&self) -> Duration {
        Duration::from_millis(self.convergence_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Port range for the allocator (`start` inclusive, `end` exclusive).
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,

    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

/// Data directory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Parent directory for harness runs. `None` uses a fresh temporary
    /// directory that is removed when the harness is dropped.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Redirect child stdout/stderr into `<root>/logs/<node>.log`.
    #[serde(default = "default_true")]
    pub process_logs: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: None,
            process_logs: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Replica pair settings: launch options shared by both data-bearing
/// members, and the arbiter's.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaPairSettings {
    /// Replica set name passed to every member.
    #[serde(default = "default_set_name")]
    pub set_name: String,

    #[serde(default)]
    pub data_node: DataNodeOptions,

    #[serde(default)]
    pub arbiter: ArbiterOptions,
}

impl Default for ReplicaPairSettings {
    fn default() -> Self {
        Self {
            set_name: default_set_name(),
            data_node: DataNodeOptions::default(),
            arbiter: ArbiterOptions::default(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_server_binary() -> PathBuf {
    PathBuf::from("./target/debug/rig-node")
}

fn default_bridge_binary() -> PathBuf {
    PathBuf::from("./target/debug/rig-bridge")
}

fn default_startup_ms() -> u64 {
    60_000
}

fn default_startup_poll_ms() -> u64 {
    100
}

fn default_convergence_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_poll_interval_ms() -> u64 {
    1_000
}

fn default_backoff() -> f64 {
    1.0
}

fn default_stable_polls() -> u32 {
    2
}

fn default_command_ms() -> u64 {
    2_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_port_start() -> u16 {
    20_000
}

fn default_port_end() -> u16 {
    40_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_set_name() -> String {
    "rs0".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.timeouts.poll_interval_ms, 200);
        assert_eq!(config.timeouts.convergence(), Duration::from_secs(600));
        assert_eq!(config.ports.start, 20_000);
        assert!(config.data.root.is_none());
        assert!(config.data.process_logs);
        assert_eq!(config.replica_pair.set_name, "rs0");
        assert_eq!(config.cluster.routers, 1);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
timeouts:
  poll_interval_ms: 25
  stable_polls: 3
ports:
  start: 31000
  end: 31100
replica_pair:
  set_name: pair
  data_node:
    election_timeout_ms: 500
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.timeouts.poll_interval_ms, 25);
        assert_eq!(config.timeouts.stable_polls, 3);
        assert_eq!(config.timeouts.command_ms, 2_000);
        assert_eq!(config.ports.end, 31_100);
        assert_eq!(config.replica_pair.set_name, "pair");
        assert_eq!(config.replica_pair.data_node.election_timeout_ms, 500);
    }

    #[test]
    fn test_unknown_launch_option_rejected() {
        let yaml = r#"
replica_pair:
  data_node:
    no_such_flag: true
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.yaml");
        std::fs::write(&path, "logging:\n  level: debug\n  format: json\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_poll_policy_carries_backoff() {
        let timeouts = TimeoutConfig {
            backoff: 2.0,
            ..TimeoutConfig::default()
        };
        let policy = timeouts.poll_policy(Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.interval, Duration::from_millis(200));
        assert_eq!(policy.next_delay(Duration::from_millis(200)), Duration::from_millis(400));
        assert_eq!(policy.next_delay(Duration::from_millis(800)), Duration::from_millis(1000));
    }

    #[test]
    fn test_huge_backoff_from_yaml_is_capped() {
        let config: Config = serde_yaml::from_str("timeouts:\n  backoff: 1.0e30\n").unwrap();
        let policy = config.timeouts.poll_policy(Duration::from_secs(5));
        assert_eq!(policy.next_delay(policy.interval), policy.max_interval);
    }
}
