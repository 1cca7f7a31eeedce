//! Per-role launch options for server processes.
//!
//! Each topology role has its own options struct with named fields and
//! serde defaults.  Unknown keys are rejected when an options struct is
//! built, whether from the YAML config or from loose key/value pairs via
//! [`LaunchSpec::from_pairs`], so a typo never silently reaches the
//! server's command line.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, Result};

/// Position of a node in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyRole {
    Arbiter,
    DataBearing,
    Router,
    Config,
}

impl fmt::Display for TopologyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyRole::Arbiter => "arbiter",
            TopologyRole::DataBearing => "data-bearing",
            TopologyRole::Router => "router",
            TopologyRole::Config => "config",
        };
        f.write_str(s)
    }
}

/// A peer a server should talk to, as `name=host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

/// Options for a data-bearing replica member or shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataNodeOptions {
    /// Replica set name; `None` launches a standalone server.
    #[serde(default)]
    pub replica_set: Option<String>,

    /// Replication log size in megabytes.
    #[serde(default = "default_oplog_size_mb")]
    pub oplog_size_mb: u32,

    /// Election timeout in milliseconds.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Start as a shard member of a routed cluster.
    #[serde(default)]
    pub shard_server: bool,

    /// Server parameters, rendered as `--set-parameter key=value`.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for DataNodeOptions {
    fn default() -> Self {
        Self {
            replica_set: None,
            oplog_size_mb: default_oplog_size_mb(),
            election_timeout_ms: default_election_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            shard_server: false,
            parameters: BTreeMap::new(),
        }
    }
}

/// Options for a voting, non-data-bearing arbiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArbiterOptions {
    #[serde(default)]
    pub replica_set: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Options for a router.  Routers keep no data directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterOptions {
    /// Address of the metadata owner.  Filled in by the cluster harness.
    #[serde(default)]
    pub config_db: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Options for the metadata owner (config server).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigServerOptions {
    #[serde(default)]
    pub replica_set: Option<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Launch configuration for one server process.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchSpec {
    Data(DataNodeOptions),
    Arbiter(ArbiterOptions),
    Router(RouterOptions),
    Config(ConfigServerOptions),
}

impl LaunchSpec {
    pub fn role(&self) -> TopologyRole {
        match self {
            LaunchSpec::Data(_) => TopologyRole::DataBearing,
            LaunchSpec::Arbiter(_) => TopologyRole::Arbiter,
            LaunchSpec::Router(_) => TopologyRole::Router,
            LaunchSpec::Config(_) => TopologyRole::Config,
        }
    }

    /// Whether processes with this spec own a data directory.
    pub fn uses_data_dir(&self) -> bool {
        !matches!(self, LaunchSpec::Router(_))
    }

    /// Build a spec for `role` from loose key/value pairs.
    ///
    /// Fails with [`HarnessError::InvalidOptions`] on any key the role's
    /// options struct does not declare, or on a value of the wrong type.
    pub fn from_pairs<I, K>(role: TopologyRole, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let map: serde_json::Map<String, serde_json::Value> =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let value = serde_json::Value::Object(map);
        let invalid = |e: serde_json::Error| HarnessError::InvalidOptions(format!("{role}: {e}"));
        let spec = match role {
            TopologyRole::DataBearing => {
                LaunchSpec::Data(serde_json::from_value(value).map_err(invalid)?)
            }
            TopologyRole::Arbiter => {
                LaunchSpec::Arbiter(serde_json::from_value(value).map_err(invalid)?)
            }
            TopologyRole::Router => {
                LaunchSpec::Router(serde_json::from_value(value).map_err(invalid)?)
            }
            TopologyRole::Config => {
                LaunchSpec::Config(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        Ok(spec)
    }

    /// Render the command line for a process listening on `port`.
    ///
    /// `data_dir` is ignored for routers.  `peers` is only meaningful for
    /// replica members (data-bearing and arbiter).
    pub fn to_args(&self, port: u16, data_dir: Option<&Path>, peers: &[Peer]) -> Result<Vec<String>> {
        let mut args = vec!["--port".to_string(), port.to_string()];
        if self.uses_data_dir() {
            if let Some(dir) = data_dir {
                args.push("--data-dir".to_string());
                args.push(dir.display().to_string());
            }
        }

        let parameters = match self {
            LaunchSpec::Data(opts) => {
                push_replica_set(&mut args, opts.replica_set.as_deref());
                args.push("--oplog-size-mb".to_string());
                args.push(opts.oplog_size_mb.to_string());
                args.push("--election-timeout-ms".to_string());
                args.push(opts.election_timeout_ms.to_string());
                args.push("--heartbeat-interval-ms".to_string());
                args.push(opts.heartbeat_interval_ms.to_string());
                if opts.shard_server {
                    args.push("--shard-server".to_string());
                }
                push_peers(&mut args, peers);
                &opts.parameters
            }
            LaunchSpec::Arbiter(opts) => {
                args.push("--arbiter".to_string());
                push_replica_set(&mut args, opts.replica_set.as_deref());
                push_peers(&mut args, peers);
                &opts.parameters
            }
            LaunchSpec::Router(opts) => {
                let config_db = opts.config_db.as_deref().ok_or_else(|| {
                    HarnessError::InvalidOptions("router requires config_db".to_string())
                })?;
                args.push("--config-db".to_string());
                args.push(config_db.to_string());
                &opts.parameters
            }
            LaunchSpec::Config(opts) => {
                args.push("--config-server".to_string());
                push_replica_set(&mut args, opts.replica_set.as_deref());
                &opts.parameters
            }
        };

        for (key, value) in parameters {
            args.push("--set-parameter".to_string());
            args.push(format!("{key}={value}"));
        }
        Ok(args)
    }
}

fn push_replica_set(args: &mut Vec<String>, name: Option<&str>) {
    if let Some(name) = name {
        args.push("--replica-set".to_string());
        args.push(name.to_string());
    }
}

fn push_peers(args: &mut Vec<String>, peers: &[Peer]) {
    for peer in peers {
        args.push("--peer".to_string());
        args.push(format!("{}={}", peer.name, peer.addr));
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_oplog_size_mb() -> u32 {
    40
}

fn default_election_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}
