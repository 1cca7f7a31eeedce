//! rig-node: stand-in server process for harness tests and demos.
//!
//! Accepts the same flags the harness renders from a launch spec and serves
//! the admin command surface on `POST /admin`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use clusterrig::config::LoggingConfig;
use clusterrig::options::Peer;
use clusterrig::signal::shutdown_signal;
use clusterrig::standin::{app, Mode, Standin, StandinConfig};

#[derive(Parser, Debug)]
#[command(name = "rig-node", version, about = "Stand-in server for cluster harness tests")]
struct Cli {
    #[arg(long)]
    port: u16,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Join the named replica set.
    #[arg(long)]
    replica_set: Option<String>,

    /// Vote in elections without holding data.
    #[arg(long, default_value_t = false)]
    arbiter: bool,

    /// Run as the metadata owner of a routed cluster.
    #[arg(long, default_value_t = false)]
    config_server: bool,

    /// Run as a router forwarding metadata commands to this address.
    #[arg(long)]
    config_db: Option<SocketAddr>,

    #[arg(long, default_value_t = false)]
    shard_server: bool,

    /// Accepted for compatibility; the stand-in keeps no replication log.
    #[arg(long, default_value_t = 40)]
    oplog_size_mb: u32,

    #[arg(long, default_value_t = 10_000)]
    election_timeout_ms: u64,

    #[arg(long, default_value_t = 2_000)]
    heartbeat_interval_ms: u64,

    /// Replica peer as `name=host:port`.  Repeatable.
    #[arg(long = "peer")]
    peers: Vec<PeerArg>,

    /// Server parameter as `key=value`.  Repeatable.
    #[arg(long = "set-parameter")]
    parameters: Vec<ParameterArg>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "text")]
    log_format: String,
}

#[derive(Debug, Clone)]
struct PeerArg(Peer);

impl FromStr for PeerArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=host:port, got '{s}'"))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid peer address '{addr}': {e}"))?;
        Ok(PeerArg(Peer::new(name, addr)))
    }
}

#[derive(Debug, Clone)]
struct ParameterArg(String, String);

impl FromStr for ParameterArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok(ParameterArg(k.to_string(), v.to_string())),
            _ => Err(format!("expected key=value, got '{s}'")),
        }
    }
}

impl Cli {
    fn mode(&self) -> Mode {
        if let Some(config_db) = self.config_db {
            Mode::Router { config_db }
        } else if self.config_server {
            Mode::ConfigServer
        } else if self.arbiter {
            Mode::Arbiter {
                set: self.replica_set.clone().unwrap_or_else(|| "rs0".to_string()),
            }
        } else if let Some(set) = &self.replica_set {
            Mode::Member { set: set.clone() }
        } else {
            Mode::Standalone
        }
    }

    fn into_config(self) -> StandinConfig {
        let mode = self.mode();
        let data_dir = match mode {
            Mode::Router { .. } => None,
            _ => self.data_dir,
        };
        StandinConfig {
            port: self.port,
            data_dir,
            mode,
            peers: self.peers.into_iter().map(|p| p.0).collect(),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            shard_server: self.shard_server,
            parameters: self
                .parameters
                .into_iter()
                .map(|ParameterArg(k, v)| (k, v))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    clusterrig::logging::init(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format.clone(),
    });

    let config = cli.into_config();
    let bind_addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Starting rig-node on {} as {:?}", bind_addr, config.mode);

    // Every start is a recovery: persisted state is loaded before the
    // port opens.
    let node = Arc::new(Standin::new(config)?);
    let heartbeats = tokio::spawn(node.clone().run_heartbeats());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("rig-node listening on {}", bind_addr);
    axum::serve(listener, app(node))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    heartbeats.abort();
    info!("rig-node shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rig-node").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_mode_precedence() {
        let cli = parse(&["--port", "1", "--replica-set", "rs1", "--arbiter"]);
        assert_eq!(cli.mode(), Mode::Arbiter { set: "rs1".to_string() });
        let cli = parse(&["--port", "1", "--config-server", "--config-db", "127.0.0.1:2"]);
        assert!(matches!(cli.mode(), Mode::Router { .. }));
        assert_eq!(parse(&["--port", "1"]).mode(), Mode::Standalone);
    }

    #[test]
    fn test_peers_and_parameters() {
        let cli = parse(&[
            "--port", "1", "--replica-set", "rs0",
            "--peer", "right=127.0.0.1:20001",
            "--peer", "arbiter=127.0.0.1:20002",
            "--set-parameter", "logLevel=2",
            "--data-dir", "/tmp/x",
        ]);
        let config = cli.into_config();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].name, "arbiter");
        assert_eq!(config.parameters["logLevel"], "2");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn test_bad_peer_is_rejected() {
        let args = ["rig-node", "--port", "1", "--peer", "right"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
