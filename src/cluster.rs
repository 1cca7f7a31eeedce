//! Routed cluster harness.
//!
//! Provisions a metadata owner, a set of shards and one or more routers,
//! then registers every shard through the routing layer.  Metadata
//! mutations always go through a router; ownership questions go to the
//! metadata owner, which is the only authority on where a key lives.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{
    run_command, AdminCommand, CommandClient, CommandError, CommandReply, HttpCommandClient,
};
use crate::config::Config;
use crate::errors::{HarnessError, Result};
use crate::options::{ConfigServerOptions, DataNodeOptions, LaunchSpec, RouterOptions};
use crate::ports::{PortAllocator, PortLease};
use crate::process::{DataRoot, Node, ProcessLauncher, ProcessSpec, RestartOptions, StartOptions};

/// Name of the metadata owner process.
pub const CONFIG_SERVER: &str = "config";

/// One shard of the topology.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShardSpec {
    pub name: String,

    #[serde(default)]
    pub options: DataNodeOptions,
}

impl ShardSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: DataNodeOptions::default(),
        }
    }
}

/// Shape of a routed cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterTopology {
    #[serde(default = "default_shards")]
    pub shards: Vec<ShardSpec>,

    /// Number of routers.
    #[serde(default = "default_routers")]
    pub routers: usize,

    #[serde(default)]
    pub config_server: ConfigServerOptions,

    /// Options shared by every router; `config_db` is filled in.
    #[serde(default)]
    pub router: RouterOptions,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            routers: default_routers(),
            config_server: ConfigServerOptions::default(),
            router: RouterOptions::default(),
        }
    }
}

impl ClusterTopology {
    /// At least one shard and one router, and unique shard names that do
    /// not clash with the metadata owner or routers.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(HarnessError::InvalidTopology(
                "a cluster needs at least one shard".to_string(),
            ));
        }
        if self.routers == 0 {
            return Err(HarnessError::InvalidTopology(
                "a cluster needs at least one router".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for shard in &self.shards {
            if shard.name.is_empty() {
                return Err(HarnessError::InvalidTopology(
                    "shard names must not be empty".to_string(),
                ));
            }
            if shard.name == CONFIG_SERVER || shard.name.starts_with("router") {
                return Err(HarnessError::InvalidTopology(format!(
                    "shard name {} is reserved",
                    shard.name
                )));
            }
            if !seen.insert(shard.name.as_str()) {
                return Err(HarnessError::InvalidTopology(format!(
                    "duplicate shard name {}",
                    shard.name
                )));
            }
        }
        Ok(())
    }
}

fn default_shards() -> Vec<ShardSpec> {
    vec![ShardSpec::new("shard0"), ShardSpec::new("shard1")]
}

fn default_routers() -> usize {
    1
}

/// A running routed cluster.
pub struct Cluster {
    client: Arc<dyn CommandClient>,
    launcher: ProcessLauncher,
    config_server: Node,
    shards: Vec<Node>,
    routers: Vec<Node>,
    cancel: CancellationToken,
    _ports: PortLease,
    data_root: DataRoot,
}

impl Cluster {
    /// Provision `topology` using HTTP for the command surface.
    pub async fn provision(config: &Config, topology: &ClusterTopology) -> Result<Self> {
        let client = Arc::new(HttpCommandClient::new(config.timeouts.command())?);
        Self::provision_with_client(config, topology, client).await
    }

    /// Start the metadata owner, then shards, then routers, then register
    /// every shard through the routing layer.
    pub async fn provision_with_client(
        config: &Config,
        topology: &ClusterTopology,
        client: Arc<dyn CommandClient>,
    ) -> Result<Self> {
        topology.validate()?;

        let cancel = CancellationToken::new();
        let data_root = DataRoot::create(&config.data, "cluster")?;
        let launcher = ProcessLauncher::new(
            &config.timeouts,
            data_root.process_log_dir(&config.data),
            cancel.clone(),
        );
        let ports = PortAllocator::init_global(&config.ports)
            .lease(1 + topology.shards.len() + topology.routers)?;
        // Owner first, then shards, then routers.
        let port_list = ports.ports().to_vec();
        let shard_ports = &port_list[1..=topology.shards.len()];
        let router_ports = &port_list[1 + topology.shards.len()..];

        let config_spec = ProcessSpec::server(
            CONFIG_SERVER,
            &config.binaries.server,
            port_list[0],
            Some(data_root.node_dir(CONFIG_SERVER)),
            LaunchSpec::Config(topology.config_server.clone()),
            Vec::new(),
        )?;
        let config_server = launcher.start(config_spec, StartOptions::default()).await?;

        let mut shards = Vec::with_capacity(topology.shards.len());
        for (shard, port) in topology.shards.iter().zip(shard_ports) {
            let spec = ProcessSpec::server(
                shard.name.as_str(),
                &config.binaries.server,
                *port,
                Some(data_root.node_dir(&shard.name)),
                LaunchSpec::Data(DataNodeOptions {
                    shard_server: true,
                    ..shard.options.clone()
                }),
                Vec::new(),
            )?;
            shards.push(launcher.start(spec, StartOptions::default()).await?);
        }

        let mut routers = Vec::with_capacity(topology.routers);
        for (i, port) in router_ports.iter().enumerate() {
            let spec = ProcessSpec::server(
                format!("router{i}"),
                &config.binaries.router,
                *port,
                None,
                LaunchSpec::Router(RouterOptions {
                    config_db: Some(config_server.addr().to_string()),
                    ..topology.router.clone()
                }),
                Vec::new(),
            )?;
            routers.push(launcher.start(spec, StartOptions::default()).await?);
        }

        let cluster = Self {
            client,
            launcher,
            config_server,
            shards,
            routers,
            cancel,
            _ports: ports,
            data_root,
        };
        for shard in &cluster.shards {
            cluster
                .route_admin_command(&AdminCommand::add_server(shard.name(), shard.addr()))
                .await?;
        }
        info!(
            "Cluster provisioned: {} shard(s), {} router(s) under {}",
            cluster.shards.len(),
            cluster.routers.len(),
            cluster.data_root.path().display()
        );
        Ok(cluster)
    }

    // -- Commands ------------------------------------------------------------

    /// Send `command` through the routing layer.
    ///
    /// Routers are tried in order; the next one is used only when the
    /// previous could not be connected to.  Any reply, or any other
    /// failure, ends the attempt.
    pub async fn route_admin_command(&self, command: &AdminCommand) -> Result<CommandReply> {
        let routers: Vec<SocketAddr> = self.routers.iter().map(Node::addr).collect();
        route_through(self.client.as_ref(), &routers, command).await
    }

    pub async fn enable_routing(&self, db: &str) -> Result<CommandReply> {
        self.route_admin_command(&AdminCommand::enable_routing(db))
            .await
    }

    pub async fn shard_collection(&self, ns: &str, key: &str) -> Result<CommandReply> {
        self.route_admin_command(&AdminCommand::shard_collection(ns, key))
            .await
    }

    /// Reassign the partition containing `key` to `shard`.
    pub async fn move_partition(
        &self,
        ns: &str,
        key: impl Into<Value>,
        shard: &str,
    ) -> Result<CommandReply> {
        self.shard(shard)?;
        self.route_admin_command(&AdminCommand::move_partition(ns, key, shard))
            .await
    }

    /// Ask the metadata owner which shard owns `key` right now.
    pub async fn locate_owner(&self, ns: &str, key: impl Into<Value>) -> Result<String> {
        let addr = self.config_server.addr();
        let command = AdminCommand::locate_owner(ns, key);
        let reply = run_command(self.client.as_ref(), addr, &command).await?;
        reply.owner.ok_or_else(|| {
            HarnessError::Command(CommandError::MalformedReply {
                addr,
                reason: "locateowner reply has no owner".to_string(),
            })
        })
    }

    // -- Nodes ---------------------------------------------------------------

    pub fn shard(&self, name: &str) -> Result<&Node> {
        self.shards
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| HarnessError::UnknownNode(name.to_string()))
    }

    pub fn shards(&self) -> &[Node] {
        &self.shards
    }

    pub fn routers(&self) -> &[Node] {
        &self.routers
    }

    pub fn metadata_owner(&self) -> &Node {
        &self.config_server
    }

    /// Every node with its address, owner first.
    pub fn address_map(&self) -> Vec<(String, SocketAddr)> {
        std::iter::once(&self.config_server)
            .chain(&self.shards)
            .chain(&self.routers)
            .map(|n| (n.name().to_string(), n.addr()))
            .collect()
    }

    /// Restart one shard in place.
    pub async fn restart_shard(&mut self, name: &str, opts: RestartOptions) -> Result<()> {
        let node = self
            .shards
            .iter_mut()
            .find(|n| n.name() == name)
            .ok_or_else(|| HarnessError::UnknownNode(name.to_string()))?;
        self.launcher.restart(node, opts).await
    }

    // -- Teardown ------------------------------------------------------------

    pub fn teardown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop routers, then shards, then the metadata owner.  Every node is
    /// stopped even if an earlier stop fails; the first error is returned.
    pub async fn stop_all(&mut self) -> Result<()> {
        self.cancel.cancel();
        let mut first_error = None;
        let order = shutdown_order(&mut self.routers, &mut self.shards, &mut self.config_server);
        for node in order {
            if let Err(e) = self.launcher.stop(node).await {
                warn!("Stopping {} failed: {}", node.name(), e);
                first_error.get_or_insert(e);
            }
        }
        info!("Cluster stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Routers, then shards, then the metadata owner.
fn shutdown_order<'a>(
    routers: &'a mut [Node],
    shards: &'a mut [Node],
    owner: &'a mut Node,
) -> impl Iterator<Item = &'a mut Node> + 'a {
    routers
        .iter_mut()
        .chain(shards.iter_mut())
        .chain(std::iter::once(owner))
}

/// Send `command` to the first router in `routers` that accepts a
/// connection.  Only a refused connect moves on to the next router: once
/// the request may have reached a router (a reply, a timeout, or a
/// connection lost mid-exchange) resending could apply the mutation twice.
pub(crate) async fn route_through(
    client: &dyn CommandClient,
    routers: &[SocketAddr],
    command: &AdminCommand,
) -> Result<CommandReply> {
    let mut last_failure = None;
    for &addr in routers {
        match client.send(addr, command).await {
            Ok(reply) => return reply.into_result(addr, command),
            Err(e) if e.is_connection_failure() => {
                warn!("Router {} unreachable for {}: {}", addr, command, e);
                last_failure = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(match last_failure {
        Some(e) => e.into(),
        None => HarnessError::InvalidTopology("no routers to send through".to_string()),
    })
}
