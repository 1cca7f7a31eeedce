//! Two data-bearing members plus an arbiter, wired through relays.
//!
//! Every member reaches every other member only through a harness-owned
//! link, so any direction between any two members can be cut without
//! touching the processes.  The harness itself polls members directly.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{LinkId, NetworkBridge, NetworkGraph};
use crate::command::{run_command, AdminCommand, CommandClient, CommandReply, HttpCommandClient};
use crate::config::Config;
use crate::errors::{HarnessError, Result};
use crate::observer::{PollTarget, RoleObserver};
use crate::options::{ArbiterOptions, DataNodeOptions, LaunchSpec, Peer};
use crate::ports::{PortAllocator, PortLease};
use crate::process::{DataRoot, Node, ProcessLauncher, ProcessSpec, RestartOptions, StartOptions};
use crate::role::{eligible_primaries, no_primary, steady_state, RoleSnapshot};

pub const LEFT: &str = "left";
pub const RIGHT: &str = "right";
pub const ARBITER: &str = "arbiter";

/// Members in launch and poll order.
pub const MEMBERS: [&str; 3] = [LEFT, RIGHT, ARBITER];

/// A running replica pair.
pub struct ReplicaPair {
    config: Config,
    launcher: ProcessLauncher,
    client: Arc<dyn CommandClient>,
    observer: RoleObserver,
    graph: NetworkGraph,
    members: BTreeMap<&'static str, Node>,
    cancel: CancellationToken,
    _ports: PortLease,
    data_root: DataRoot,
}

impl ReplicaPair {
    /// Start the pair using HTTP for the command surface.
    pub async fn start(config: &Config) -> Result<Self> {
        let client = Arc::new(HttpCommandClient::new(config.timeouts.command())?);
        Self::start_with_client(config, client).await
    }

    /// Allocate ports, open every link, then launch left, right and the
    /// arbiter with their peers pointing at the link listen ports.
    pub async fn start_with_client(config: &Config, client: Arc<dyn CommandClient>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let data_root = DataRoot::create(&config.data, "replica-pair")?;
        let launcher = ProcessLauncher::new(
            &config.timeouts,
            data_root.process_log_dir(&config.data),
            cancel.clone(),
        );
        let allocator = PortAllocator::init_global(&config.ports);
        let ports = allocator.lease(MEMBERS.len())?;
        let addrs: BTreeMap<&'static str, SocketAddr> = MEMBERS
            .iter()
            .zip(ports.ports())
            .map(|(name, port)| (*name, SocketAddr::from(([127, 0, 0, 1], *port))))
            .collect();

        let bridge = NetworkBridge::new(&config.binaries.bridge, launcher.clone());
        let mut graph = NetworkGraph::new(bridge, allocator)?;
        for from in MEMBERS {
            for to in MEMBERS {
                if from != to {
                    graph.declare(from, to, addrs[to])?;
                }
            }
        }
        graph.open_all().await?;

        let mut observer = RoleObserver::new(client.clone(), &config.timeouts, cancel.clone());
        for (name, addr) in &addrs {
            observer.add_alias(*addr, *name);
        }
        for (addr, name) in graph.aliases() {
            observer.add_alias(addr, name);
        }

        let mut pair = Self {
            config: config.clone(),
            launcher,
            client,
            observer,
            graph,
            members: BTreeMap::new(),
            cancel,
            _ports: ports,
            data_root,
        };
        for name in MEMBERS {
            let spec = pair.member_spec(name, addrs[name].port())?;
            let node = pair.launcher.start(spec, StartOptions::default()).await?;
            pair.members.insert(name, node);
        }
        info!(
            "Replica pair {} started under {}",
            pair.config.replica_pair.set_name,
            pair.data_root.path().display()
        );
        Ok(pair)
    }

    fn member_spec(&self, name: &str, port: u16) -> Result<ProcessSpec> {
        let settings = &self.config.replica_pair;
        let set_name = Some(settings.set_name.clone());
        let launch = if name == ARBITER {
            LaunchSpec::Arbiter(ArbiterOptions {
                replica_set: set_name,
                ..settings.arbiter.clone()
            })
        } else {
            LaunchSpec::Data(DataNodeOptions {
                replica_set: set_name,
                ..settings.data_node.clone()
            })
        };
        let mut peers = Vec::new();
        for other in MEMBERS.iter().filter(|m| **m != name) {
            let link = self.graph.link(&LinkId::new(name, *other))?;
            peers.push(Peer::new(*other, link.listen_addr()));
        }
        ProcessSpec::server(
            name,
            &self.config.binaries.server,
            port,
            Some(self.data_root.node_dir(name)),
            launch,
            peers,
        )
    }

    // -- Observation ---------------------------------------------------------

    fn targets(&self) -> Vec<PollTarget> {
        self.members
            .iter()
            .map(|(name, node)| PollTarget::new(*name, node.is_launched().then(|| node.addr())))
            .collect()
    }

    /// Poll every member once.
    pub async fn poll(&self) -> RoleSnapshot {
        self.observer.poll(&self.targets()).await
    }

    /// Wait until `predicate` holds reproducibly over the members' roles.
    pub async fn wait_for_state_where<P>(
        &self,
        description: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<RoleSnapshot>
    where
        P: Fn(&RoleSnapshot) -> bool,
    {
        self.observer
            .wait_for_state_where(&self.targets(), description, predicate, timeout)
            .await
    }

    /// Wait for steady state and return the primary's name.
    pub async fn wait_for_primary(&self) -> Result<String> {
        let snapshot = self
            .wait_for_state_where("steady state", steady_state, self.config.timeouts.convergence())
            .await?;
        eligible_primaries(&snapshot)
            .first()
            .map(|name| name.to_string())
            .ok_or_else(|| HarnessError::ConvergenceTimeout {
                description: "steady state".to_string(),
                timeout: self.config.timeouts.convergence(),
                last: snapshot.clone(),
            })
    }

    /// Wait until no member claims primary.
    pub async fn wait_for_no_primary(&self, timeout: Duration) -> Result<RoleSnapshot> {
        self.wait_for_state_where("no primary", no_primary, timeout)
            .await
    }

    // -- Links ---------------------------------------------------------------

    /// The link `from -> to`, checked to exist.
    pub fn link(&self, from: &str, to: &str) -> Result<LinkId> {
        let id = LinkId::new(from, to);
        self.graph.link(&id)?;
        Ok(id)
    }

    /// Every link into or out of `member`.
    pub fn isolation_links(&self, member: &str) -> Result<Vec<LinkId>> {
        self.member(member)?;
        Ok(self.graph.links_touching(member))
    }

    pub async fn partition(&mut self, links: &[LinkId]) -> Result<()> {
        info!(
            "Partitioning {}",
            links.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        self.graph.partition(links).await
    }

    pub async fn heal(&mut self, links: &[LinkId]) -> Result<()> {
        info!(
            "Healing {}",
            links.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        self.graph.heal(links).await
    }

    pub async fn heal_all(&mut self) -> Result<()> {
        self.graph.open_all().await
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Members -------------------------------------------------------------

    pub fn member(&self, name: &str) -> Result<&Node> {
        self.members
            .get(name)
            .ok_or_else(|| HarnessError::UnknownNode(name.to_string()))
    }

    fn member_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.members
            .get_mut(name)
            .ok_or_else(|| HarnessError::UnknownNode(name.to_string()))
    }

    pub fn addr(&self, name: &str) -> Result<SocketAddr> {
        Ok(self.member(name)?.addr())
    }

    pub async fn stop_member(&mut self, name: &str) -> Result<()> {
        let launcher = self.launcher.clone();
        let node = self.member_mut(name)?;
        launcher.stop(node).await
    }

    /// Launch a stopped member again with its data intact.  No-op when
    /// the member is running.
    pub async fn start_member(&mut self, name: &str) -> Result<()> {
        let launcher = self.launcher.clone();
        let node = self.member_mut(name)?;
        if node.is_running() {
            return Ok(());
        }
        launcher.restart(node, RestartOptions::preserve()).await
    }

    pub async fn restart_member(&mut self, name: &str, opts: RestartOptions) -> Result<()> {
        let launcher = self.launcher.clone();
        let node = self.member_mut(name)?;
        launcher.restart(node, opts).await
    }

    /// Send `command` straight to `member`.  `ok: 0` replies are errors.
    pub async fn run_command(&self, member: &str, command: &AdminCommand) -> Result<CommandReply> {
        let addr = self.addr(member)?;
        run_command(self.client.as_ref(), addr, command).await
    }

    // -- Teardown ------------------------------------------------------------

    /// Token that, when cancelled, makes in-flight waits return
    /// [`HarnessError::Cancelled`].
    pub fn teardown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel waits, stop the data-bearing members, then the arbiter, then
    /// close every link.  Safe to call more than once.
    pub async fn stop_all(&mut self) -> Result<()> {
        self.cancel.cancel();
        let mut first_error = None;
        for name in [LEFT, RIGHT, ARBITER] {
            if let Some(node) = self.members.get_mut(name) {
                if let Err(e) = self.launcher.stop(node).await {
                    warn!("Stopping {} failed: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.graph.close_all().await {
            first_error.get_or_insert(e);
        }
        info!("Replica pair stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;

    #[tokio::test]
    async fn test_start_fails_fast_without_bridge_binary() {
        let mut config = Config::default();
        config.binaries.bridge = "/nonexistent/rig-bridge".into();
        config.data.process_logs = false;
        let client = Arc::new(ScriptedClient::new());
        let err = match ReplicaPair::start_with_client(&config, client.clone()).await {
            Ok(_) => panic!("started without a bridge binary"),
            Err(e) => e,
        };
        assert_eq!(err.code(), "LaunchError");
        assert!(client.sent().is_empty());
    }
}
