//! Harness-owned network links.
//!
//! Every path between two nodes goes through a relay process listening on
//! a port the harness allocated.  Killing the relay is an abrupt partition
//! of that direction; starting it again on the same port heals it.  The
//! [`NetworkGraph`] is the only record of which links exist and whether
//! they are up, and no node ever learns about it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tracing::info;

use crate::errors::{HarnessError, Result};
use crate::ports::{PortAllocator, PortLease};
use crate::process::{Node, ProcessLauncher, ProcessSpec, StartOptions};

/// A directed edge `from -> to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId {
    pub from: String,
    pub to: String,
}

impl LinkId {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// The same pair in the other direction.
    pub fn reversed(&self) -> Self {
        Self::new(self.to.clone(), self.from.clone())
    }

    pub fn touches(&self, node: &str) -> bool {
        self.from == node || self.to == node
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// One directed path, realized by a relay on `listen_port` forwarding to
/// `dest`.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    listen_port: u16,
    dest: SocketAddr,
    relay: Option<Node>,
}

impl Link {
    /// A link that exists on paper only; nothing listens yet.
    pub fn declared(id: LinkId, listen_port: u16, dest: SocketAddr) -> Self {
        Self {
            id,
            listen_port,
            dest,
            relay: None,
        }
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Address peers should dial to go through this link.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.listen_port))
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn state(&self) -> LinkState {
        if self.relay.is_some() {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }

    pub fn relay_pid(&self) -> Option<u32> {
        self.relay.as_ref().and_then(Node::pid)
    }
}

/// Starts and kills relay processes.
#[derive(Debug, Clone)]
pub struct NetworkBridge {
    program: PathBuf,
    launcher: ProcessLauncher,
}

impl NetworkBridge {
    pub fn new(program: impl Into<PathBuf>, launcher: ProcessLauncher) -> Self {
        Self {
            program: program.into(),
            launcher,
        }
    }

    /// Start forwarding `listen_port` to `dest`.  The link does not exist
    /// until this returns.
    pub async fn open(&self, id: LinkId, listen_port: u16, dest: SocketAddr) -> Result<Link> {
        let mut link = Link::declared(id, listen_port, dest);
        self.reopen(&mut link).await?;
        Ok(link)
    }

    /// Kill the relay.  Connections through it break without draining.
    pub async fn close(&self, link: &mut Link) -> Result<()> {
        if let Some(mut relay) = link.relay.take() {
            self.launcher.kill(&mut relay).await?;
            info!("Link {} down (port {})", link.id, link.listen_port);
        }
        Ok(())
    }

    /// Start the relay again on the same listen port.  No-op when up.
    pub async fn reopen(&self, link: &mut Link) -> Result<()> {
        if link.relay.is_some() {
            return Ok(());
        }
        let spec = ProcessSpec::relay(
            format!("relay-{}-{}", link.id.from, link.id.to),
            &self.program,
            link.listen_port,
            vec![
                "--listen-port".to_string(),
                link.listen_port.to_string(),
                "--dest".to_string(),
                link.dest.to_string(),
            ],
        );
        let relay = self
            .launcher
            .start(spec, StartOptions { clean_data: false })
            .await?;
        info!(
            "Link {} up: {} -> {}",
            link.id,
            link.listen_port,
            link.dest
        );
        link.relay = Some(relay);
        Ok(())
    }
}

/// The directed graph of links between the nodes of one harness.
#[derive(Debug)]
pub struct NetworkGraph {
    bridge: NetworkBridge,
    links: BTreeMap<LinkId, Link>,
    ports: PortLease,
}

impl NetworkGraph {
    pub fn new(bridge: NetworkBridge, allocator: &'static PortAllocator) -> Result<Self> {
        Ok(Self {
            bridge,
            links: BTreeMap::new(),
            ports: allocator.lease(0)?,
        })
    }

    /// Allocate a listen port for `from -> to` without opening it.
    pub fn declare(&mut self, from: &str, to: &str, dest: SocketAddr) -> Result<LinkId> {
        let id = LinkId::new(from, to);
        if from == to {
            return Err(HarnessError::InvalidTopology(format!(
                "link {id} connects a node to itself"
            )));
        }
        if self.links.contains_key(&id) {
            return Err(HarnessError::InvalidTopology(format!(
                "link {id} declared twice"
            )));
        }
        let port = self.ports.extend()?;
        self.links
            .insert(id.clone(), Link::declared(id.clone(), port, dest));
        Ok(id)
    }

    pub async fn open(&mut self, id: &LinkId) -> Result<()> {
        let link = link_mut(&mut self.links, id)?;
        self.bridge.reopen(link).await
    }

    pub async fn close(&mut self, id: &LinkId) -> Result<()> {
        let link = link_mut(&mut self.links, id)?;
        self.bridge.close(link).await
    }

    /// Close every link in `ids`, in order.  All ids are checked before
    /// any link is touched.
    pub async fn partition(&mut self, ids: &[LinkId]) -> Result<()> {
        self.check_all(ids)?;
        for id in ids {
            self.close(id).await?;
        }
        Ok(())
    }

    /// Open every link in `ids`, in order.  All ids are checked before
    /// any link is touched.
    pub async fn heal(&mut self, ids: &[LinkId]) -> Result<()> {
        self.check_all(ids)?;
        for id in ids {
            self.open(id).await?;
        }
        Ok(())
    }

    pub async fn open_all(&mut self) -> Result<()> {
        for link in self.links.values_mut() {
            self.bridge.reopen(link).await?;
        }
        Ok(())
    }

    pub async fn close_all(&mut self) -> Result<()> {
        for link in self.links.values_mut() {
            self.bridge.close(link).await?;
        }
        Ok(())
    }

    pub fn state(&self, id: &LinkId) -> Result<LinkState> {
        Ok(self.link(id)?.state())
    }

    /// Whether `from` can currently reach `to`.  Pairs without a declared
    /// link are never reachable.
    pub fn is_up(&self, from: &str, to: &str) -> bool {
        self.links
            .get(&LinkId::new(from, to))
            .is_some_and(|link| link.state() == LinkState::Up)
    }

    pub fn link(&self, id: &LinkId) -> Result<&Link> {
        self.links
            .get(id)
            .ok_or_else(|| HarnessError::UnknownLink(id.clone()))
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Ids of every link into or out of `node`.
    pub fn links_touching(&self, node: &str) -> Vec<LinkId> {
        self.links
            .keys()
            .filter(|id| id.touches(node))
            .cloned()
            .collect()
    }

    /// Listen address of each link paired with the name of the node it
    /// leads to.
    pub fn aliases(&self) -> Vec<(SocketAddr, String)> {
        self.links
            .values()
            .map(|link| (link.listen_addr(), link.id.to.clone()))
            .collect()
    }

    fn check_all(&self, ids: &[LinkId]) -> Result<()> {
        for id in ids {
            self.link(id)?;
        }
        Ok(())
    }
}

fn link_mut<'a>(links: &'a mut BTreeMap<LinkId, Link>, id: &LinkId) -> Result<&'a mut Link> {
    links
        .get_mut(id)
        .ok_or_else(|| HarnessError::UnknownLink(id.clone()))
}
