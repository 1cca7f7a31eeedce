//! External process lifecycle.
//!
//! A [`ProcessLauncher`] spawns server and relay processes, waits until
//! they accept TCP connections, and stops or restarts them.  Each running
//! process is represented by a [`Node`] that remembers everything needed
//! to launch it again in place: same port, same data directory.

use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DataConfig, TimeoutConfig};
use crate::errors::{HarnessError, Result};
use crate::options::{LaunchSpec, Peer, TopologyRole};
use crate::retry::{retry_until, Probe, RetryError, RetryPolicy};

/// What a supervised process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// A server under test, in the given topology role.
    Server(TopologyRole),
    /// A relay forwarding one link.
    Relay,
}

/// Everything needed to (re)launch a process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub kind: ProcessKind,
    launch: Option<LaunchSpec>,
    peers: Vec<Peer>,
}

impl ProcessSpec {
    /// Spec for a server process; renders its arguments from `launch`.
    pub fn server(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        port: u16,
        data_dir: Option<PathBuf>,
        launch: LaunchSpec,
        peers: Vec<Peer>,
    ) -> Result<Self> {
        let data_dir = if launch.uses_data_dir() { data_dir } else { None };
        let args = launch.to_args(port, data_dir.as_deref(), &peers)?;
        Ok(Self {
            name: name.into(),
            program: program.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            data_dir,
            args,
            kind: ProcessKind::Server(launch.role()),
            launch: Some(launch),
            peers,
        })
    }

    /// Spec for a relay process with pre-rendered arguments.
    pub fn relay(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        port: u16,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            data_dir: None,
            args,
            kind: ProcessKind::Relay,
            launch: None,
            peers: Vec::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn launch(&self) -> Option<&LaunchSpec> {
        self.launch.as_ref()
    }

    /// Replace the launch configuration, keeping port, peers and data directory.
    fn relaunch(&mut self, launch: LaunchSpec) -> Result<()> {
        if self.kind == ProcessKind::Relay {
            return Err(HarnessError::InvalidOptions(format!(
                "{} is a relay and has no launch spec",
                self.name
            )));
        }
        if launch.uses_data_dir() && self.data_dir.is_none() {
            return Err(HarnessError::InvalidOptions(format!(
                "{} was launched without a data directory",
                self.name
            )));
        }
        let data_dir = if launch.uses_data_dir() {
            self.data_dir.as_deref()
        } else {
            None
        };
        self.args = launch.to_args(self.port, data_dir, &self.peers)?;
        self.kind = ProcessKind::Server(launch.role());
        self.launch = Some(launch);
        Ok(())
    }
}

/// A supervised process.  Dropping a running node kills its process.
#[derive(Debug)]
pub struct Node {
    spec: ProcessSpec,
    child: Option<Child>,
    restarts: u32,
}

impl Node {
    /// A node that has not been launched yet.
    pub(crate) fn detached(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.spec.addr()
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.spec.data_dir.as_deref()
    }

    pub fn kind(&self) -> ProcessKind {
        self.spec.kind
    }

    /// Topology role, or `None` for relays.
    pub fn role(&self) -> Option<TopologyRole> {
        match self.spec.kind {
            ProcessKind::Server(role) => Some(role),
            ProcessKind::Relay => None,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Number of completed restarts since the node was created.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Whether the harness launched this node and it has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether the harness considers the node launched (not stopped).
    /// Cheap and non-mutating; a crashed process still counts as launched.
    pub fn is_launched(&self) -> bool {
        self.child.is_some()
    }
}

/// How to treat the data directory on `start`.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Remove any existing contents before launching.
    pub clean_data: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { clean_data: true }
    }
}

/// How to restart a node.
#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    /// Keep on-disk state; otherwise the data directory is wiped.
    pub preserve_data: bool,
    /// Launch with a different configuration (same port and data directory).
    pub relaunch: Option<LaunchSpec>,
}

impl RestartOptions {
    pub fn preserve() -> Self {
        Self {
            preserve_data: true,
            relaunch: None,
        }
    }

    pub fn wipe() -> Self {
        Self {
            preserve_data: false,
            relaunch: None,
        }
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.relaunch = Some(launch);
        self
    }
}

/// Launches, stops and restarts processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    startup: RetryPolicy,
    shutdown_grace: Duration,
    log_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl ProcessLauncher {
    /// `log_dir`, when set, receives one `<node>.log` file per process.
    /// Startup waits observe `cancel`.
    pub fn new(timeouts: &TimeoutConfig, log_dir: Option<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            startup: timeouts.startup_policy(),
            shutdown_grace: timeouts.shutdown_grace(),
            log_dir,
            cancel,
        }
    }

    /// Launch `spec` and block until its port accepts connections.
    pub async fn start(&self, spec: ProcessSpec, opts: StartOptions) -> Result<Node> {
        let mut node = Node::detached(spec);
        self.launch(&mut node, opts.clean_data).await?;
        Ok(node)
    }

    /// Ask the process to terminate and wait for it.  Escalates to SIGKILL
    /// after the shutdown grace period.  Stopping a stopped node is a no-op.
    pub async fn stop(&self, node: &mut Node) -> Result<()> {
        let Some(mut child) = node.child.take() else {
            debug!("{} already stopped", node.name());
            return Ok(());
        };
        if let Some(status) = child.try_wait()? {
            info!("{} had already exited ({})", node.name(), status);
            return Ok(());
        }

        if let Err(e) = request_termination(&mut child) {
            warn!("Termination request to {} failed: {}", node.name(), e);
        }
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(status) => {
                info!("Stopped {} on port {} ({})", node.name(), node.port(), status?);
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing",
                    node.name(),
                    self.shutdown_grace
                );
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// Kill the process immediately, without a termination request.
    /// Idempotent like [`ProcessLauncher::stop`].
    pub async fn kill(&self, node: &mut Node) -> Result<()> {
        let Some(mut child) = node.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        debug!("Killed {} on port {}", node.name(), node.port());
        Ok(())
    }

    /// Stop `node` and launch it again on the same port.
    ///
    /// With `preserve_data` the data directory is reused as is; otherwise
    /// it is wiped first.  `relaunch` swaps the launch configuration while
    /// the port and data directory stay fixed.
    pub async fn restart(&self, node: &mut Node, opts: RestartOptions) -> Result<()> {
        self.stop(node).await?;
        if let Some(launch) = opts.relaunch {
            node.spec.relaunch(launch)?;
        }
        info!(
            "Restarting {} on port {} (preserve_data={})",
            node.name(),
            node.port(),
            opts.preserve_data
        );
        self.launch(node, !opts.preserve_data).await?;
        node.restarts += 1;
        Ok(())
    }

    async fn launch(&self, node: &mut Node, clean_data: bool) -> Result<()> {
        if let Some(dir) = node.spec.data_dir.as_deref() {
            prepare_data_dir(dir, clean_data)?;
        }

        let mut cmd = Command::new(&node.spec.program);
        cmd.args(&node.spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}.log", node.name())))?;
                cmd.stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|source| HarnessError::LaunchError {
            program: node.spec.program.clone(),
            source,
        })?;
        info!(
            "Launched {} ({:?}) pid={:?} on {}",
            node.name(),
            node.kind(),
            child.id(),
            node.addr()
        );
        node.child = Some(child);

        if let Err(e) = self.wait_until_accepting(node).await {
            if let Err(kill_err) = self.kill(node).await {
                warn!("Cleanup of {} failed: {}", node.name(), kill_err);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn wait_until_accepting(&self, node: &mut Node) -> Result<()> {
        let addr = node.addr();
        let name = node.name().to_string();
        let Some(child) = node.child.as_mut() else {
            return Err(HarnessError::ProcessExited {
                node: name,
                status: "not launched".to_string(),
            });
        };

        let outcome = retry_until(&self.startup, &self.cancel, |_| {
            let exited = child.try_wait();
            async move {
                match exited {
                    Ok(Some(status)) => return Probe::Done(Err(status.to_string())),
                    Err(e) => return Probe::Done(Err(e.to_string())),
                    Ok(None) => {}
                }
                match TcpStream::connect(addr).await {
                    Ok(_) => Probe::Done(Ok(())),
                    Err(e) => Probe::Retry(e.to_string()),
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                debug!("{} is accepting connections on {}", name, addr);
                Ok(())
            }
            Ok(Err(status)) => Err(HarnessError::ProcessExited { node: name, status }),
            Err(RetryError::TimedOut { attempts, last }) => {
                debug!("{} never accepted: {:?}", name, last);
                Err(HarnessError::StartupTimeout {
                    node: name,
                    addr,
                    attempts,
                })
            }
            Err(RetryError::Cancelled) => Err(HarnessError::Cancelled),
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Create `dir`, wiping existing contents first when `clean` is set.
pub fn prepare_data_dir(dir: &Path, clean: bool) -> Result<()> {
    if clean && dir.exists() {
        debug!("Clearing data directory {}", dir.display());
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

// -- Data root ---------------------------------------------------------------

/// Root directory for one harness run: node data directories plus logs.
#[derive(Debug)]
pub enum DataRoot {
    /// Removed when dropped.
    Temp(tempfile::TempDir),
    /// Left in place for inspection.
    Fixed(PathBuf),
}

impl DataRoot {
    /// Create a fresh root for a harness labelled `label`.
    pub fn create(config: &DataConfig, label: &str) -> Result<Self> {
        match &config.root {
            Some(parent) => {
                let dir = parent.join(format!("{}-{}", label, uuid::Uuid::new_v4().simple()));
                std::fs::create_dir_all(&dir)?;
                Ok(DataRoot::Fixed(dir))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(&format!("{label}-"))
                    .tempdir()?;
                Ok(DataRoot::Temp(dir))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            DataRoot::Temp(dir) => dir.path(),
            DataRoot::Fixed(dir) => dir,
        }
    }

    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path().join("logs")
    }

    /// The log directory if process logs are enabled.
    pub fn process_log_dir(&self, config: &DataConfig) -> Option<PathBuf> {
        config.process_logs.then(|| self.log_dir())
    }
}
