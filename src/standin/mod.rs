//! Stand-in server process.
//!
//! `rig-node` runs this module.  It answers the admin command surface
//! over HTTP and plays one of five parts chosen by its launch flags:
//! standalone server, replica member, arbiter, router or metadata owner.
//! Replica members and arbiters send `ismaster` heartbeats to their
//! `--peer` addresses, which the harness points at relay ports, and run a
//! small majority election on the answers.  Cutting a link therefore has
//! the same observable effect on roles as a real network partition.

pub mod metadata;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::command::{AdminCommand, CommandClient, CommandReply, HttpCommandClient};
use crate::options::Peer;
use metadata::{Metadata, MetadataError};

/// Budget for a router forwarding a command to the metadata owner.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Which part the process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Member { set: String },
    Arbiter { set: String },
    Router { config_db: SocketAddr },
    ConfigServer,
}

impl Mode {
    fn set_name(&self) -> Option<&str> {
        match self {
            Mode::Member { set } | Mode::Arbiter { set } => Some(set),
            _ => None,
        }
    }
}

/// Launch settings, already parsed from the command line.
#[derive(Debug, Clone)]
pub struct StandinConfig {
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub mode: Mode,
    pub peers: Vec<Peer>,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shard_server: bool,
    pub parameters: BTreeMap<String, String>,
}

/// Failures reported to callers as `ok: 0` replies.
#[derive(Debug, Error)]
pub enum StandinError {
    #[error("no such command: '{0}'")]
    UnknownCommand(String),

    #[error("{0}")]
    BadValue(String),

    #[error("not master")]
    NotPrimary,

    #[error("{0} is not supported by this node")]
    Unsupported(String),

    #[error("metadata owner unreachable: {0}")]
    OwnerUnreachable(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("failed to persist state: {0}")]
    Persist(String),
}

impl StandinError {
    pub fn code(&self) -> i64 {
        match self {
            StandinError::UnknownCommand(_) => 59,
            StandinError::BadValue(_) => 2,
            StandinError::NotPrimary => 10107,
            StandinError::Unsupported(_) => 20,
            StandinError::OwnerUnreachable(_) => 89,
            StandinError::Metadata(e) => e.code(),
            StandinError::Persist(_) => 1,
        }
    }
}

impl From<StandinError> for CommandReply {
    fn from(e: StandinError) -> Self {
        CommandReply::failure(e.code(), e.to_string())
    }
}

type Outcome = std::result::Result<CommandReply, StandinError>;

// -- Member state ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberRole {
    #[default]
    Startup,
    Primary,
    Secondary,
}

#[derive(Debug, Default)]
struct MemberState {
    role: MemberRole,
    primary: Option<String>,
    synced: bool,
    electable: bool,
    frozen: bool,
    last_primary_seen: Option<Instant>,
}

/// What a heartbeat learned about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub me: Option<String>,
    pub ismaster: bool,
    pub arbiter: bool,
    pub electable: bool,
}

impl PeerView {
    fn from_reply(reply: &CommandReply) -> Self {
        Self {
            me: reply.me.clone(),
            ismaster: reply.ismaster.unwrap_or(false),
            arbiter: reply.arbiter_only.unwrap_or(false),
            electable: reply
                .get("electable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

// -- Durable state -----------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Store {
    #[serde(default)]
    docs: BTreeMap<String, Value>,
    #[serde(default)]
    meta: Metadata,
}

const STORE_FILE: &str = "store.json";

fn load_store(data_dir: Option<&Path>) -> anyhow::Result<Store> {
    let Some(dir) = data_dir else {
        return Ok(Store::default());
    };
    let path = dir.join(STORE_FILE);
    if !path.exists() {
        return Ok(Store::default());
    }
    let contents = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Write-temp, fsync, rename.
fn save_store(dir: &Path, store: &Store) -> std::io::Result<()> {
    use std::io::Write;

    let tmp_path = dir.join(format!("{STORE_FILE}.tmp"));
    let data = serde_json::to_vec_pretty(store)?;
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, dir.join(STORE_FILE))
}

// -- Node --------------------------------------------------------------------

/// A running stand-in node.
pub struct Standin {
    config: StandinConfig,
    me: String,
    member: Mutex<MemberState>,
    store: Mutex<Store>,
    http: HttpCommandClient,
}

impl Standin {
    /// Load any persisted state from the data directory.
    pub fn new(config: StandinConfig) -> anyhow::Result<Self> {
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        let store = load_store(config.data_dir.as_deref())?;
        let timeout = match config.mode {
            Mode::Router { .. } => FORWARD_TIMEOUT,
            _ => config.heartbeat_interval,
        };
        let http = HttpCommandClient::new(timeout)?;
        Ok(Self {
            me: format!("127.0.0.1:{}", config.port),
            config,
            member: Mutex::new(MemberState::default()),
            store: Mutex::new(store),
            http,
        })
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn mode(&self) -> &Mode {
        &self.config.mode
    }

    pub fn role(&self) -> MemberRole {
        self.lock_member().role
    }

    fn lock_member(&self) -> MutexGuard<'_, MemberState> {
        self.member.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, store: &Store) -> Result<(), StandinError> {
        match &self.config.data_dir {
            Some(dir) => save_store(dir, store).map_err(|e| StandinError::Persist(e.to_string())),
            None => Ok(()),
        }
    }

    /// Persist `next`, then make it the live state.  On a failed write the
    /// live state is left as it was.
    fn commit(&self, live: &mut Store, next: Store) -> Result<(), StandinError> {
        self.persist(&next)?;
        *live = next;
        Ok(())
    }

    /// Execute one admin command.
    pub async fn execute(&self, command: AdminCommand) -> CommandReply {
        let name = command.name().to_ascii_lowercase();
        debug!("<- {}", name);
        let outcome = match name.as_str() {
            "ismaster" => Ok(self.is_master()),
            "ping" => Ok(CommandReply::success()),
            "getparameter" => Ok(self.get_parameter()),
            "setrole" => self.set_role(&command),
            "insert" => self.insert(&command),
            "find" => self.find(&command),
            "addserver" | "enablesharding" | "shardcollection" | "movechunk" | "locateowner" => {
                self.metadata_command(&name, command).await
            }
            _ => Err(StandinError::UnknownCommand(name)),
        };
        outcome.unwrap_or_else(|e| {
            debug!("command failed: {}", e);
            e.into()
        })
    }

    fn is_master(&self) -> CommandReply {
        let mut reply = CommandReply {
            me: Some(self.me.clone()),
            ..CommandReply::success()
        };
        match &self.config.mode {
            Mode::Standalone => {
                reply.ismaster = Some(true);
                reply.secondary = Some(false);
                reply.initial_sync_complete = Some(true);
                if self.config.shard_server {
                    reply = reply.with("shardServer", true);
                }
            }
            Mode::Member { set } => {
                let state = self.lock_member();
                let code = match state.role {
                    MemberRole::Primary => 1,
                    MemberRole::Secondary => 2,
                    MemberRole::Startup => 0,
                };
                reply.ismaster = Some(state.role == MemberRole::Primary);
                reply.secondary = Some(state.role == MemberRole::Secondary);
                reply.my_state = Some(code);
                reply.initial_sync_complete = Some(state.synced);
                reply.primary = state.primary.clone();
                reply = reply
                    .with("setName", set.as_str())
                    .with("electable", state.electable);
            }
            Mode::Arbiter { set } => {
                let state = self.lock_member();
                reply.ismaster = Some(false);
                reply.secondary = Some(false);
                reply.arbiter_only = Some(true);
                reply.my_state = Some(7);
                reply.primary = state.primary.clone();
                reply = reply.with("setName", set.as_str());
            }
            Mode::Router { .. } => {
                reply.ismaster = Some(true);
                reply = reply.with("msg", "isdbgrid");
            }
            Mode::ConfigServer => {
                reply.ismaster = Some(true);
                reply.initial_sync_complete = Some(true);
                reply = reply.with("configsvr", true);
            }
        }
        reply
    }

    fn get_parameter(&self) -> CommandReply {
        self.config
            .parameters
            .iter()
            .fold(CommandReply::success(), |reply, (k, v)| reply.with(k, v.as_str()))
    }

    /// Force a role and stop taking part in elections.
    fn set_role(&self, command: &AdminCommand) -> Outcome {
        if !matches!(self.config.mode, Mode::Member { .. }) {
            return Err(StandinError::Unsupported("setrole".to_string()));
        }
        let role = match str_field(command, "setrole")? {
            "primary" => MemberRole::Primary,
            "secondary" => MemberRole::Secondary,
            "startup" => MemberRole::Startup,
            other => return Err(StandinError::BadValue(format!("unknown role {other}"))),
        };
        let mut state = self.lock_member();
        state.frozen = true;
        state.synced = true;
        state.role = role;
        state.primary = match role {
            MemberRole::Primary => Some(self.me.clone()),
            _ => command
                .get("primary")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        info!("Role forced to {:?}", role);
        Ok(CommandReply::success())
    }

    fn insert(&self, command: &AdminCommand) -> Outcome {
        let writable = match self.config.mode {
            Mode::Standalone | Mode::ConfigServer => true,
            Mode::Member { .. } => self.lock_member().role == MemberRole::Primary,
            Mode::Arbiter { .. } | Mode::Router { .. } => false,
        };
        if !writable {
            return Err(StandinError::NotPrimary);
        }
        let key = str_field(command, "insert")?;
        let value = command.get("value").cloned().unwrap_or(Value::Null);
        let mut store = self.lock_store();
        let mut next = store.clone();
        next.docs.insert(key.to_string(), value);
        self.commit(&mut store, next)?;
        Ok(CommandReply::success())
    }

    fn find(&self, command: &AdminCommand) -> Outcome {
        let key = str_field(command, "find")?;
        let store = self.lock_store();
        let reply = match store.docs.get(key) {
            Some(value) => CommandReply::success()
                .with("found", true)
                .with("value", value.clone()),
            None => CommandReply::success().with("found", false),
        };
        Ok(reply)
    }

    async fn metadata_command(&self, name: &str, command: AdminCommand) -> Outcome {
        match &self.config.mode {
            Mode::ConfigServer => self.apply_metadata(name, &command),
            Mode::Router { config_db } => {
                match self.http.send(*config_db, &command).await {
                    Ok(reply) => Ok(reply),
                    Err(e) => {
                        warn!("Forwarding {} to {} failed: {}", name, config_db, e);
                        Err(StandinError::OwnerUnreachable(e.to_string()))
                    }
                }
            }
            _ => Err(StandinError::Unsupported(name.to_string())),
        }
    }

    fn apply_metadata(&self, name: &str, command: &AdminCommand) -> Outcome {
        let mut store = self.lock_store();
        let mut next = store.clone();
        let reply = match name {
            "addserver" => {
                let host = str_field(command, "addserver")?;
                let shard = str_field(command, "name")?;
                next.meta.add_shard(shard, host)?;
                info!("Registered shard {} at {}", shard, host);
                CommandReply::success().with("shardAdded", shard)
            }
            "enablesharding" => {
                next.meta.enable_sharding(str_field(command, "enablesharding")?)?;
                CommandReply::success()
            }
            "shardcollection" => {
                let ns = str_field(command, "shardcollection")?;
                let key = command
                    .get("key")
                    .cloned()
                    .ok_or_else(|| StandinError::BadValue("missing field key".to_string()))?;
                next.meta.shard_collection(ns, key)?;
                CommandReply::success().with("collectionsharded", ns)
            }
            "movechunk" => {
                let ns = str_field(command, "movechunk")?;
                let key = command
                    .get("find")
                    .ok_or_else(|| StandinError::BadValue("missing field find".to_string()))?;
                let to = str_field(command, "to")?;
                next.meta.move_chunk(ns, key, to)?;
                info!("Moved {} partition {} to {}", ns, key, to);
                CommandReply::success()
            }
            "locateowner" => {
                let ns = str_field(command, "locateowner")?;
                let key = command
                    .get("key")
                    .ok_or_else(|| StandinError::BadValue("missing field key".to_string()))?;
                let owner = store.meta.locate_owner(ns, key)?;
                let host = owner.host.clone();
                return Ok(CommandReply {
                    owner: Some(owner.name.clone()),
                    ..CommandReply::success()
                }
                .with("host", host));
            }
            other => return Err(StandinError::UnknownCommand(other.to_string())),
        };
        self.commit(&mut store, next)?;
        Ok(reply)
    }

    // -- Elections -----------------------------------------------------------

    /// Heartbeat peers forever.  Only members and arbiters have peers to
    /// watch; for every other mode this returns at once.
    pub async fn run_heartbeats(self: Arc<Self>) {
        if self.config.mode.set_name().is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let views = self.probe_peers().await;
            self.on_heartbeat(&views, Instant::now());
        }
    }

    async fn probe_peers(&self) -> Vec<PeerView> {
        let mut views = Vec::with_capacity(self.config.peers.len());
        for peer in &self.config.peers {
            match self.http.send(peer.addr, &AdminCommand::is_master()).await {
                Ok(reply) if reply.ok => views.push(PeerView::from_reply(&reply)),
                Ok(_) => debug!("{} rejected heartbeat", peer.name),
                Err(e) => debug!("Heartbeat to {} failed: {}", peer.name, e),
            }
        }
        views
    }

    /// Apply one round of heartbeat answers.
    ///
    /// The first round only completes initial sync.  A member needs a
    /// majority of the voters (itself included) to become or stay primary,
    /// defers to any visible primary, and ties between candidates go to
    /// the lowest address.
    pub fn on_heartbeat(&self, views: &[PeerView], now: Instant) {
        let mut state = self.lock_member();
        if state.frozen {
            return;
        }
        let visible_primary = views
            .iter()
            .filter(|v| v.ismaster && !v.arbiter)
            .filter_map(|v| v.me.clone())
            .min();
        if visible_primary.is_some() {
            state.last_primary_seen = Some(now);
        }

        if matches!(self.config.mode, Mode::Arbiter { .. }) {
            state.synced = true;
            state.primary = visible_primary;
            return;
        }

        let voters = self.config.peers.len() + 1;
        let has_majority = views.len() + 1 > voters / 2;
        if !state.synced {
            state.synced = true;
            state.electable = has_majority;
            state.role = MemberRole::Secondary;
            state.primary = visible_primary;
            info!("Initial sync complete");
            return;
        }
        state.electable = has_majority;

        match state.role {
            MemberRole::Primary if !has_majority => {
                info!("Stepping down: only {} of {} voters reachable", views.len() + 1, voters);
                state.role = MemberRole::Secondary;
                state.primary = visible_primary;
            }
            MemberRole::Primary => {
                if let Some(other) = visible_primary.filter(|p| p.as_str() < self.me.as_str()) {
                    info!("Stepping down in favour of {}", other);
                    state.role = MemberRole::Secondary;
                    state.primary = Some(other);
                }
            }
            MemberRole::Secondary | MemberRole::Startup => {
                if let Some(primary) = visible_primary {
                    state.role = MemberRole::Secondary;
                    state.primary = Some(primary);
                    return;
                }
                state.primary = None;
                let quiet = state
                    .last_primary_seen
                    .map_or(true, |seen| now.duration_since(seen) >= self.config.election_timeout);
                let outranked = views.iter().any(|v| {
                    v.electable && !v.arbiter && v.me.as_deref().is_some_and(|m| m < self.me.as_str())
                });
                if has_majority && quiet && !outranked {
                    info!("Elected primary with {} of {} voters", views.len() + 1, voters);
                    state.role = MemberRole::Primary;
                    state.primary = Some(self.me.clone());
                } else {
                    state.role = MemberRole::Secondary;
                }
            }
        }
    }
}

fn str_field<'a>(command: &'a AdminCommand, key: &str) -> Result<&'a str, StandinError> {
    command
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StandinError::BadValue(format!("field {key} must be a string")))
}

// -- HTTP --------------------------------------------------------------------

/// Build the axum [`Router`] serving the admin surface.
pub fn app(node: Arc<Standin>) -> Router {
    Router::new()
        .route("/admin", post(handle_admin))
        .route("/health", get(health_check))
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}

async fn handle_admin(
    State(node): State<Arc<Standin>>,
    Json(command): Json<AdminCommand>,
) -> Json<CommandReply> {
    Json(node.execute(command).await)
}

async fn health_check() -> &'static str {
    "ok"
}
