//! Administrative command surface.
//!
//! Requests are ordered JSON documents whose first key names the command
//! (`{"ismaster": 1}`); replies are JSON documents with an `ok` indicator
//! and optional role fields.  The harness only relies on the contract
//! "send a request, get a typed reply within a bounded time, or a
//! connection failure"; everything else about the server is opaque.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::errors::{HarnessError, Result};

/// Transport failures of the command surface.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No connection could be made.  The node never saw the request.
    #[error("{addr} is unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    /// The connection broke after the request may have been sent.  The
    /// node may or may not have acted on it.
    #[error("connection to {addr} lost: {reason}")]
    ConnectionLost { addr: SocketAddr, reason: String },

    /// The node did not reply within the command budget.
    #[error("{addr} did not reply within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    /// The node replied with something that is not a command reply.
    #[error("malformed reply from {addr}: {reason}")]
    MalformedReply { addr: SocketAddr, reason: String },
}

impl CommandError {
    /// Whether the failure happened before the node could have seen the
    /// request.  Only these are safe to retry against another router.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, CommandError::Unreachable { .. })
    }
}

// -- Requests ----------------------------------------------------------------

/// An administrative request document.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminCommand {
    body: Map<String, Value>,
}

impl AdminCommand {
    /// Start a command named `name` with `value` as its first field.
    pub fn new(name: &str, value: impl Into<Value>) -> Self {
        let mut body = Map::new();
        body.insert(name.to_string(), value.into());
        Self { body }
    }

    /// Append a field.
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// The command name, i.e. the first key.
    pub fn name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }

    pub fn is_master() -> Self {
        Self::new("ismaster", 1)
    }

    pub fn ping() -> Self {
        Self::new("ping", 1)
    }

    pub fn enable_routing(db: &str) -> Self {
        Self::new("enablesharding", db)
    }

    pub fn shard_collection(ns: &str, key: &str) -> Self {
        let mut pattern = Map::new();
        pattern.insert(key.to_string(), json!(1));
        Self::new("shardcollection", ns).arg("key", pattern)
    }

    pub fn add_server(name: &str, addr: SocketAddr) -> Self {
        Self::new("addserver", addr.to_string()).arg("name", name)
    }

    pub fn move_partition(ns: &str, key: impl Into<Value>, to: &str) -> Self {
        Self::new("movechunk", ns)
            .arg("find", key.into())
            .arg("to", to)
    }

    pub fn locate_owner(ns: &str, key: impl Into<Value>) -> Self {
        Self::new("locateowner", ns).arg("key", key.into())
    }

    pub fn insert(key: &str, value: impl Into<Value>) -> Self {
        Self::new("insert", key).arg("value", value.into())
    }

    pub fn find(key: &str) -> Self {
        Self::new("find", key)
    }

    /// Force a stand-in node into `role` and freeze its elections.
    pub fn set_role(role: &str, primary: Option<SocketAddr>) -> Self {
        let cmd = Self::new("setrole", role);
        match primary {
            Some(addr) => cmd.arg("primary", addr.to_string()),
            None => cmd,
        }
    }
}

impl From<Map<String, Value>> for AdminCommand {
    fn from(body: Map<String, Value>) -> Self {
        Self { body }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for AdminCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AdminCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let body = Map::deserialize(deserializer)?;
        if body.is_empty() {
            return Err(serde::de::Error::custom("empty command document"));
        }
        Ok(Self { body })
    }
}

// -- Replies -----------------------------------------------------------------

/// A command reply.  Known fields are typed; everything else lands in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default, deserialize_with = "de_ok", serialize_with = "ser_ok")]
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ismaster: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<bool>,

    #[serde(rename = "arbiterOnly", default, skip_serializing_if = "Option::is_none")]
    pub arbiter_only: Option<bool>,

    #[serde(rename = "initialsynccomplete", default, skip_serializing_if = "Option::is_none")]
    pub initial_sync_complete: Option<bool>,

    #[serde(rename = "myState", default, skip_serializing_if = "Option::is_none")]
    pub my_state: Option<i64>,

    /// Address of the node this node believes is primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// The replying node's own address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,

    /// Owning shard, for `locateowner`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandReply {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failure(code: i64, errmsg: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code),
            errmsg: Some(errmsg.into()),
            ..Self::default()
        }
    }

    /// Add an untyped field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Turn an `ok: 0` reply into [`HarnessError::CommandFailed`].
    pub fn into_result(self, addr: SocketAddr, command: &AdminCommand) -> Result<Self> {
        if self.ok {
            return Ok(self);
        }
        Err(HarnessError::CommandFailed {
            addr,
            command: command.name().to_string(),
            code: self.code,
            message: self
                .errmsg
                .unwrap_or_else(|| "command failed without errmsg".to_string()),
        })
    }
}

fn de_ok<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64() == Some(1.0)),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid ok value {other}"))),
    }
}

fn ser_ok<S: Serializer>(ok: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(if *ok { 1.0 } else { 0.0 })
}

// -- Client ------------------------------------------------------------------

/// Sends administrative commands to nodes.
pub trait CommandClient: Send + Sync + 'static {
    /// Send `command` to the node at `addr` and return its reply, whatever
    /// its `ok` value.
    fn send(
        &self,
        addr: SocketAddr,
        command: &AdminCommand,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<CommandReply, CommandError>> + Send + '_>>;
}

/// Send `command` and fail on transport errors and `ok: 0` replies alike.
pub async fn run_command(
    client: &dyn CommandClient,
    addr: SocketAddr,
    command: &AdminCommand,
) -> Result<CommandReply> {
    let reply = client.send(addr, command).await?;
    reply.into_result(addr, command)
}

/// JSON over HTTP: `POST http://<addr>/admin`.
#[derive(Debug, Clone)]
pub struct HttpCommandClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCommandClient {
    /// Create a client whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            // Nodes restart on the same port; never reuse a connection
            // to a previous incarnation.
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| std::io::Error::other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    async fn post(
        &self,
        addr: SocketAddr,
        command: AdminCommand,
    ) -> std::result::Result<CommandReply, CommandError> {
        let url = format!("http://{}/admin", addr);
        debug!("-> {} {}", addr, command.name());
        let response = self
            .client
            .post(&url)
            .json(&command)
            .send()
            .await
            .map_err(|e| self.classify(addr, e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(addr, e))?;
        serde_json::from_slice::<CommandReply>(&body).map_err(|e| CommandError::MalformedReply {
            addr,
            reason: format!("HTTP {status}: {e}"),
        })
    }

    fn classify(&self, addr: SocketAddr, e: reqwest::Error) -> CommandError {
        if e.is_timeout() {
            CommandError::Timeout {
                addr,
                timeout: self.timeout,
            }
        } else if e.is_connect() {
            CommandError::Unreachable {
                addr,
                reason: e.to_string(),
            }
        } else if e.is_decode() {
            CommandError::MalformedReply {
                addr,
                reason: e.to_string(),
            }
        } else {
            CommandError::ConnectionLost {
                addr,
                reason: e.to_string(),
            }
        }
    }
}

impl CommandClient for HttpCommandClient {
    fn send(
        &self,
        addr: SocketAddr,
        command: &AdminCommand,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<CommandReply, CommandError>> + Send + '_>>
    {
        let command = command.clone();
        Box::pin(self.post(addr, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_command_name_is_first_key() {
        let cmd = AdminCommand::move_partition("app.users", "k42", "shard1");
        assert_eq!(cmd.name(), "movechunk");
        let text = serde_json::to_string(&cmd).unwrap();
        assert_eq!(text, r#"{"movechunk":"app.users","find":"k42","to":"shard1"}"#);
    }

    #[test]
    fn test_command_parses_back() {
        let cmd: AdminCommand =
            serde_json::from_str(r#"{"shardcollection":"app.users","key":{"uid":1}}"#).unwrap();
        assert_eq!(cmd, AdminCommand::shard_collection("app.users", "uid"));
        assert!(serde_json::from_str::<AdminCommand>("{}").is_err());
    }

    #[test]
    fn test_ok_accepts_number_and_bool() {
        for (doc, expected) in [
            (r#"{"ok":1}"#, true),
            (r#"{"ok":1.0}"#, true),
            (r#"{"ok":true}"#, true),
            (r#"{"ok":0}"#, false),
            (r#"{"ok":0.0}"#, false),
            (r#"{}"#, false),
        ] {
            let reply: CommandReply = serde_json::from_str(doc).unwrap();
            assert_eq!(reply.ok, expected, "{doc}");
        }
        assert!(serde_json::from_str::<CommandReply>(r#"{"ok":"yes"}"#).is_err());
    }

    #[test]
    fn test_reply_keeps_unknown_fields() {
        let reply: CommandReply = serde_json::from_str(
            r#"{"ok":1,"ismaster":false,"arbiterOnly":true,"myState":7,"setName":"rs0"}"#,
        )
        .unwrap();
        assert_eq!(reply.arbiter_only, Some(true));
        assert_eq!(reply.my_state, Some(7));
        assert_eq!(reply.get("setName"), Some(&json!("rs0")));
    }

    #[test]
    fn test_failed_reply_becomes_command_failed() {
        let addr: SocketAddr = "127.0.0.1:20000".parse().unwrap();
        let cmd = AdminCommand::insert("k", 1);
        let err = CommandReply::failure(10107, "not master")
            .into_result(addr, &cmd)
            .unwrap_err();
        match &err {
            HarnessError::CommandFailed { code, message, command, .. } => {
                assert_eq!(*code, Some(10107));
                assert_eq!(message, "not master");
                assert_eq!(command, "insert");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(CommandReply::success().into_result(addr, &cmd).is_ok());
    }

    #[test]
    fn test_reply_serializes_ok_as_number() {
        let text = serde_json::to_string(&CommandReply::success().with("found", true)).unwrap();
        assert_eq!(text, r#"{"ok":1.0,"found":true}"#);
    }

    #[tokio::test]
    async fn test_http_client_reports_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let client = HttpCommandClient::new(Duration::from_secs(2)).unwrap();
        let err = client.send(addr, &AdminCommand::ping()).await.unwrap_err();
        assert!(err.is_connection_failure(), "{err}");
    }

    #[tokio::test]
    async fn test_dropped_after_request_is_not_a_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            testing::read_http_request(&mut stream).await
        });

        let client = HttpCommandClient::new(Duration::from_secs(2)).unwrap();
        let cmd = AdminCommand::move_partition("app.users", 7, "shard1");
        let err = client.send(addr, &cmd).await.unwrap_err();
        assert!(matches!(err, CommandError::ConnectionLost { .. }), "{err}");
        assert!(!err.is_connection_failure());

        let request = server.await.unwrap();
        assert!(request.contains("movechunk"), "{request}");
    }
}
