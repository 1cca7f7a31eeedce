//! In-memory command client for tests.
//!
//! [`ScriptedClient`] answers commands from a script instead of the
//! network, so observer and harness logic can be exercised without
//! launching processes.  Addresses with no script are unreachable.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::command::{AdminCommand, CommandClient, CommandError, CommandReply};
use crate::role::ObservedRole;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(CommandReply),
    Unreachable,
    /// The request went out but the connection broke before a reply.
    ConnectionLost,
    Timeout,
}

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<SocketAddr, VecDeque<Scripted>>,
    by_command: HashMap<(SocketAddr, String), Scripted>,
    standing: HashMap<SocketAddr, Scripted>,
    sent: Vec<(SocketAddr, AdminCommand)>,
}

/// A [`CommandClient`] driven by a script.
///
/// Lookup order for each request: queued one-shot answers for the
/// address, then a standing answer for `(address, command name)`, then a
/// standing answer for the address.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standing reply for every command sent to `addr`.
    pub fn set(&self, addr: SocketAddr, reply: CommandReply) {
        self.lock().standing.insert(addr, Scripted::Reply(reply));
    }

    pub fn set_unreachable(&self, addr: SocketAddr) {
        self.lock().standing.insert(addr, Scripted::Unreachable);
    }

    /// Standing reply for command `name` sent to `addr`.
    pub fn on(&self, addr: SocketAddr, name: &str, answer: Scripted) {
        self.lock()
            .by_command
            .insert((addr, name.to_string()), answer);
    }

    /// One-shot reply, consumed before any standing answer.
    pub fn push(&self, addr: SocketAddr, reply: CommandReply) {
        self.push_answer(addr, Scripted::Reply(reply));
    }

    pub fn push_answer(&self, addr: SocketAddr, answer: Scripted) {
        self.lock().queued.entry(addr).or_default().push_back(answer);
    }

    /// Every request received so far, in order.
    pub fn sent(&self) -> Vec<(SocketAddr, AdminCommand)> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, addr: SocketAddr) -> Vec<AdminCommand> {
        self.lock()
            .sent
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn answer(&self, addr: SocketAddr, command: &AdminCommand) -> Scripted {
        let mut script = self.lock();
        script.sent.push((addr, command.clone()));
        if let Some(next) = script.queued.get_mut(&addr).and_then(VecDeque::pop_front) {
            return next;
        }
        if let Some(answer) = script.by_command.get(&(addr, command.name().to_string())) {
            return answer.clone();
        }
        script
            .standing
            .get(&addr)
            .cloned()
            .unwrap_or(Scripted::Unreachable)
    }
}

impl CommandClient for ScriptedClient {
    fn send(
        &self,
        addr: SocketAddr,
        command: &AdminCommand,
    ) -> Pin<Box<dyn Future<Output = Result<CommandReply, CommandError>> + Send + '_>> {
        let answer = self.answer(addr, command);
        Box::pin(async move {
            match answer {
                Scripted::Reply(reply) => Ok(reply),
                Scripted::Unreachable => Err(CommandError::Unreachable {
                    addr,
                    reason: "connection refused (scripted)".to_string(),
                }),
                Scripted::ConnectionLost => Err(CommandError::ConnectionLost {
                    addr,
                    reason: "connection closed before reply (scripted)".to_string(),
                }),
                Scripted::Timeout => Err(CommandError::Timeout {
                    addr,
                    timeout: Duration::ZERO,
                }),
            }
        })
    }
}

/// Read one HTTP request (headers plus `Content-Length` body) from
/// `stream` without answering it.  Returns the raw request text.
pub async fn read_http_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let body_len = text[..end]
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// `ismaster` reply of a synced replica member in `role`.
pub fn member_reply(role: ObservedRole, primary: Option<SocketAddr>) -> CommandReply {
    let state = match role {
        ObservedRole::Primary => 1,
        ObservedRole::Secondary => 2,
        ObservedRole::Unreachable => 8,
        ObservedRole::Unknown => 0,
    };
    CommandReply {
        ok: true,
        ismaster: Some(role == ObservedRole::Primary),
        secondary: Some(role == ObservedRole::Secondary),
        initial_sync_complete: Some(true),
        my_state: Some(state),
        primary: primary.map(|a| a.to_string()),
        ..CommandReply::default()
    }
}

/// `ismaster` reply of an arbiter.
pub fn arbiter_reply(primary: Option<SocketAddr>) -> CommandReply {
    CommandReply {
        ok: true,
        ismaster: Some(false),
        secondary: Some(false),
        arbiter_only: Some(true),
        my_state: Some(7),
        primary: primary.map(|a| a.to_string()),
        ..CommandReply::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_order() {
        let client = ScriptedClient::new();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        client.set(addr, CommandReply::success().with("from", "standing"));
        client.on(
            addr,
            "ping",
            Scripted::Reply(CommandReply::success().with("from", "ping")),
        );
        client.push_answer(addr, Scripted::Timeout);

        let first = client.send(addr, &AdminCommand::ping()).await;
        assert!(matches!(first, Err(CommandError::Timeout { .. })));
        let second = client.send(addr, &AdminCommand::ping()).await.unwrap();
        assert_eq!(second.get("from"), Some(&serde_json::json!("ping")));
        let third = client.send(addr, &AdminCommand::is_master()).await.unwrap();
        assert_eq!(third.get("from"), Some(&serde_json::json!("standing")));
        assert_eq!(client.sent_to(addr).len(), 3);
    }
}
