//! Polling-based convergence detection.
//!
//! A [`RoleObserver`] asks every target for its self-reported role, one
//! target at a time and in a fixed order, and folds connection failures
//! into `Unreachable`.  [`RoleObserver::wait_for_state_where`] repeats
//! those polls until a predicate over the resulting [`RoleSnapshot`] has
//! held for several consecutive polls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{AdminCommand, CommandClient};
use crate::config::TimeoutConfig;
use crate::errors::{HarnessError, Result};
use crate::retry::{retry_until, Probe, RetryError};
use crate::role::{Observation, ObservedRole, RoleSnapshot};

/// A node to poll.  `addr` is `None` while the node is not running; such
/// targets are reported `Unreachable` without being contacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub name: String,
    pub addr: Option<SocketAddr>,
}

impl PollTarget {
    pub fn new(name: impl Into<String>, addr: Option<SocketAddr>) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

/// Polls nodes and waits for predicates over their roles.
pub struct RoleObserver {
    client: Arc<dyn CommandClient>,
    timeouts: TimeoutConfig,
    cancel: CancellationToken,
    aliases: HashMap<String, String>,
    last: Mutex<RoleSnapshot>,
}

impl RoleObserver {
    pub fn new(client: Arc<dyn CommandClient>, timeouts: &TimeoutConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            timeouts: timeouts.clone(),
            cancel,
            aliases: HashMap::new(),
            last: Mutex::new(RoleSnapshot::default()),
        }
    }

    /// Record that a node reporting `addr` as primary means `name`.
    pub fn add_alias(&mut self, addr: SocketAddr, name: impl Into<String>) {
        let name = name.into();
        self.aliases
            .insert(format!("localhost:{}", addr.port()), name.clone());
        self.aliases.insert(addr.to_string(), name);
    }

    /// Node name for an address as reported by a node.
    pub fn resolve(&self, reported: &str) -> Option<String> {
        self.aliases.get(reported.trim()).cloned()
    }

    /// The snapshot produced by the most recent poll.
    pub fn last_snapshot(&self) -> RoleSnapshot {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask one target for its role.  Never fails: a node that cannot be
    /// contacted is `Unreachable`.
    pub async fn observe(&self, target: &PollTarget) -> Observation {
        let Some(addr) = target.addr else {
            return Observation::unreachable();
        };
        match self.client.send(addr, &AdminCommand::is_master()).await {
            Ok(reply) if reply.ok => Observation::from_reply(&reply, |a| self.resolve(a)),
            Ok(reply) => {
                warn!(
                    "{} rejected ismaster: {}",
                    target.name,
                    reply.errmsg.as_deref().unwrap_or("no errmsg")
                );
                Observation {
                    role: ObservedRole::Unknown,
                    ..Observation::default()
                }
            }
            Err(e) => {
                warn!("Poll of {} failed, treating as unreachable: {}", target.name, e);
                Observation::unreachable()
            }
        }
    }

    /// Poll every target once, sequentially and in order.
    pub async fn poll(&self, targets: &[PollTarget]) -> RoleSnapshot {
        let mut snapshot = RoleSnapshot::new();
        for target in targets {
            let obs = self.observe(target).await;
            snapshot.insert(target.name.clone(), obs);
        }
        debug!("Polled: {}", snapshot);

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        for t in snapshot.transitions_from(&last) {
            info!("{} {} -> {}", t.node, t.from, t.to);
        }
        *last = snapshot.clone();
        snapshot
    }

    /// Poll until `predicate` holds on `stable_polls` consecutive polls.
    ///
    /// Fails with [`HarnessError::ConvergenceTimeout`] carrying the last
    /// snapshot once `timeout` elapses, or [`HarnessError::Cancelled`] when
    /// the harness is torn down.
    pub async fn wait_for_state_where<P>(
        &self,
        targets: &[PollTarget],
        description: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<RoleSnapshot>
    where
        P: Fn(&RoleSnapshot) -> bool,
    {
        let policy = self.timeouts.poll_policy(timeout);
        let required = self.timeouts.stable_polls.max(1);
        let streak = AtomicU32::new(0);
        debug!("Waiting up to {:?} for {}", timeout, description);

        let outcome = retry_until(&policy, &self.cancel, |attempt| {
            let streak = &streak;
            let predicate = &predicate;
            async move {
                let snapshot = self.poll(targets).await;
                if !predicate(&snapshot) {
                    streak.store(0, Ordering::SeqCst);
                    return Probe::Retry(snapshot);
                }
                let held = streak.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    "{} holds ({}/{}) on attempt {}",
                    description, held, required, attempt
                );
                if held >= required {
                    Probe::Done(snapshot)
                } else {
                    Probe::Retry(snapshot)
                }
            }
        })
        .await;

        match outcome {
            Ok(snapshot) => {
                info!("Converged: {} ({})", description, snapshot);
                Ok(snapshot)
            }
            Err(RetryError::TimedOut { last, .. }) => Err(HarnessError::ConvergenceTimeout {
                description: description.to_string(),
                timeout,
                last: last.unwrap_or_else(|| self.last_snapshot()),
            }),
            Err(RetryError::Cancelled) => Err(HarnessError::Cancelled),
        }
    }
}
