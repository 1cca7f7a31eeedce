//! Observed role state and pure convergence predicates.
//!
//! The harness never knows a node's role authoritatively; it only records
//! what each node last reported about itself.  A [`RoleSnapshot`] maps node
//! names to those [`Observation`]s, and the predicates in this module are
//! plain functions over a snapshot so they can be tested without processes.

use std::collections::BTreeMap;
use std::fmt;

use crate::command::CommandReply;

/// Role a node reports about itself, as seen by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObservedRole {
    #[default]
    Unknown,
    Primary,
    Secondary,
    Unreachable,
}

impl ObservedRole {
    /// Map a numeric member state to a role.
    ///
    /// 1 is primary, 2 secondary, 7 arbiter (observed as secondary), 8 down.
    /// Startup, recovering, rollback, removed and anything unlisted are
    /// `Unknown`.
    pub fn from_state_code(code: i64) -> Self {
        match code {
            1 => ObservedRole::Primary,
            2 | 7 => ObservedRole::Secondary,
            8 => ObservedRole::Unreachable,
            _ => ObservedRole::Unknown,
        }
    }

    pub fn is_reachable(self) -> bool {
        self != ObservedRole::Unreachable
    }
}

impl fmt::Display for ObservedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObservedRole::Unknown => "Unknown",
            ObservedRole::Primary => "Primary",
            ObservedRole::Secondary => "Secondary",
            ObservedRole::Unreachable => "Unreachable",
        };
        f.write_str(s)
    }
}

/// One node's self-report at one poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Observation {
    pub role: ObservedRole,
    /// The node is an arbiter and never eligible as primary.
    pub arbiter: bool,
    /// The node finished its initial data sync.
    pub initial_sync_complete: bool,
    /// Name of the node this node believes is primary, if any.
    pub believes_primary: Option<String>,
}

impl Observation {
    /// A node that could not be contacted.
    pub fn unreachable() -> Self {
        Self {
            role: ObservedRole::Unreachable,
            ..Self::default()
        }
    }

    /// A synced, non-arbiter node in `role`.
    pub fn with_role(role: ObservedRole) -> Self {
        Self {
            role,
            initial_sync_complete: true,
            ..Self::default()
        }
    }

    /// Interpret an `ismaster` reply.
    ///
    /// `resolve` maps the reported primary address to a node name.  The
    /// numeric `myState` wins when present; otherwise the boolean role
    /// fields decide.
    pub fn from_reply<F>(reply: &CommandReply, resolve: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let role = match reply.my_state {
            Some(code) => ObservedRole::from_state_code(code),
            None if reply.ismaster == Some(true) => ObservedRole::Primary,
            None if reply.secondary == Some(true) || reply.arbiter_only == Some(true) => {
                ObservedRole::Secondary
            }
            None => ObservedRole::Unknown,
        };
        let arbiter = reply.arbiter_only.unwrap_or(false);
        Self {
            role,
            arbiter,
            // Arbiters hold no data, so there is nothing for them to sync.
            initial_sync_complete: reply.initial_sync_complete.unwrap_or(arbiter),
            believes_primary: reply.primary.as_deref().and_then(resolve),
        }
    }

    /// Primary that has completed initial sync and is not an arbiter.
    pub fn is_eligible_primary(&self) -> bool {
        self.role == ObservedRole::Primary && !self.arbiter && self.initial_sync_complete
    }
}

/// A role change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node: String,
    pub from: ObservedRole,
    pub to: ObservedRole,
}

/// Ordered map of node name to last observation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleSnapshot {
    nodes: BTreeMap<String, Observation>,
}

impl RoleSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, observation: Observation) {
        self.nodes.insert(name.into(), observation);
    }

    pub fn get(&self, name: &str) -> Option<&Observation> {
        self.nodes.get(name)
    }

    /// Role of `name`; absent nodes read as `Unknown`.
    pub fn role(&self, name: &str) -> ObservedRole {
        self.nodes.get(name).map(|o| o.role).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Observation)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Role changes from `previous` to `self`.  Nodes new in `self` are
    /// reported as coming from `Unknown`.
    pub fn transitions_from(&self, previous: &RoleSnapshot) -> Vec<Transition> {
        self.nodes
            .iter()
            .filter_map(|(name, obs)| {
                let from = previous.role(name);
                (from != obs.role).then(|| Transition {
                    node: name.clone(),
                    from,
                    to: obs.role,
                })
            })
            .collect()
    }
}

impl fmt::Display for RoleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.is_empty() {
            return f.write_str("(no nodes)");
        }
        for (i, (name, obs)) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, obs.role)?;
            if obs.arbiter {
                f.write_str("(arbiter)")?;
            } else if obs.role.is_reachable() && !obs.initial_sync_complete {
                f.write_str("(syncing)")?;
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, Observation)> for RoleSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Observation)>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

// -- Predicates --------------------------------------------------------------

/// Nodes eligible to be counted as primary.
pub fn eligible_primaries(snapshot: &RoleSnapshot) -> Vec<&str> {
    snapshot
        .iter()
        .filter(|(_, obs)| obs.is_eligible_primary())
        .map(|(name, _)| name)
        .collect()
}

/// Exactly one eligible primary.
pub fn single_primary(snapshot: &RoleSnapshot) -> bool {
    eligible_primaries(snapshot).len() == 1
}

/// Exactly one eligible primary, and every reachable node that names a
/// primary names that one.  Arbiters are included.
pub fn steady_state(snapshot: &RoleSnapshot) -> bool {
    let primaries = eligible_primaries(snapshot);
    let [primary] = primaries.as_slice() else {
        return false;
    };
    snapshot
        .iter()
        .filter(|(_, obs)| obs.role.is_reachable())
        .all(|(_, obs)| obs.believes_primary.as_deref() == Some(*primary))
}

/// No node reports itself primary, eligible or not.
pub fn no_primary(snapshot: &RoleSnapshot) -> bool {
    snapshot
        .iter()
        .all(|(_, obs)| obs.role != ObservedRole::Primary)
}

/// `name` is the single eligible primary.
pub fn primary_is(snapshot: &RoleSnapshot, name: &str) -> bool {
    eligible_primaries(snapshot) == [name]
}

/// No node is `Unreachable`.
pub fn all_reachable(snapshot: &RoleSnapshot) -> bool {
    snapshot.iter().all(|(_, obs)| obs.role.is_reachable())
}

/// Two nodes report primary while `reachable(a, b)` holds for them and for
/// every arbiter in both directions.  This must never be true.
pub fn dual_primary<F>(snapshot: &RoleSnapshot, reachable: F) -> bool
where
    F: Fn(&str, &str) -> bool,
{
    let primaries: Vec<&str> = snapshot
        .iter()
        .filter(|(_, obs)| obs.role == ObservedRole::Primary)
        .map(|(name, _)| name)
        .collect();
    let arbiters: Vec<&str> = snapshot
        .iter()
        .filter(|(_, obs)| obs.arbiter)
        .map(|(name, _)| name)
        .collect();
    let connected = |a: &str, b: &str| reachable(a, b) && reachable(b, a);

    primaries.iter().enumerate().any(|(i, a)| {
        primaries[i + 1..].iter().any(|b| {
            connected(a, b)
                && arbiters
                    .iter()
                    .all(|arb| connected(a, arb) && connected(b, arb))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary(believes: &str) -> Observation {
        Observation {
            believes_primary: Some(believes.to_string()),
            ..Observation::with_role(ObservedRole::Primary)
        }
    }

    fn secondary(believes: Option<&str>) -> Observation {
        Observation {
            believes_primary: believes.map(str::to_string),
            ..Observation::with_role(ObservedRole::Secondary)
        }
    }

    fn arbiter(believes: Option<&str>) -> Observation {
        Observation {
            arbiter: true,
            ..secondary(believes)
        }
    }

    fn snapshot(entries: Vec<(&str, Observation)>) -> RoleSnapshot {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_state_code_mapping() {
        assert_eq!(ObservedRole::from_state_code(1), ObservedRole::Primary);
        assert_eq!(ObservedRole::from_state_code(2), ObservedRole::Secondary);
        assert_eq!(ObservedRole::from_state_code(7), ObservedRole::Secondary);
        assert_eq!(ObservedRole::from_state_code(8), ObservedRole::Unreachable);
        for code in [0, 3, 5, 6, 9, 10, -1, -3] {
            assert_eq!(ObservedRole::from_state_code(code), ObservedRole::Unknown);
        }
    }

    #[test]
    fn test_steady_state_requires_agreement() {
        let agreed = snapshot(vec![
            ("left", primary("left")),
            ("right", secondary(Some("left"))),
            ("arbiter", arbiter(Some("left"))),
        ]);
        assert!(steady_state(&agreed));
        assert!(primary_is(&agreed, "left"));

        let disagree = snapshot(vec![
            ("left", primary("left")),
            ("right", secondary(Some("right"))),
            ("arbiter", arbiter(Some("left"))),
        ]);
        assert!(single_primary(&disagree));
        assert!(!steady_state(&disagree));
    }

    #[test]
    fn test_steady_state_ignores_unreachable_members() {
        let snap = snapshot(vec![
            ("left", Observation::unreachable()),
            ("right", primary("right")),
            ("arbiter", arbiter(Some("right"))),
        ]);
        assert!(steady_state(&snap));
        assert!(!all_reachable(&snap));
    }

    #[test]
    fn test_unsynced_primary_is_not_eligible() {
        let mut unsynced = primary("left");
        unsynced.initial_sync_complete = false;
        let snap = snapshot(vec![("left", unsynced), ("right", secondary(Some("left")))]);
        assert!(eligible_primaries(&snap).is_empty());
        assert!(!single_primary(&snap));
        assert!(!no_primary(&snap));
    }

    #[test]
    fn test_arbiter_never_eligible() {
        let mut odd = arbiter(None);
        odd.role = ObservedRole::Primary;
        let snap = snapshot(vec![("arbiter", odd)]);
        assert!(eligible_primaries(&snap).is_empty());
    }

    #[test]
    fn test_no_primary() {
        let snap = snapshot(vec![
            ("left", secondary(None)),
            ("right", Observation::unreachable()),
        ]);
        assert!(no_primary(&snap));
        assert!(!no_primary(&snapshot(vec![("left", primary("left"))])));
    }

    #[test]
    fn test_transitions() {
        let before = snapshot(vec![("left", secondary(None)), ("right", secondary(None))]);
        let after = snapshot(vec![
            ("left", primary("left")),
            ("right", secondary(Some("left"))),
            ("arbiter", arbiter(Some("left"))),
        ]);
        let changes = after.transitions_from(&before);
        assert_eq!(
            changes,
            vec![
                Transition {
                    node: "arbiter".to_string(),
                    from: ObservedRole::Unknown,
                    to: ObservedRole::Secondary,
                },
                Transition {
                    node: "left".to_string(),
                    from: ObservedRole::Secondary,
                    to: ObservedRole::Primary,
                },
            ]
        );
    }

    #[test]
    fn test_dual_primary_respects_reachability() {
        let snap = snapshot(vec![
            ("left", primary("left")),
            ("right", primary("right")),
            ("arbiter", arbiter(None)),
        ]);
        assert!(dual_primary(&snap, |_, _| true));
        // left cut off from the arbiter: two primaries are tolerated.
        assert!(!dual_primary(&snap, |a, b| !(a == "left" && b == "arbiter")));
    }

    #[test]
    fn test_display_lists_every_node() {
        let mut syncing = Observation::with_role(ObservedRole::Secondary);
        syncing.initial_sync_complete = false;
        let snap = snapshot(vec![
            ("arbiter", arbiter(None)),
            ("left", Observation::unreachable()),
            ("right", syncing),
        ]);
        assert_eq!(
            snap.to_string(),
            "arbiter=Secondary(arbiter), left=Unreachable, right=Secondary(syncing)"
        );
        assert_eq!(RoleSnapshot::new().to_string(), "(no nodes)");
    }

    #[test]
    fn test_from_reply_prefers_state_code() {
        let reply: CommandReply = serde_json::from_value(serde_json::json!({
            "ok": 1,
            "ismaster": true,
            "myState": 8,
            "primary": "127.0.0.1:20001",
        }))
        .unwrap();
        let obs = Observation::from_reply(&reply, |addr| {
            (addr == "127.0.0.1:20001").then(|| "right".to_string())
        });
        assert_eq!(obs.role, ObservedRole::Unreachable);
        assert_eq!(obs.believes_primary.as_deref(), Some("right"));
    }

    #[test]
    fn test_from_reply_arbiter() {
        let reply: CommandReply = serde_json::from_value(serde_json::json!({
            "ok": 1.0,
            "ismaster": false,
            "secondary": false,
            "arbiterOnly": true,
        }))
        .unwrap();
        let obs = Observation::from_reply(&reply, |_| None);
        assert_eq!(obs.role, ObservedRole::Secondary);
        assert!(obs.arbiter);
        assert!(obs.initial_sync_complete);
        assert!(!obs.is_eligible_primary());
    }
}
