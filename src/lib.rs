//! clusterrig -- a test harness for replicated and sharded database clusters.
//!
//! The harness launches server processes on local ports, routes every
//! inter-node connection through relays it can cut and restore, and polls
//! the nodes' administrative command surface until the cluster reaches a
//! role assignment the caller describes.  Two topologies are provided: a
//! replica pair with an arbiter ([`replica_pair`]) and a routed cluster of
//! shards, routers and a metadata owner ([`cluster`]).

pub mod bridge;
pub mod cluster;
pub mod command;
pub mod config;
pub mod errors;
pub mod logging;
pub mod observer;
pub mod options;
pub mod ports;
pub mod process;
pub mod replica_pair;
pub mod retry;
pub mod role;
pub mod signal;
pub mod standin;
pub mod testing;

pub use errors::{HarnessError, Result};
