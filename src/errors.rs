//! Harness error types.
//!
//! Every harness operation either succeeds or returns a [`HarnessError`];
//! there is no silent partial success.  Variants fall into four categories
//! (see [`ErrorCategory`]): process-level failures, connectivity failures
//! of the command surface, convergence failures, and misuse.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bridge::LinkId;
use crate::command::CommandError;
use crate::role::RoleSnapshot;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Coarse classification of a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Spawn failure, port never opened, abnormal exit.
    Process,
    /// A node could not be reached over the command surface.
    Connectivity,
    /// The cluster never reached the expected steady state.
    Convergence,
    /// The caller asked for something the harness cannot do.
    Misuse,
}

/// Errors surfaced by the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The OS refused to spawn the process.
    #[error("failed to launch {program}: {source}")]
    LaunchError {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process was spawned but its port never accepted a connection.
    #[error("{node} did not accept connections on {addr} after {attempts} attempts")]
    StartupTimeout {
        node: String,
        addr: SocketAddr,
        attempts: u32,
    },

    /// The process exited before it became reachable.
    #[error("{node} exited during startup ({status})")]
    ProcessExited { node: String, status: String },

    /// The predicate never held within the timeout.  Carries the last
    /// observed role of every node.
    #[error("{description} did not converge within {timeout:?}; last observed: {last}")]
    ConvergenceTimeout {
        description: String,
        timeout: Duration,
        last: RoleSnapshot,
    },

    /// The harness was torn down while the operation was in flight.
    #[error("operation cancelled by harness teardown")]
    Cancelled,

    /// A link id that was never declared on this graph.
    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    /// A node name that is not part of this harness.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// The requested topology cannot be built.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Launch options were rejected at construction time.
    #[error("invalid launch options: {0}")]
    InvalidOptions(String),

    /// Every port in the configured range is taken.
    #[error("no free port in range {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// The node answered, but reported a failure.
    #[error("command {command} failed on {addr}: {message}")]
    CommandFailed {
        addr: SocketAddr,
        command: String,
        code: Option<i64>,
        message: String,
    },

    /// The command surface could not deliver a request or its reply.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Local filesystem or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Return a stable, machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::LaunchError { .. } => "LaunchError",
            HarnessError::StartupTimeout { .. } => "StartupTimeout",
            HarnessError::ProcessExited { .. } => "ProcessExited",
            HarnessError::ConvergenceTimeout { .. } => "ConvergenceTimeout",
            HarnessError::Cancelled => "Cancelled",
            HarnessError::UnknownLink(_) => "UnknownLink",
            HarnessError::UnknownNode(_) => "UnknownNode",
            HarnessError::InvalidTopology(_) => "InvalidTopology",
            HarnessError::InvalidOptions(_) => "InvalidOptions",
            HarnessError::PortsExhausted { .. } => "PortsExhausted",
            HarnessError::CommandFailed { .. } => "CommandFailed",
            HarnessError::Command(_) => "CommandError",
            HarnessError::Io(_) => "IoError",
        }
    }

    /// Return the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::LaunchError { .. }
            | HarnessError::StartupTimeout { .. }
            | HarnessError::ProcessExited { .. }
            | HarnessError::PortsExhausted { .. }
            | HarnessError::Io(_) => ErrorCategory::Process,
            HarnessError::Command(_) | HarnessError::CommandFailed { .. } => {
                ErrorCategory::Connectivity
            }
            HarnessError::ConvergenceTimeout { .. } | HarnessError::Cancelled => {
                ErrorCategory::Convergence
            }
            HarnessError::UnknownLink(_)
            | HarnessError::UnknownNode(_)
            | HarnessError::InvalidTopology(_)
            | HarnessError::InvalidOptions(_) => ErrorCategory::Misuse,
        }
    }
}
