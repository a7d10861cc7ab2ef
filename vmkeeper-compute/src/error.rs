//! Error types for server lifecycle and address resolution.
//!
//! Collaborators report their own error types ([`ConnectionError`] for the
//! hypervisor connection, [`SessionError`] for remote sessions). Operations
//! on a [`Server`](crate::Server) catch those at the call boundary and
//! re-raise them as a [`ComputeError`] carrying the attempted command or the
//! target name.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`HypervisorConnection`](crate::HypervisorConnection).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection does not implement the requested call.
    #[error("operation not supported by this connection: {0}")]
    Unsupported(String),

    /// The referenced domain, volume, pool or network does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The hypervisor rejected or failed the request.
    #[error("{0}")]
    Failed(String),
}

/// Errors reported by a [`CommandExecutor`](crate::CommandExecutor) session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// TCP connection refused by the remote host.
    #[error("connection refused")]
    ConnectionRefused,

    /// The remote host rejected our credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The session did not complete in time.
    #[error("session timed out")]
    Timeout,

    /// Anything else (client missing, protocol error, ...).
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to callers of the compute API.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Invalid construction or provisioning parameters.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// `save` was called on a server that already exists on the hypervisor.
    #[error("Duplicate resource: {0}")]
    DuplicateResource(String),

    /// A provisioning step (volume, image, definition) failed.
    #[error("{context}: {source}")]
    Provisioning {
        context: String,
        #[source]
        source: Box<ComputeError>,
    },

    /// A required attribute is missing for a remote-access operation.
    #[error("{0} is required for this operation")]
    Precondition(String),

    /// Remote host refused the connection.
    #[error("{0}")]
    Connectivity(String),

    /// Remote host rejected our credentials.
    #[error("{0}")]
    Authentication(String),

    /// The connection transport cannot run commands.
    #[error("{0}")]
    UnsupportedTransport(String),

    /// A command exited with a non-zero status.
    #[error("The command {command} failed to execute with a clean exit code (status: {status:?})")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// A command produced something other than an address.
    #[error("The result of {command} does not have valid ip-address format\nResult was: {result}")]
    MalformedResult { command: String, result: String },

    /// The host never became reachable over SSH.
    #[error("Host {host} not reachable over ssh within {timeout:?}")]
    Unreachable { host: String, timeout: Duration },

    /// A hypervisor call failed outside the kinds above.
    #[error("{context}: {source}")]
    Hypervisor {
        context: String,
        #[source]
        source: ConnectionError,
    },

    /// A remote session failed outside the kinds above.
    #[error("ssh session to {host} failed: {source}")]
    Remote {
        host: String,
        #[source]
        source: SessionError,
    },

    /// Local filesystem or process failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ComputeError {
    /// Wrap `self` as a provisioning failure unless it already is one.
    pub fn into_provisioning(self, context: impl Into<String>) -> Self {
        match self {
            err @ ComputeError::Provisioning { .. } => err,
            other => ComputeError::Provisioning {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn hypervisor(context: impl Into<String>, source: ConnectionError) -> Self {
        ComputeError::Hypervisor {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ComputeError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for compute operations.
pub type Result<T> = std::result::Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_provisioning_wraps_once() {
        let err = ComputeError::Configuration("Template base not found".to_string())
            .into_provisioning("Error saving the server");
        let err = err.into_provisioning("outer");

        match err {
            ComputeError::Provisioning { context, source } => {
                assert_eq!(context, "Error saving the server");
                assert!(matches!(*source, ComputeError::Configuration(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_provisioning_message_includes_cause() {
        let err = ComputeError::hypervisor("define failed", ConnectionError::Failed("boom".into()))
            .into_provisioning("Error saving the server");
        assert_eq!(err.to_string(), "Error saving the server: define failed: boom");
    }
}
