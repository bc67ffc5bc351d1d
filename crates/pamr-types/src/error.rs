//! Shared error type for the PAMR system.

use crate::agent_id::AgentId;
use thiserror::Error;

/// Every failure a router or agent operation can surface.
///
/// A two-way `send` always terminates with either a reply or one of these.
#[derive(Error, Debug)]
pub enum PamrError {
    /// The router could not be reached within the connect timeout.
    #[error("Cannot connect to router {address}: {reason}")]
    ConnectFailure {
        /// Router address that was tried.
        address: String,
        /// Last underlying failure.
        reason: String,
    },

    /// An AgentID was claimed with a wrong or missing magic cookie.
    #[error("Wrong magic cookie for agent {0}")]
    AuthFailure(AgentId),

    /// A reservable id is held by a live connection with another cookie.
    #[error("Agent id {0} is already in use")]
    IdInUse(AgentId),

    /// The destination of a message is not registered on the router.
    #[error("Destination agent {0} is unknown to the router")]
    DestinationUnknown(AgentId),

    /// A destination was still unknown after the bounded retry window.
    #[error("Destination agent {agent} not available after {attempts} attempts")]
    NotYetAvailable {
        /// The destination that never showed up.
        agent: AgentId,
        /// How many sends were attempted.
        attempts: u32,
    },

    /// Malformed frame or a message received in the wrong state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection to the router dropped while the operation was pending.
    #[error("Connection to router lost")]
    ConnectionLost,

    /// The destination agent disconnected before replying.
    #[error("Agent {0} disconnected before replying")]
    PeerDisconnected(AgentId),

    /// The remote handler reported a failure for this call.
    #[error("Remote agent failed: {0}")]
    RemoteFailure(String),

    /// A connect or call exceeded its configured bound.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// The router does not know the AgentID presented for reconnection.
    #[error("Invalid agent id {0}")]
    InvalidAgentId(u32),

    /// The dynamic AgentID space is exhausted.
    #[error("No dynamic agent id left")]
    CapacityExhausted,

    /// SSH host key could not be verified against the known-hosts file.
    #[error("Host key verification failed for {host}: {reason}")]
    HostKeyVerification {
        /// Host whose key was checked.
        host: String,
        /// Why verification failed.
        reason: String,
    },

    /// Tunnel establishment failed.
    #[error("Tunnel to {host} failed: {reason}")]
    Tunnel {
        /// Target host of the tunnel.
        host: String,
        /// Underlying failure.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The router or agent is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PamrError {
    /// Whether a caller may reasonably retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailure { .. }
                | Self::ConnectionLost
                | Self::DestinationUnknown(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }
}

/// Alias for Result with PamrError.
pub type PamrResult<T> = Result<T, PamrError>;
