//! Session-server networking
//!
//! - `connection`: handshake, liveness, reconnect, outbound queue
//! - `tls`: STARTTLS upgrade with native roots
//! - `backoff`: reconnect delays

pub mod backoff;
pub mod connection;
pub mod tls;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::CodecError;

pub use backoff::Backoff;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionSettings, ServerAddress};

/// Lifecycle of the server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    /// Hello acknowledged, waiting for the first roster or state
    Synchronizing,
    Ready,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether a link is open or being opened
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Already connected or connecting")]
    AlreadyConnected,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("Server rejected the session: {reason}")]
    Rejected { reason: String },

    #[error("Server closed the connection during the handshake")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
}

impl ConnectError {
    /// Human-readable reason, as surfaced to callers
    pub fn reason(&self) -> String {
        match self {
            ConnectError::Rejected { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,
}
