//! Player Controller
//!
//! Drives an external media player over its local control channel. mpv
//! (and players speaking its JSON IPC) and VLC's rc interface are supported.

use std::time::Duration;

use thiserror::Error;

pub mod backend;
pub mod commands;
pub mod controller;
pub mod ipc;
pub mod mpv;
pub mod vlc;

pub use backend::{PlayerBackend, PlayerKind};
pub use commands::{EndFileReason, ObservedProperty, PlayerCommand, PlayerStatus};
pub use controller::{PlayerController, PlayerSettings};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlayerError {
    #[error("player is not connected")]
    Unavailable,

    #[error("player did not answer within {0:?}")]
    Timeout(Duration),

    #[error("player rejected the command: {0}")]
    Command(String),

    #[error("cannot reach the player: {0}")]
    Connect(String),

    #[error("unexpected reply from the player: {0}")]
    BadReply(String),

    #[error("{0} cannot be controlled")]
    Unsupported(&'static str),
}

/// Something the player did, published on the controller's event channel
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A control channel was attached
    Connected,
    /// The control channel closed; commands fail until it is re-attached
    Disconnected(String),
    /// Too many consecutive commands timed out; the channel was dropped
    Unresponsive { timeouts: u32 },
    PropertyChanged {
        property: ObservedProperty,
        status: PlayerStatus,
    },
    FileLoaded,
    Seeked,
    EndOfFile(EndFileReason),
    PlaybackError(String),
    Shutdown,
}
