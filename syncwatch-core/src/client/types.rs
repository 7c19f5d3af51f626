//! Client-facing types: error surface, advisories, and the event callback

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::chat::ChatRecord;
use crate::config::ConfigError;
use crate::network::{ConnectError, ConnectionState, SendError};
use crate::player::{PlayerError, PlayerStatus};
use crate::playlist::PlaylistState;
use crate::protocol::ServerErrorKind;
use crate::session::{Member, StateInvariantViolation};

/// Errors returned by [`Client`](super::Client) operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Not connected to a room")]
    NotConnected,

    #[error("Client is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error("Rejected by session state: {0}")]
    Invariant(#[from] StateInvariantViolation),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid identity: {0}")]
    Identity(String),
}

impl From<SendError> for CoreError {
    fn from(_: SendError) -> Self {
        CoreError::NotConnected
    }
}

/// A condition the user should see rather than have silently handled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "advisory", rename_all = "snake_case")]
pub enum Advisory {
    FileMismatch {
        local: String,
        remote: String,
        set_by: Option<String>,
        differences: Vec<String>,
    },
    PlayerUnavailable { reason: String },
    PlayerTimeout { reason: String },
    /// A server `Error` message, verbatim
    SessionError {
        message: String,
        kind: ServerErrorKind,
        fatal: bool,
    },
    TransportError { reason: String },
    MediaNotFound { item: String },
    PlaybackError { reason: String },
    InvariantViolation { reason: String },
}

impl Advisory {
    /// One line suitable for a chat record or on-screen message
    pub fn message(&self) -> String {
        match self {
            Advisory::FileMismatch {
                remote,
                set_by,
                differences,
                ..
            } => match set_by {
                Some(user) => format!(
                    "Your file differs from {}'s ({}): {}",
                    user,
                    remote,
                    differences.join(", ")
                ),
                None => format!("Your file differs from the room's ({}): {}", remote, differences.join(", ")),
            },
            Advisory::PlayerUnavailable { reason } => format!("Player unavailable: {}", reason),
            Advisory::PlayerTimeout { reason } => format!("Player not responding: {}", reason),
            Advisory::SessionError { message, .. } => format!("Server error: {}", message),
            Advisory::TransportError { reason } => format!("Connection problem: {}", reason),
            Advisory::MediaNotFound { item } => format!("Could not find '{}' in the media directories", item),
            Advisory::PlaybackError { reason } => format!("Playback failed: {}", reason),
            Advisory::InvariantViolation { reason } => format!("Ignored inconsistent update: {}", reason),
        }
    }
}

/// Receives everything the client wants to show. Calls arrive from the
/// client's background tasks and must not block.
pub trait ClientCallback: Send + Sync {
    fn on_connection_state_changed(&self, state: ConnectionState);
    fn on_roster_changed(&self, members: Vec<Member>);
    fn on_chat(&self, record: ChatRecord);
    fn on_playlist_changed(&self, playlist: PlaylistState);
    fn on_player_state(&self, status: PlayerStatus);
    fn on_advisory(&self, advisory: Advisory);
}

/// Replaceable callback; calls are made outside the lock
#[derive(Clone, Default)]
pub(crate) struct CallbackSlot {
    inner: Arc<RwLock<Option<Arc<dyn ClientCallback>>>>,
}

impl CallbackSlot {
    pub fn set(&self, callback: Option<Arc<dyn ClientCallback>>) {
        *self.inner.write() = callback;
    }

    pub fn emit(&self, f: impl FnOnce(&dyn ClientCallback)) {
        let callback = self.inner.read().clone();
        if let Some(callback) = callback {
            f(callback.as_ref());
        }
    }
}

/// Player work queued by frame handlers and carried out on the player loop
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlayerAction {
    Seek(f64),
    SetPaused(bool),
    Load(String),
}

/// What the player is expected to report because we asked for it, so our own
/// commands are not mistaken for user actions.
#[derive(Debug, Default)]
pub(crate) struct LocalActivity {
    pub expected_pause: Option<bool>,
    pub expected_seeks: u32,
    /// Last pause value reported by the player; `None` until the first report
    pub last_paused: Option<bool>,
    pub last_status_emit: Option<Instant>,
}
