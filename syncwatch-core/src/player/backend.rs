//! Player backends
//!
//! A backend translates [`PlayerCommand`]s into the lines a particular
//! player understands and turns the player's output back into replies,
//! property values, and lifecycle events. The link task owns the channel and
//! the request bookkeeping; the backend only speaks the dialect.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::commands::{ObservedProperty, PlayerCommand, PlayerStatus};
use super::mpv::MpvBackend;
use super::vlc::VlcBackend;
use super::{PlayerError, PlayerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerKind {
    Mpv,
    MpvNet,
    Vlc,
    Iina,
    Mplayer,
    MpcHc,
    MpcBe,
    Unknown,
}

impl PlayerKind {
    pub fn display_name(self) -> &'static str {
        match self {
            PlayerKind::Mpv => "mpv",
            PlayerKind::MpvNet => "mpv.net",
            PlayerKind::Vlc => "VLC",
            PlayerKind::Iina => "IINA",
            PlayerKind::Mplayer => "MPlayer",
            PlayerKind::MpcHc => "MPC-HC",
            PlayerKind::MpcBe => "MPC-BE",
            PlayerKind::Unknown => "unknown player",
        }
    }

    /// Guess the player from its executable path or name. Either separator
    /// style is accepted so Windows paths are recognised everywhere.
    pub fn from_path(path: &str) -> Self {
        let name = path
            .trim()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.contains("mpvnet") || name.contains("mpv.net") {
            PlayerKind::MpvNet
        } else if name.contains("mpv") {
            PlayerKind::Mpv
        } else if name.contains("vlc") {
            PlayerKind::Vlc
        } else if name.contains("iina") {
            PlayerKind::Iina
        } else if name.contains("mpc-hc") || name.contains("mpchc") || name.contains("shoukaku") {
            PlayerKind::MpcHc
        } else if name.contains("mpc-be") {
            PlayerKind::MpcBe
        } else if name.contains("mplayer") {
            PlayerKind::Mplayer
        } else {
            PlayerKind::Unknown
        }
    }

    /// Whether a control-channel backend exists for this player.
    /// `Unknown` is driven as mpv.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            PlayerKind::Mpv | PlayerKind::MpvNet | PlayerKind::Iina | PlayerKind::Vlc | PlayerKind::Unknown
        )
    }

    /// Build the backend speaking this player's control dialect
    pub fn backend(self) -> Result<Box<dyn PlayerBackend>, PlayerError> {
        match self {
            PlayerKind::Mpv | PlayerKind::MpvNet | PlayerKind::Iina | PlayerKind::Unknown => {
                Ok(Box::new(MpvBackend::new(self)))
            }
            PlayerKind::Vlc => Ok(Box::new(VlcBackend::new())),
            other => Err(PlayerError::Unsupported(other.display_name())),
        }
    }
}

/// How a command finishes
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Wait for the player's reply
    AwaitReply,
    /// Done once written, with this result
    Immediate(Option<Value>),
}

/// Lines produced for one command
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub lines: Vec<String>,
    pub completion: Completion,
    /// Published after writing, for players that do not report the effect
    pub echo: Option<PlayerEvent>,
}

impl Outbound {
    /// Nothing to send; the command succeeds immediately
    pub fn none() -> Self {
        Self::answered_with(None)
    }

    /// Answered from what the backend already knows
    pub fn answered(value: Value) -> Self {
        Self::answered_with(Some(value))
    }

    fn answered_with(value: Option<Value>) -> Self {
        Self {
            lines: Vec::new(),
            completion: Completion::Immediate(value),
            echo: None,
        }
    }

    pub fn request(line: String) -> Self {
        Self {
            lines: vec![line],
            completion: Completion::AwaitReply,
            echo: None,
        }
    }

    /// Written without expecting a reply
    pub fn fire(line: String) -> Self {
        Self {
            lines: vec![line],
            completion: Completion::Immediate(None),
            echo: None,
        }
    }

    pub fn with_echo(mut self, event: PlayerEvent) -> Self {
        self.echo = Some(event);
        self
    }
}

/// What a backend made of one line from the player
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        request_id: u64,
        result: Result<Option<Value>, PlayerError>,
    },
    /// A reply that carries no request id
    Unmatched,
    Property {
        property: ObservedProperty,
        value: Value,
    },
    /// Lifecycle notice; never `PropertyChanged`, which the link builds itself
    Event(PlayerEvent),
}

pub trait PlayerBackend: Send + 'static {
    fn kind(&self) -> PlayerKind;

    /// Translate a command. `status` is the last observed state, for players
    /// whose commands toggle rather than set.
    fn encode(&mut self, command: &PlayerCommand, request_id: u64, status: &PlayerStatus) -> Outbound;

    fn decode(&mut self, line: &str) -> Vec<Inbound>;

    /// Stop waiting for a request that timed out
    fn forget(&mut self, _request_id: u64) {}

    /// Players that cannot push property changes are polled at this cadence
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn polled_properties(&self) -> &'static [ObservedProperty] {
        &[]
    }
}
