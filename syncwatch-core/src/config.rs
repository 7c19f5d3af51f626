//! Client configuration
//!
//! Everything here is consumed, not owned: the embedder builds a
//! [`ClientConfig`] (or deserializes one) and hands it to the client.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::player::PlayerKind;

pub const DEFAULT_PORT: u16 = 8999;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("slowdown_rate must lie strictly between 0 and 1 (got {0})")]
    SlowdownRate(f64),

    #[error("slowdown_reset_threshold ({reset}) must be below slowdown_threshold ({slowdown})")]
    NoHysteresis { reset: f64, slowdown: f64 },

    #[error("server host is empty")]
    EmptyHost,

    #[error("server port must not be 0")]
    ZeroPort,

    #[error("reconnect policy: {0}")]
    Reconnect(String),

    #[error("{0} has no supported control interface")]
    UnsupportedPlayer(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Server password, sent with `Hello`
    pub password: Option<String>,
    /// Ask for a STARTTLS upgrade before authenticating
    pub use_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            password: None,
            use_tls: true,
        }
    }
}

/// Drift thresholds in seconds, plus engine cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub seek_threshold_rewind: f64,
    pub seek_threshold_fastforward: f64,
    pub slowdown_threshold: f64,
    pub slowdown_reset_threshold: f64,
    pub slowdown_rate: f64,
    pub sync_interval: Duration,
    /// Engine passes skipped for position corrections after a local seek
    pub seek_grace_cycles: u32,
    /// Pause when the last other viewer leaves while we are ready
    pub pause_on_leave: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            seek_threshold_rewind: 4.0,
            seek_threshold_fastforward: 5.0,
            slowdown_threshold: 1.5,
            slowdown_reset_threshold: 0.5,
            slowdown_rate: 0.95,
            sync_interval: Duration::from_secs(1),
            seek_grace_cycles: 1,
            pause_on_leave: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.2 = ±20 %
    pub jitter: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::Reconnect(format!(
                "multiplier must be at least 1 (got {})",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Reconnect(format!(
                "jitter must lie in [0, 1) (got {})",
                self.jitter
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::Reconnect(
                "initial_delay exceeds max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Which control dialect to speak; guessed from `player_path` when unset
    pub kind: Option<PlayerKind>,
    /// Player executable, only used to recognise the player
    pub player_path: Option<String>,
    /// Unix socket path or Windows pipe name of the player's control
    /// interface (mpv `--input-ipc-server`, VLC `--rc-unix`)
    pub socket_path: Option<PathBuf>,
    pub command_timeout: Duration,
    /// Timeouts in a row before the control channel is considered dead
    pub max_consecutive_timeouts: u32,
    /// Searched in order when a playlist entry has to be loaded
    pub media_directories: Vec<PathBuf>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            kind: None,
            player_path: None,
            socket_path: None,
            command_timeout: Duration::from_secs(5),
            max_consecutive_timeouts: 3,
            media_directories: Vec::new(),
        }
    }
}

impl PlayerConfig {
    /// mpv unless configured or recognisable from `player_path`
    pub fn resolved_kind(&self) -> PlayerKind {
        match (self.kind, self.player_path.as_deref()) {
            (Some(kind), _) => kind,
            (None, Some(path)) if !path.trim().is_empty() => PlayerKind::from_path(path),
            _ => PlayerKind::Mpv,
        }
    }
}

/// How much of the local filename is shared with the room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenamePrivacy {
    #[default]
    Send,
    Hash,
    DontSend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub reconnect: ReconnectPolicy,
    pub player: PlayerConfig,
    /// Silence on the wire longer than this counts as a dead transport
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub filename_privacy: FilenamePrivacy,
    pub shared_playlist_loop: bool,
    /// Controllers allowed per room; `None` means unlimited
    pub max_controllers_per_room: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sync: SyncConfig::default(),
            reconnect: ReconnectPolicy::default(),
            player: PlayerConfig::default(),
            heartbeat_timeout: Duration::from_secs(12),
            handshake_timeout: Duration::from_secs(10),
            filename_privacy: FilenamePrivacy::Send,
            shared_playlist_loop: false,
            max_controllers_per_room: Some(1),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        for (field, value) in [
            ("seek_threshold_rewind", sync.seek_threshold_rewind),
            ("seek_threshold_fastforward", sync.seek_threshold_fastforward),
            ("slowdown_threshold", sync.slowdown_threshold),
            ("slowdown_reset_threshold", sync.slowdown_reset_threshold),
            ("sync_interval", sync.sync_interval.as_secs_f64()),
            ("heartbeat_timeout", self.heartbeat_timeout.as_secs_f64()),
            ("handshake_timeout", self.handshake_timeout.as_secs_f64()),
            ("command_timeout", self.player.command_timeout.as_secs_f64()),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        if sync.slowdown_rate.is_nan() || sync.slowdown_rate <= 0.0 || sync.slowdown_rate >= 1.0 {
            return Err(ConfigError::SlowdownRate(sync.slowdown_rate));
        }
        if sync.slowdown_reset_threshold >= sync.slowdown_threshold {
            return Err(ConfigError::NoHysteresis {
                reset: sync.slowdown_reset_threshold,
                slowdown: sync.slowdown_threshold,
            });
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.server.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        let kind = self.player.resolved_kind();
        if !kind.is_supported() {
            return Err(ConfigError::UnsupportedPlayer(kind.display_name()));
        }
        self.reconnect.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.seek_threshold_rewind, 4.0);
        assert_eq!(config.sync.slowdown_rate, 0.95);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.player.max_consecutive_timeouts, 3);
    }

    #[test]
    fn test_rejects_missing_hysteresis() {
        let mut config = ClientConfig::default();
        config.sync.slowdown_reset_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoHysteresis { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.sync.slowdown_rate = 1.0;
        assert_eq!(config.validate(), Err(ConfigError::SlowdownRate(1.0)));

        let mut config = ClientConfig::default();
        config.sync.seek_threshold_rewind = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "seek_threshold_rewind",
                ..
            })
        ));

        let mut config = ClientConfig::default();
        config.server.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPort));

        let mut config = ClientConfig::default();
        config.reconnect.jitter = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Reconnect(_))));
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"server": {"host": "sync.example.net"}, "filename_privacy": "hash"}"#,
        )
        .unwrap();
        assert_eq!(config.server.host, "sync.example.net");
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.filename_privacy, FilenamePrivacy::Hash);
        assert_eq!(config.sync.slowdown_threshold, 1.5);
    }

    #[test]
    fn test_player_kind_resolution() {
        let mut config = ClientConfig::default();
        assert_eq!(config.player.resolved_kind(), PlayerKind::Mpv);

        config.player.player_path = Some("/usr/bin/vlc".into());
        assert_eq!(config.player.resolved_kind(), PlayerKind::Vlc);
        assert!(config.validate().is_ok());

        config.player.kind = Some(PlayerKind::Iina);
        assert_eq!(config.player.resolved_kind(), PlayerKind::Iina);

        config.player.kind = None;
        config.player.player_path = Some("C:\\Program Files\\MPC-HC\\mpc-hc64.exe".into());
        assert_eq!(config.validate(), Err(ConfigError::UnsupportedPlayer("MPC-HC")));

        let config: ClientConfig = serde_json::from_str(r#"{"player": {"kind": "mpv-net"}}"#).unwrap();
        assert_eq!(config.player.resolved_kind(), PlayerKind::MpvNet);
    }
}
