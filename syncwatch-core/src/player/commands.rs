//! Player commands and observed state, independent of the player dialect

use serde::Serialize;
use serde_json::Value;

/// Properties observed for the lifetime of a player link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservedProperty {
    TimePos,
    Pause,
    Speed,
    Duration,
    Filename,
    FileSize,
}

impl ObservedProperty {
    pub const ALL: [ObservedProperty; 6] = [
        ObservedProperty::TimePos,
        ObservedProperty::Pause,
        ObservedProperty::Speed,
        ObservedProperty::Duration,
        ObservedProperty::Filename,
        ObservedProperty::FileSize,
    ];

    /// Observation id used with `observe_property`
    pub fn id(self) -> u64 {
        match self {
            ObservedProperty::TimePos => 1,
            ObservedProperty::Pause => 2,
            ObservedProperty::Speed => 3,
            ObservedProperty::Duration => 4,
            ObservedProperty::Filename => 5,
            ObservedProperty::FileSize => 6,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            ObservedProperty::TimePos => "time-pos",
            ObservedProperty::Pause => "pause",
            ObservedProperty::Speed => "speed",
            ObservedProperty::Duration => "duration",
            ObservedProperty::Filename => "filename",
            ObservedProperty::FileSize => "file-size",
        }
    }
}

/// A command understood by the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    LoadFile(String),
    /// Absolute position in seconds
    Seek(f64),
    SetPaused(bool),
    SetSpeed(f64),
    GetProperty(ObservedProperty),
    Observe(ObservedProperty),
    ShowText { text: String, duration_ms: u64 },
}

impl PlayerCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PlayerCommand::LoadFile(_) => "loadfile",
            PlayerCommand::Seek(_) => "seek",
            PlayerCommand::SetPaused(_) => "set pause",
            PlayerCommand::SetSpeed(_) => "set speed",
            PlayerCommand::GetProperty(_) => "get_property",
            PlayerCommand::Observe(_) => "observe_property",
            PlayerCommand::ShowText { .. } => "show_text",
        }
    }
}

/// Why the player stopped playing a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndFileReason {
    Eof,
    Stop,
    Quit,
    Error,
    Redirect,
    Unknown,
}

impl EndFileReason {
    pub fn parse(reason: Option<&str>) -> Self {
        match reason {
            Some("eof") => EndFileReason::Eof,
            Some("stop") => EndFileReason::Stop,
            Some("quit") => EndFileReason::Quit,
            Some("error") => EndFileReason::Error,
            Some("redirect") => EndFileReason::Redirect,
            _ => EndFileReason::Unknown,
        }
    }
}

/// Last known player properties
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub position: Option<f64>,
    pub paused: bool,
    pub speed: f64,
    pub duration: Option<f64>,
    pub filename: Option<String>,
    pub file_size: Option<u64>,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            position: None,
            paused: true,
            speed: 1.0,
            duration: None,
            filename: None,
            file_size: None,
        }
    }
}

impl PlayerStatus {
    /// Fold one property value in. `null` means the property is unavailable
    /// (e.g. no file loaded).
    pub fn apply(&mut self, property: ObservedProperty, value: &Value) {
        match property {
            ObservedProperty::TimePos => self.position = value.as_f64(),
            ObservedProperty::Pause => {
                if let Some(paused) = value.as_bool() {
                    self.paused = paused;
                }
            }
            ObservedProperty::Speed => self.speed = value.as_f64().unwrap_or(1.0),
            ObservedProperty::Duration => self.duration = value.as_f64(),
            ObservedProperty::Filename => self.filename = value.as_str().map(str::to_string),
            ObservedProperty::FileSize => self.file_size = value.as_u64(),
        }
    }

    pub fn has_file(&self) -> bool {
        self.filename.is_some()
    }
}
