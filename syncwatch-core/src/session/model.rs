//! Session data model: identity, file fingerprints, playback facts, members

use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::FilenamePrivacy;
use crate::protocol::{FileInfo, FileSize, Features, HelloMessage, RoomInfo, CLIENT_VERSION, PROTOCOL_VERSION};

/// Durations closer than this are the same file
pub const DURATION_TOLERANCE_SECS: f64 = 2.5;

/// Placeholder sent instead of the filename when privacy is `DontSend`
pub const HIDDEN_FILENAME: &str = "**Hidden filename**";

/// Hex characters kept from a privacy hash
const HASH_LEN: usize = 12;

/// Who we are on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub username: String,
    pub room: String,
    pub password: Option<String>,
    /// May set authoritative state regardless of the room's controllers
    pub controller: bool,
}

impl SessionIdentity {
    pub fn new(username: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            room: room.into(),
            password: None,
            controller: false,
        }
    }

    pub fn with_controller(mut self, controller: bool) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.username.trim().is_empty() {
            return Err("username is empty".to_string());
        }
        if self.room.trim().is_empty() {
            return Err("room name is empty".to_string());
        }
        if self.username.contains(['\n', '\r']) || self.room.contains(['\n', '\r']) {
            return Err("names must not contain line breaks".to_string());
        }
        Ok(())
    }

    /// The `Hello` payload announcing this identity
    pub fn hello(&self) -> HelloMessage {
        HelloMessage {
            username: self.username.clone(),
            password: self.password.clone(),
            room: RoomInfo::named(self.room.clone()),
            version: PROTOCOL_VERSION.to_string(),
            realversion: Some(CLIENT_VERSION.to_string()),
            features: Some(Features::client()),
            motd: None,
        }
    }
}

/// First 12 hex characters of SHA-256 over the lowercased input
pub fn privacy_hash(input: &str) -> String {
    let digest = Sha256::digest(input.to_lowercase().as_bytes());
    let mut hashed = hex::encode(digest);
    hashed.truncate(HASH_LEN);
    hashed
}

/// Identity of a media file as exchanged with the room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFingerprint {
    pub name: String,
    /// Seconds
    pub duration: Option<f64>,
    pub size: Option<FileSize>,
}

impl FileFingerprint {
    pub fn new(name: impl Into<String>, duration: Option<f64>, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            duration,
            size: size.map(FileSize::Bytes),
        }
    }

    /// `None` when the sender has no file loaded
    pub fn from_wire(info: &FileInfo) -> Option<Self> {
        let name = info.name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self {
            name: name.to_string(),
            duration: info.duration.filter(|d| *d > 0.0),
            size: info.size.clone().filter(|s| *s != FileSize::Bytes(0)),
        })
    }

    /// Wire form after applying the privacy mode
    pub fn to_wire(&self, privacy: FilenamePrivacy) -> FileInfo {
        let (name, size) = match privacy {
            FilenamePrivacy::Send => (self.name.clone(), self.size.clone()),
            FilenamePrivacy::Hash => (
                privacy_hash(&self.name),
                self.size.as_ref().map(|s| match s {
                    FileSize::Bytes(b) => FileSize::Redacted(privacy_hash(&b.to_string())),
                    redacted => redacted.clone(),
                }),
            ),
            FilenamePrivacy::DontSend => (HIDDEN_FILENAME.to_string(), None),
        };
        FileInfo {
            name: Some(name),
            duration: self.duration,
            size,
        }
    }

    pub fn matches(&self, other: &FileFingerprint) -> bool {
        self.differences(other).is_empty()
    }

    /// Names of the fields that tell the two files apart
    pub fn differences(&self, other: &FileFingerprint) -> Vec<&'static str> {
        let mut diff = Vec::new();
        if !same_name(&self.name, &other.name) {
            diff.push("name");
        }
        if let (Some(a), Some(b)) = (&self.size, &other.size) {
            if !same_size(a, b) {
                diff.push("size");
            }
        }
        if let (Some(a), Some(b)) = (self.duration, other.duration) {
            if (a - b).abs() > DURATION_TOLERANCE_SECS {
                diff.push("duration");
            }
        }
        diff
    }
}

fn same_name(a: &str, b: &str) -> bool {
    if a == HIDDEN_FILENAME || b == HIDDEN_FILENAME {
        return true;
    }
    a.to_lowercase() == b.to_lowercase() || privacy_hash(a) == b || a == privacy_hash(b)
}

fn same_size(a: &FileSize, b: &FileSize) -> bool {
    match (a, b) {
        (FileSize::Bytes(x), FileSize::Bytes(y)) => x == y,
        (FileSize::Bytes(x), FileSize::Redacted(h)) | (FileSize::Redacted(h), FileSize::Bytes(x)) => {
            privacy_hash(&x.to_string()) == *h
        }
        (FileSize::Redacted(x), FileSize::Redacted(y)) => x == y,
    }
}

/// A position observation tied to the moment it was true
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackFact {
    /// Seconds
    pub position: f64,
    pub paused: bool,
    pub speed: f64,
    pub observed_at: Instant,
}

impl PlaybackFact {
    pub fn new(position: f64, paused: bool, observed_at: Instant) -> Self {
        Self {
            position,
            paused,
            speed: 1.0,
            observed_at,
        }
    }

    /// Position extrapolated to `now`; paused facts do not move
    pub fn projected(&self, now: Instant) -> f64 {
        if self.paused {
            return self.position;
        }
        let elapsed = now.saturating_duration_since(self.observed_at).as_secs_f64();
        self.position + elapsed * self.speed
    }
}

/// One entry of the room roster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub username: String,
    pub room: String,
    pub file: Option<FileFingerprint>,
    pub is_ready: Option<bool>,
    pub controller: bool,
}

impl Member {
    pub fn new(username: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            room: room.into(),
            file: None,
            is_ready: None,
            controller: false,
        }
    }
}
