//! Synchronization Engine
//!
//! Compares the local player's position with the room's authoritative one
//! and decides which corrective commands to issue. The engine itself does no
//! I/O: [`SyncEngine::evaluate`] turns a snapshot into a list of
//! [`SyncAction`]s and the caller executes them against the player.
//!
//! Decision order for one pass:
//! 1. pause/play mismatch wins and suppresses everything else
//! 2. a file mismatch suppresses position corrections
//! 3. a seek grace window suppresses position corrections
//! 4. large drift seeks, moderate drift slows down, small drift restores speed

use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::session::FileFingerprint;

/// Thresholds the engine works with, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    /// Local this far behind (or more) triggers a seek
    pub rewind: f64,
    /// Local this far ahead (or more) triggers a seek
    pub fastforward: f64,
    /// Drift beyond this engages slowdown
    pub slowdown: f64,
    /// Drift below this ends slowdown; must be smaller than `slowdown`
    pub slowdown_reset: f64,
    /// Playback speed while slowed, in (0, 1)
    pub slowdown_rate: f64,
}

impl From<&SyncConfig> for SyncThresholds {
    fn from(config: &SyncConfig) -> Self {
        Self {
            rewind: config.seek_threshold_rewind,
            fastforward: config.seek_threshold_fastforward,
            slowdown: config.slowdown_threshold,
            slowdown_reset: config.slowdown_reset_threshold,
            slowdown_rate: config.slowdown_rate,
        }
    }
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// What the local player is doing right now
#[derive(Debug, Clone, PartialEq)]
pub struct LocalView {
    pub position: f64,
    pub paused: bool,
    pub file: Option<FileFingerprint>,
}

/// The authoritative playback, already projected to "now"
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteView {
    pub position: f64,
    pub paused: bool,
    /// File of whoever set the state; `None` when unknown or set by us
    pub file: Option<FileFingerprint>,
    pub set_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncInput {
    pub local: Option<LocalView>,
    pub remote: Option<RemoteView>,
}

/// A command the engine wants executed
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    SetPaused(bool),
    Seek(f64),
    SetSpeed(f64),
    /// Raised once per distinct pair of files
    FileMismatch {
        local: String,
        remote: String,
        set_by: Option<String>,
        differences: Vec<&'static str>,
    },
}

/// Drift controller with slowdown hysteresis and a post-seek grace window
#[derive(Debug)]
pub struct SyncEngine {
    thresholds: SyncThresholds,
    /// Whether we last set the player to `slowdown_rate`
    slowdown_active: bool,
    /// Cycles to skip position checks after a seek
    grace_cycles: u32,
    grace_remaining: u32,
    /// (local name, remote name) of the mismatch already reported
    reported_mismatch: Option<(String, String)>,
}

impl SyncEngine {
    pub fn new(thresholds: SyncThresholds, grace_cycles: u32) -> Self {
        Self {
            thresholds,
            slowdown_active: false,
            grace_cycles,
            grace_remaining: 0,
            reported_mismatch: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(SyncThresholds::from(config), config.seek_grace_cycles)
    }

    pub fn thresholds(&self) -> &SyncThresholds {
        &self.thresholds
    }

    pub fn is_slowdown_active(&self) -> bool {
        self.slowdown_active
    }

    pub fn grace_remaining(&self) -> u32 {
        self.grace_remaining
    }

    /// The user (or we) just moved the playhead; leave it alone for a while
    pub fn note_local_seek(&mut self) {
        self.grace_remaining = self.grace_cycles;
        debug!("Sync: local seek, grace for {} cycle(s)", self.grace_cycles);
    }

    /// Forget everything, e.g. after a reconnect or a new file
    pub fn reset(&mut self) {
        self.slowdown_active = false;
        self.grace_remaining = 0;
        self.reported_mismatch = None;
    }

    /// Run one pass and return the commands to execute, in order
    pub fn evaluate(&mut self, input: &SyncInput) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        let (Some(local), Some(remote)) = (&input.local, &input.remote) else {
            return actions;
        };

        // Pause state is independent of which file is loaded
        if local.paused != remote.paused {
            debug!(
                "Sync: pause mismatch (local paused={}, room paused={})",
                local.paused, remote.paused
            );
            actions.push(SyncAction::SetPaused(remote.paused));
            return actions;
        }

        if let Some(mismatch) = self.check_file(local, remote) {
            if let Some(action) = mismatch {
                actions.push(action);
            }
            if self.slowdown_active {
                self.slowdown_active = false;
                actions.push(SyncAction::SetSpeed(1.0));
            }
            return actions;
        }

        if self.grace_remaining > 0 {
            self.grace_remaining -= 1;
            debug!("Sync: in seek grace window ({} left)", self.grace_remaining);
            return actions;
        }

        let t = self.thresholds;
        let diff = local.position - remote.position;

        if diff <= -t.rewind || diff >= t.fastforward {
            info!(
                "Sync: drift {:+.2}s, seeking to {:.2}s (set by {:?})",
                diff, remote.position, remote.set_by
            );
            actions.push(SyncAction::Seek(remote.position));
            if self.slowdown_active {
                self.slowdown_active = false;
                actions.push(SyncAction::SetSpeed(1.0));
            }
            self.grace_remaining = self.grace_cycles;
            return actions;
        }

        if diff.abs() > t.slowdown {
            if !self.slowdown_active && !local.paused {
                info!("Sync: drift {:+.2}s, slowing down to {}", diff, t.slowdown_rate);
                self.slowdown_active = true;
                actions.push(SyncAction::SetSpeed(t.slowdown_rate));
            }
        } else if diff.abs() < t.slowdown_reset && self.slowdown_active {
            info!("Sync: drift {:+.2}s, restoring normal speed", diff);
            self.slowdown_active = false;
            actions.push(SyncAction::SetSpeed(1.0));
        }

        actions
    }

    /// `None` when the files agree (or either is unknown). `Some(action)`
    /// when they differ; the action is present only the first time a given
    /// pair is seen.
    fn check_file(&mut self, local: &LocalView, remote: &RemoteView) -> Option<Option<SyncAction>> {
        let (Some(ours), Some(theirs)) = (&local.file, &remote.file) else {
            self.reported_mismatch = None;
            return None;
        };
        let differences = ours.differences(theirs);
        if differences.is_empty() {
            self.reported_mismatch = None;
            return None;
        }

        let pair = (ours.name.clone(), theirs.name.clone());
        if self.reported_mismatch.as_ref() == Some(&pair) {
            return Some(None);
        }
        info!("Sync: file mismatch with {:?}: {:?}", remote.set_by, differences);
        self.reported_mismatch = Some(pair);
        Some(Some(SyncAction::FileMismatch {
            local: ours.name.clone(),
            remote: theirs.name.clone(),
            set_by: remote.set_by.clone(),
            differences,
        }))
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
