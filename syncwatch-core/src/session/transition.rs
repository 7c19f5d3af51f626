//! Transitions applied to the session aggregate and the resulting change sets

use std::time::Instant;

use super::model::{FileFingerprint, Member, PlaybackFact};
use crate::playlist::PlaylistOp;

/// Incremental roster update for one user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberUpdate {
    pub room: Option<String>,
    /// `Some(None)` means the user unloaded their file
    pub file: Option<Option<FileFingerprint>>,
    pub is_ready: Option<bool>,
    pub controller: Option<bool>,
    pub joined: bool,
    pub left: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A (re)authenticated session starts; server-derived state is reset
    ConnectionReady,
    ConnectionLost,
    RosterReplaced(Vec<Member>),
    MemberUpdated {
        username: String,
        update: MemberUpdate,
    },
    ReadinessChanged {
        username: String,
        is_ready: Option<bool>,
    },
    PlaylistReplaced(Vec<String>),
    PlaylistIndexSelected(Option<usize>),
    PlaylistEdited(PlaylistOp),
    GlobalPlaybackObserved {
        position: f64,
        paused: bool,
        set_by: Option<String>,
        observed_at: Instant,
    },
    LocalPlaybackObserved(PlaybackFact),
    LocalFileLoaded(Option<FileFingerprint>),
    RoomChanged(String),
    /// `ignoringOnTheFly` from an inbound `State`
    IgnoringReceived {
        server: Option<u32>,
        client: Option<u32>,
    },
    /// A local pause/seek is about to be sent
    LocalChangeAnnounced,
    /// The server counter went out on an outbound `State`
    ServerIgnoreEchoed,
}

impl Transition {
    /// Server-derived or broadcast state may only change while connected
    pub fn requires_online(&self) -> bool {
        !matches!(
            self,
            Transition::ConnectionReady
                | Transition::ConnectionLost
                | Transition::LocalPlaybackObserved(_)
                | Transition::LocalFileLoaded(_)
        )
    }
}

/// What a transition touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub roster: bool,
    pub readiness: bool,
    pub playlist: bool,
    pub playlist_index: bool,
    pub global_playback: bool,
    pub local_playback: bool,
    pub local_file: bool,
    pub room: bool,
    pub ignoring: bool,
    /// Other members in our room before and after
    pub others_before: usize,
    pub others_after: usize,
}

impl ChangeSet {
    /// The sync engine should run now rather than on its next tick
    pub fn needs_sync(&self) -> bool {
        self.global_playback || self.local_file || self.roster || self.room
    }

    /// The room just went from having other viewers to having none
    pub fn last_peer_left(&self) -> bool {
        self.others_before > 0 && self.others_after == 0
    }
}
