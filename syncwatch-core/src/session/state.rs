//! Session State aggregate
//!
//! One value holds everything the client believes about the session. It is
//! never edited in place: [`SessionState::apply`] builds the next state from
//! a transition and only hands it back when every invariant still holds.

use std::collections::BTreeMap;

use thiserror::Error;

use super::model::{FileFingerprint, Member, PlaybackFact, SessionIdentity};
use super::transition::{ChangeSet, MemberUpdate, Transition};
use crate::playlist::{PlaylistError, PlaylistState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateInvariantViolation {
    #[error("session is not connected")]
    NotOnline,

    #[error("duplicate roster entry for {0}")]
    DuplicateMember(String),

    #[error("room {room} would have {count} controllers (max {max})")]
    ControllerLimit {
        room: String,
        count: usize,
        max: usize,
    },

    #[error("room name is empty")]
    EmptyRoomName,

    #[error(transparent)]
    Playlist(#[from] PlaylistError),
}

/// Policy knobs the aggregate enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub max_controllers_per_room: Option<usize>,
    pub playlist_loop: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_controllers_per_room: Some(1),
            playlist_loop: false,
        }
    }
}

/// Authoritative playback as last reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalPlayback {
    pub fact: PlaybackFact,
    pub set_by: Option<String>,
}

/// On-the-fly ignore counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreCounters {
    /// To echo back once on the next outbound `State`
    pub server: u32,
    /// Our own pending change; inbound playstates are ignored while non-zero
    pub client: u32,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    identity: SessionIdentity,
    room: String,
    online: bool,
    members: BTreeMap<String, Member>,
    playlist: PlaylistState,
    global: Option<GlobalPlayback>,
    local: Option<PlaybackFact>,
    local_file: Option<FileFingerprint>,
    ignoring: IgnoreCounters,
    policy: SessionPolicy,
    version: u64,
}

impl SessionState {
    pub fn new(identity: SessionIdentity, policy: SessionPolicy) -> Self {
        Self {
            room: identity.room.clone(),
            identity,
            online: false,
            members: BTreeMap::new(),
            playlist: PlaylistState::new(policy.playlist_loop),
            global: None,
            local: None,
            local_file: None,
            ignoring: IgnoreCounters::default(),
            policy,
            version: 0,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    /// Room we are currently in
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn member(&self, username: &str) -> Option<&Member> {
        self.members.get(username)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Members of `room`, controllers first, then by name
    pub fn room_members(&self, room: &str) -> Vec<Member> {
        let mut list: Vec<Member> = self
            .members
            .values()
            .filter(|m| m.room == room)
            .cloned()
            .collect();
        list.sort_by(|a, b| match (a.controller, b.controller) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.username.to_lowercase().cmp(&b.username.to_lowercase()),
        });
        list
    }

    /// Other members sharing our room
    pub fn others_in_room(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.room == self.room && m.username != self.identity.username)
            .count()
    }

    pub fn playlist(&self) -> &PlaylistState {
        &self.playlist
    }

    pub fn global(&self) -> Option<&GlobalPlayback> {
        self.global.as_ref()
    }

    pub fn local(&self) -> Option<&PlaybackFact> {
        self.local.as_ref()
    }

    pub fn local_file(&self) -> Option<&FileFingerprint> {
        self.local_file.as_ref()
    }

    pub fn ignoring(&self) -> IgnoreCounters {
        self.ignoring
    }

    /// Incoming playstates are dropped until our last change is echoed
    pub fn is_ignoring_playstates(&self) -> bool {
        self.ignoring.client > 0
    }

    pub fn local_ready(&self) -> bool {
        self.members
            .get(&self.identity.username)
            .and_then(|m| m.is_ready)
            .unwrap_or(false)
    }

    /// Explicit controller, or nobody in the room controls it
    pub fn can_control(&self) -> bool {
        let me = &self.identity.username;
        if self.identity.controller || self.members.get(me).is_some_and(|m| m.controller) {
            return true;
        }
        !self
            .members
            .values()
            .any(|m| m.room == self.room && m.controller)
    }

    /// File of whoever last set the authoritative state, if that is someone else
    pub fn authoritative_file(&self) -> Option<&FileFingerprint> {
        let setter = self.global.as_ref()?.set_by.as_deref()?;
        if setter == self.identity.username {
            return None;
        }
        self.members.get(setter)?.file.as_ref()
    }

    /// Bumped on every applied transition
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Produce the successor state. `self` is never modified; on error the
    /// caller keeps the state it had.
    pub fn apply(
        &self,
        transition: &Transition,
    ) -> Result<(SessionState, ChangeSet), StateInvariantViolation> {
        if transition.requires_online() && !self.online {
            return Err(StateInvariantViolation::NotOnline);
        }

        let mut next = self.clone();
        let mut changes = ChangeSet {
            others_before: self.others_in_room(),
            ..ChangeSet::default()
        };

        match transition {
            // Repeated while online it changes nothing
            Transition::ConnectionReady if self.online => {}
            Transition::ConnectionReady => {
                next.online = true;
                next.members.clear();
                next.global = None;
                next.ignoring = IgnoreCounters::default();
                changes.roster = true;
                changes.global_playback = true;
            }
            Transition::ConnectionLost => {
                next.online = false;
            }
            Transition::RosterReplaced(list) => {
                let mut members = BTreeMap::new();
                for member in list {
                    if members
                        .insert(member.username.clone(), member.clone())
                        .is_some()
                    {
                        return Err(StateInvariantViolation::DuplicateMember(
                            member.username.clone(),
                        ));
                    }
                }
                next.members = members;
                changes.roster = true;
            }
            Transition::MemberUpdated { username, update } => {
                next.update_member(username, update, &mut changes);
            }
            Transition::ReadinessChanged { username, is_ready } => {
                let room = next.room.clone();
                let member = next
                    .members
                    .entry(username.clone())
                    .or_insert_with(|| Member::new(username.clone(), room));
                member.is_ready = *is_ready;
                changes.readiness = true;
                changes.roster = true;
            }
            Transition::PlaylistReplaced(files) => {
                let before = next.playlist.current_index();
                next.playlist.replace(files.clone());
                changes.playlist = true;
                changes.playlist_index = before != next.playlist.current_index();
            }
            Transition::PlaylistIndexSelected(index) => {
                let before = next.playlist.current_index();
                next.playlist.select(*index)?;
                changes.playlist_index = before != next.playlist.current_index();
            }
            Transition::PlaylistEdited(op) => {
                let before = next.playlist.clone();
                next.playlist.apply(op)?;
                changes.playlist = before.items() != next.playlist.items()
                    || before.is_looping() != next.playlist.is_looping();
                changes.playlist_index = before.current_index() != next.playlist.current_index();
            }
            Transition::GlobalPlaybackObserved {
                position,
                paused,
                set_by,
                observed_at,
            } => {
                next.global = Some(GlobalPlayback {
                    fact: PlaybackFact::new(*position, *paused, *observed_at),
                    set_by: set_by.clone(),
                });
                changes.global_playback = true;
            }
            Transition::LocalPlaybackObserved(fact) => {
                next.local = Some(*fact);
                changes.local_playback = true;
            }
            Transition::LocalFileLoaded(file) => {
                next.local_file = file.clone();
                if let Some(me) = next.members.get_mut(&next.identity.username) {
                    me.file = file.clone();
                }
                changes.local_file = true;
            }
            Transition::RoomChanged(room) => {
                if room.trim().is_empty() {
                    return Err(StateInvariantViolation::EmptyRoomName);
                }
                next.room = room.clone();
                let username = next.identity.username.clone();
                next.members
                    .entry(username.clone())
                    .or_insert_with(|| Member::new(username, room.clone()))
                    .room = room.clone();
                changes.room = true;
                changes.roster = true;
            }
            Transition::IgnoringReceived { server, client } => {
                if let Some(server) = server {
                    next.ignoring.server = *server;
                    next.ignoring.client = 0;
                } else if let Some(client) = client {
                    if *client == next.ignoring.client {
                        next.ignoring.client = 0;
                    }
                }
                changes.ignoring = next.ignoring != self.ignoring;
            }
            Transition::LocalChangeAnnounced => {
                next.ignoring.client += 1;
                changes.ignoring = true;
            }
            Transition::ServerIgnoreEchoed => {
                next.ignoring.server = 0;
                changes.ignoring = self.ignoring.server != 0;
            }
        }

        next.check_invariants()?;
        changes.others_after = next.others_in_room();
        next.version += 1;
        Ok((next, changes))
    }

    fn update_member(&mut self, username: &str, update: &MemberUpdate, changes: &mut ChangeSet) {
        let is_me = username == self.identity.username;
        if update.left {
            changes.roster = self.members.remove(username).is_some();
            return;
        }

        let fallback_room = self.room.clone();
        let member = self
            .members
            .entry(username.to_string())
            .or_insert_with(|| Member::new(username, fallback_room));
        if let Some(room) = &update.room {
            member.room = room.clone();
        }
        if let Some(file) = &update.file {
            member.file = file.clone();
        }
        if let Some(ready) = update.is_ready {
            member.is_ready = Some(ready);
            changes.readiness = true;
        }
        if let Some(controller) = update.controller {
            member.controller = controller;
        }
        changes.roster = true;

        if is_me {
            if let Some(room) = &update.room {
                if *room != self.room {
                    self.room = room.clone();
                    changes.room = true;
                }
            }
        }
    }

    fn check_invariants(&self) -> Result<(), StateInvariantViolation> {
        if !self.playlist.is_consistent() {
            return Err(PlaylistError::IndexOutOfRange {
                index: self.playlist.current_index().unwrap_or_default(),
                len: self.playlist.len(),
            }
            .into());
        }
        if self.room.trim().is_empty() {
            return Err(StateInvariantViolation::EmptyRoomName);
        }
        if let Some(max) = self.policy.max_controllers_per_room {
            let mut per_room: BTreeMap<&str, usize> = BTreeMap::new();
            for member in self.members.values().filter(|m| m.controller) {
                *per_room.entry(member.room.as_str()).or_default() += 1;
            }
            if let Some((room, count)) = per_room.into_iter().find(|(_, count)| *count > max) {
                return Err(StateInvariantViolation::ControllerLimit {
                    room: room.to_string(),
                    count,
                    max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::PlaylistOp;
    use std::time::Instant;

    fn online() -> SessionState {
        let state = SessionState::new(SessionIdentity::new("alice", "lobby"), SessionPolicy::default());
        state.apply(&Transition::ConnectionReady).unwrap().0
    }

    fn member(name: &str, room: &str) -> Member {
        Member::new(name, room)
    }

    fn apply(state: &SessionState, t: Transition) -> (SessionState, ChangeSet) {
        state.apply(&t).unwrap()
    }

    #[test]
    fn test_offline_rejects_server_transitions() {
        let state = SessionState::new(SessionIdentity::new("alice", "lobby"), SessionPolicy::default());
        assert_eq!(
            state.apply(&Transition::RoomChanged("x".into())).unwrap_err(),
            StateInvariantViolation::NotOnline
        );
        // Local observations are always accepted
        let fact = PlaybackFact::new(1.0, true, Instant::now());
        assert!(state.apply(&Transition::LocalPlaybackObserved(fact)).is_ok());
    }

    #[test]
    fn test_failed_transition_leaves_state_untouched() {
        let state = online();
        let version = state.version();
        let err = state
            .apply(&Transition::PlaylistEdited(PlaylistOp::Remove(4)))
            .unwrap_err();
        assert!(matches!(err, StateInvariantViolation::Playlist(_)));
        assert_eq!(state.version(), version);
        assert!(state.playlist().is_empty());
    }

    #[test]
    fn test_roster_duplicates_rejected() {
        let state = online();
        let err = state
            .apply(&Transition::RosterReplaced(vec![
                member("bob", "lobby"),
                member("bob", "other"),
            ]))
            .unwrap_err();
        assert_eq!(err, StateInvariantViolation::DuplicateMember("bob".into()));
    }

    #[test]
    fn test_controller_limit() {
        let state = online();
        let mut a = member("bob", "lobby");
        a.controller = true;
        let mut b = member("carol", "lobby");
        b.controller = true;
        let err = state.apply(&Transition::RosterReplaced(vec![a.clone(), b])).unwrap_err();
        assert!(matches!(err, StateInvariantViolation::ControllerLimit { count: 2, max: 1, .. }));

        let (state, _) = apply(&state, Transition::RosterReplaced(vec![a, member("alice", "lobby")]));
        assert!(!state.can_control());
    }

    #[test]
    fn test_last_peer_leaving_is_flagged_once() {
        let state = online();
        let (state, _) = apply(
            &state,
            Transition::RosterReplaced(vec![member("alice", "lobby"), member("bob", "lobby")]),
        );
        let leave = MemberUpdate {
            left: true,
            ..Default::default()
        };
        let (state, changes) = apply(
            &state,
            Transition::MemberUpdated {
                username: "bob".into(),
                update: leave.clone(),
            },
        );
        assert!(changes.last_peer_left());

        let (_, again) = apply(
            &state,
            Transition::MemberUpdated {
                username: "bob".into(),
                update: leave,
            },
        );
        assert!(!again.last_peer_left());
        assert!(!again.roster);
    }

    #[test]
    fn test_member_update_moves_rooms() {
        let state = online();
        let update = MemberUpdate {
            room: Some("cinema".into()),
            joined: true,
            ..Default::default()
        };
        let (state, _) = apply(
            &state,
            Transition::MemberUpdated {
                username: "bob".into(),
                update,
            },
        );
        assert_eq!(state.member("bob").unwrap().room, "cinema");
        assert_eq!(state.others_in_room(), 0);

        let me = MemberUpdate {
            room: Some("cinema".into()),
            ..Default::default()
        };
        let (state, changes) = apply(
            &state,
            Transition::MemberUpdated {
                username: "alice".into(),
                update: me,
            },
        );
        assert!(changes.room);
        assert_eq!(state.room(), "cinema");
        assert_eq!(state.others_in_room(), 1);
    }

    #[test]
    fn test_readiness_and_local_file() {
        let state = online();
        let (state, changes) = apply(
            &state,
            Transition::ReadinessChanged {
                username: "alice".into(),
                is_ready: Some(true),
            },
        );
        assert!(changes.readiness);
        assert!(state.local_ready());

        let file = FileFingerprint::new("movie.mkv", Some(100.0), None);
        let (state, changes) = apply(&state, Transition::LocalFileLoaded(Some(file.clone())));
        assert!(changes.needs_sync());
        assert_eq!(state.local_file(), Some(&file));
        assert_eq!(state.member("alice").unwrap().file.as_ref(), Some(&file));
    }

    #[test]
    fn test_authoritative_file_follows_setter() {
        let state = online();
        let mut bob = member("bob", "lobby");
        bob.file = Some(FileFingerprint::new("other.mkv", None, None));
        let (state, _) = apply(&state, Transition::RosterReplaced(vec![bob]));
        let (state, _) = apply(
            &state,
            Transition::GlobalPlaybackObserved {
                position: 5.0,
                paused: false,
                set_by: Some("bob".into()),
                observed_at: Instant::now(),
            },
        );
        assert_eq!(state.authoritative_file().unwrap().name, "other.mkv");
    }

    #[test]
    fn test_ignoring_counters() {
        let state = online();
        let (state, _) = apply(&state, Transition::LocalChangeAnnounced);
        assert!(state.is_ignoring_playstates());
        assert_eq!(state.ignoring().client, 1);

        // A stale echo does not clear the counter
        let (state, _) = apply(&state, Transition::IgnoringReceived { server: None, client: Some(0) });
        assert!(state.is_ignoring_playstates());

        let (state, _) = apply(&state, Transition::IgnoringReceived { server: None, client: Some(1) });
        assert!(!state.is_ignoring_playstates());

        let (state, _) = apply(&state, Transition::IgnoringReceived { server: Some(3), client: None });
        assert_eq!(state.ignoring().server, 3);
        let (state, changes) = apply(&state, Transition::ServerIgnoreEchoed);
        assert!(changes.ignoring);
        assert_eq!(state.ignoring().server, 0);
    }

    #[test]
    fn test_reconnect_resets_server_state() {
        let state = online();
        let (state, _) = apply(&state, Transition::RosterReplaced(vec![member("bob", "lobby")]));
        let (state, _) = apply(&state, Transition::ConnectionLost);
        assert!(!state.is_online());
        let (state, changes) = apply(&state, Transition::ConnectionReady);
        assert!(changes.roster);
        assert_eq!(state.members().count(), 0);
        assert!(state.global().is_none());
    }

    #[test]
    fn test_ready_while_online_keeps_roster() {
        let state = online();
        let (state, _) = apply(&state, Transition::RosterReplaced(vec![member("bob", "lobby")]));
        let (state, changes) = apply(&state, Transition::ConnectionReady);
        assert!(!changes.roster);
        assert_eq!(state.members().count(), 1);
    }
}
