//! Event handlers driving the session from server frames, connection
//! lifecycle changes, and player reports, plus the periodic sync pass.
//!
//! Frame handling never waits on the player: commands it needs are queued
//! as [`PlayerAction`]s and performed by the player loop.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::session::Shared;
use super::types::{Advisory, LocalActivity, PlayerAction};
use crate::chat::ChatRecord;
use crate::latency::wall_clock_secs;
use crate::network::{ConnectionEvent, ConnectionState};
use crate::player::{EndFileReason, ObservedProperty, PlayerCommand, PlayerError, PlayerEvent, PlayerStatus};
use crate::playlist::{resolve_media, PlaylistState};
use crate::protocol::{
    ChatMessage, ControllerAuth, Envelope, HelloMessage, IgnoringOnTheFly, PingInfo, PlayState,
    PlaylistChange, PlaylistIndexUpdate, RoomInfo, RosterListing, SetMessage, StateMessage,
    UserUpdate,
};
use crate::session::{ChangeSet, FileFingerprint, Member, MemberUpdate, PlaybackFact, SessionState, Transition};
use crate::sync::{LocalView, RemoteView, SyncAction, SyncInput};

/// Minimum spacing of position-only status callbacks
const STATUS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Connection
// ============================================================================

pub(crate) fn handle_connection_event(shared: &Shared, event: ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged(state) => {
            debug!("Connection state: {:?}", state);
            if state == ConnectionState::Ready {
                shared.engine.lock().reset();
                shared.latency.write().clear();
                if shared.apply(Transition::ConnectionReady).is_some_and(|c| c.roster) {
                    shared.emit_roster();
                }
            } else if matches!(
                state,
                ConnectionState::Reconnecting | ConnectionState::Disconnected | ConnectionState::Failed
            ) && shared.session.read(|s| s.is_online())
            {
                shared.apply(Transition::ConnectionLost);
            }
            shared.callback.emit(|cb| cb.on_connection_state_changed(state));
        }
        ConnectionEvent::Frame(envelope) => handle_server_message(shared, envelope),
        ConnectionEvent::ProtocolError(reason) => {
            debug!("Skipped undecodable frame: {}", reason);
        }
        ConnectionEvent::TransportLost(reason) => {
            shared.advise(Advisory::TransportError { reason });
        }
        ConnectionEvent::HandshakeRejected(message) => {
            let kind = crate::protocol::ErrorMessage {
                message: message.clone(),
            }
            .kind();
            shared.advise(Advisory::SessionError {
                message,
                kind,
                fatal: true,
            });
        }
        ConnectionEvent::Reconnected { attempts } => {
            shared.narrate(ChatRecord::system(format!(
                "Reconnected after {} attempt{}",
                attempts,
                if attempts == 1 { "" } else { "s" }
            )));
            // The handshake re-announces the room we started in
            let room = shared.session.read(|s| s.room().to_string());
            if room != shared.identity.room {
                info!("Returning to room {}", room);
                shared.send(Envelope::set(SetMessage {
                    room: Some(RoomInfo::named(room)),
                    ..Default::default()
                }));
                shared.send(Envelope::list_request());
            }
            send_local_file(shared);
        }
    }
}

// ============================================================================
// Server frames
// ============================================================================

pub(crate) fn handle_server_message(shared: &Shared, envelope: Envelope) {
    match envelope {
        Envelope::Hello(hello) => handle_hello(shared, hello),
        Envelope::List(Some(listing)) => handle_list(shared, listing),
        Envelope::List(None) => debug!("Empty roster listing"),
        Envelope::Set(set) => handle_set(shared, set),
        Envelope::State(state) => handle_state(shared, state),
        Envelope::Chat(ChatMessage::Entry { username, message }) => {
            shared.narrate(ChatRecord::user(username, message));
        }
        Envelope::Chat(ChatMessage::Text(text)) => shared.narrate(ChatRecord::system(text)),
        Envelope::Error(error) => {
            let kind = error.kind();
            shared.advise(Advisory::SessionError {
                message: error.message,
                kind,
                fatal: true,
            });
        }
        Envelope::Tls(_) => debug!("Ignoring TLS message outside the handshake"),
    }
}

fn handle_hello(shared: &Shared, hello: HelloMessage) {
    info!(
        "Joined as {} (server {})",
        hello.username,
        hello.realversion.as_deref().unwrap_or(&hello.version)
    );
    if let Some(motd) = hello.motd.filter(|m| !m.trim().is_empty()) {
        shared.narrate(ChatRecord::system(motd));
    }
    send_local_file(shared);
}

fn handle_list(shared: &Shared, listing: RosterListing) {
    let mut members = Vec::new();
    for (room, users) in listing {
        for (username, entry) in users {
            let mut member = Member::new(username, room.clone());
            member.file = entry.file.as_ref().and_then(FileFingerprint::from_wire);
            member.is_ready = entry.is_ready;
            member.controller = entry.controller.unwrap_or(false);
            members.push(member);
        }
    }

    // Our own file is known locally and may not have reached the server yet
    let local_file = shared.session.read(|s| s.local_file().cloned());
    if let Some(me) = members.iter_mut().find(|m| m.username == shared.identity.username) {
        if me.file.is_none() {
            me.file = local_file;
        }
    }

    if let Some(changes) = shared.apply(Transition::RosterReplaced(members)) {
        shared.emit_roster();
        pause_on_leave(shared, &changes);
    }
}

fn handle_set(shared: &Shared, set: SetMessage) {
    let me = shared.identity.username.clone();

    if let Some(room) = set.room {
        if let Some(changes) = shared.apply(Transition::RoomChanged(room.name.clone())) {
            if changes.room {
                shared.narrate(ChatRecord::system(format!("You are now in room '{}'", room.name)));
                shared.emit_roster();
            }
        }
    }

    if let Some(users) = set.user {
        for (username, update) in users {
            handle_user_update(shared, &me, username, update);
        }
    }

    if let Some(ready) = set.ready {
        let username = ready.username.unwrap_or_else(|| me.clone());
        let transition = Transition::ReadinessChanged {
            username: username.clone(),
            is_ready: ready.is_ready,
        };
        if shared.apply(transition).is_some() {
            shared.emit_roster();
            if username != me && ready.manually_initiated == Some(true) {
                let what = if ready.is_ready == Some(true) { "ready" } else { "not ready" };
                shared.narrate(ChatRecord::system(format!("{} is {}", username, what)));
            }
        }
    }

    if let Some(change) = set.playlist_change {
        handle_playlist_change(shared, &me, change);
    }

    if let Some(index) = set.playlist_index {
        handle_playlist_index(shared, &me, index);
    }

    if let Some(auth) = set.controller_auth {
        handle_controller_auth(shared, &me, auth);
    }

    if let Some(playstate) = set.state {
        apply_remote_playstate(shared, playstate);
    }
}

fn handle_user_update(shared: &Shared, me: &str, username: String, update: UserUpdate) {
    let event = update.event.unwrap_or_default();
    let member_update = MemberUpdate {
        room: update.room.map(|r| r.name),
        file: update.file.as_ref().map(FileFingerprint::from_wire),
        is_ready: update.is_ready,
        controller: update.controller,
        joined: event.joined == Some(true),
        left: event.left == Some(true),
    };

    let before = shared.session.read(|s| s.member(&username).cloned());
    let transition = Transition::MemberUpdated {
        username: username.clone(),
        update: member_update.clone(),
    };
    let Some(changes) = shared.apply(transition) else {
        return;
    };

    if username != me {
        narrate_member(shared, &username, &member_update, before.as_ref());
    } else if changes.room {
        let room = shared.session.read(|s| s.room().to_string());
        shared.narrate(ChatRecord::system(format!("You are now in room '{}'", room)));
    }
    if changes.roster {
        shared.emit_roster();
    }
    pause_on_leave(shared, &changes);
}

fn narrate_member(shared: &Shared, username: &str, update: &MemberUpdate, before: Option<&Member>) {
    if update.left {
        shared.narrate(ChatRecord::system(format!("{} has left", username)));
        return;
    }
    if update.joined {
        let room = update.room.as_deref().unwrap_or("the room");
        shared.narrate(ChatRecord::system(format!("{} has joined {}", username, room)));
    } else if let Some(room) = &update.room {
        if before.map(|m| &m.room) != Some(room) {
            shared.narrate(ChatRecord::system(format!("{} moved to room '{}'", username, room)));
        }
    }

    let Some(Some(file)) = &update.file else {
        return;
    };
    if before.and_then(|m| m.file.as_ref()) == Some(file) {
        return;
    }
    let mut text = format!("{} is playing '{}'", username, file.name);
    if let Some(duration) = file.duration {
        text.push_str(&format!(" ({})", format_time(duration)));
    }
    if let Some(local) = shared.session.read(|s| s.local_file().cloned()) {
        let differences = local.differences(file);
        if !differences.is_empty() {
            text.push_str(&format!(", differs in {}", differences.join(", ")));
        }
    }
    shared.narrate(ChatRecord::system(text));
}

fn handle_playlist_change(shared: &Shared, me: &str, change: PlaylistChange) {
    let Some((changes, playlist)) =
        shared.apply_and_read(Transition::PlaylistReplaced(change.files), |s| s.playlist().clone())
    else {
        return;
    };
    shared.emit_playlist(playlist);
    if let Some(user) = change.user.filter(|u| u != me) {
        shared.narrate(ChatRecord::system(format!("{} updated the playlist", user)));
    }
    if changes.playlist_index {
        load_current_item(shared);
    }
}

fn handle_playlist_index(shared: &Shared, me: &str, update: PlaylistIndexUpdate) {
    let Some((changes, playlist)) = shared.apply_and_read(
        Transition::PlaylistIndexSelected(update.index),
        |s| s.playlist().clone(),
    ) else {
        return;
    };
    if !changes.playlist_index {
        return;
    }
    shared.emit_playlist(playlist.clone());
    if let (Some(user), Some(item)) = (update.user.filter(|u| u != me), playlist.current_item()) {
        shared.narrate(ChatRecord::system(format!("{} selected '{}'", user, item)));
    }
    load_current_item(shared);
}

fn handle_controller_auth(shared: &Shared, me: &str, auth: ControllerAuth) {
    let room = auth
        .room
        .clone()
        .unwrap_or_else(|| shared.session.read(|s| s.room().to_string()));
    match (auth.user, auth.success) {
        (Some(user), Some(true)) => {
            let transition = Transition::MemberUpdated {
                username: user.clone(),
                update: MemberUpdate {
                    controller: Some(true),
                    ..Default::default()
                },
            };
            if shared.apply(transition).is_some() {
                shared.emit_roster();
                shared.narrate(ChatRecord::system(format!(
                    "{} is now controlling room '{}'",
                    user, room
                )));
            }
        }
        (user, Some(false)) if user.as_deref().map_or(true, |u| u == me) => {
            shared.narrate(ChatRecord::error(format!(
                "Could not become controller of room '{}'",
                room
            )));
        }
        _ => {}
    }
}

fn handle_state(shared: &Shared, state: StateMessage) {
    let latency_calculation = state.ping.as_ref().and_then(|p| p.latency_calculation);
    if let Some(PingInfo {
        client_latency_calculation: Some(sent_at),
        server_rtt: Some(server_rtt),
        ..
    }) = state.ping
    {
        if let Some(rtt) = shared.latency.write().record(sent_at, server_rtt, wall_clock_secs()) {
            debug!("RTT sample {:.3}s", rtt);
        }
    }

    if let Some(ignoring) = state.ignoring_on_the_fly {
        shared.apply(Transition::IgnoringReceived {
            server: ignoring.server,
            client: ignoring.client,
        });
    }

    if let Some(playstate) = state.playstate {
        if shared.session.read(|s| s.is_ignoring_playstates()) {
            debug!("Playstate ignored until our own change is acknowledged");
        } else {
            apply_remote_playstate(shared, playstate);
        }
    }

    send_state(shared, latency_calculation, None);
}

/// Record the room's playback and follow explicit jumps right away
fn apply_remote_playstate(shared: &Shared, playstate: PlayState) {
    let me = shared.identity.username.as_str();
    let position = if playstate.paused {
        playstate.position
    } else {
        playstate.position + shared.latency.read().forward_delay()
    };
    let now = Instant::now();
    let previous = shared.session.read(|s| s.global().cloned());

    let transition = Transition::GlobalPlaybackObserved {
        position,
        paused: playstate.paused,
        set_by: playstate.set_by.clone(),
        observed_at: now,
    };
    if shared.apply(transition).is_none() {
        return;
    }

    let Some(setter) = playstate.set_by.filter(|u| u != me) else {
        return;
    };
    if let Some(previous) = &previous {
        if previous.fact.paused != playstate.paused {
            let verb = if playstate.paused { "paused" } else { "resumed" };
            shared.narrate(ChatRecord::system(format!(
                "{} {} at {}",
                setter,
                verb,
                format_time(playstate.position)
            )));
        }
    }

    if playstate.do_seek == Some(true) {
        let text = match previous.map(|p| p.fact.projected(now)) {
            Some(from) => format!(
                "{} jumped from {} to {}",
                setter,
                format_time(from),
                format_time(playstate.position)
            ),
            None => format!("{} jumped to {}", setter, format_time(playstate.position)),
        };
        shared.narrate(ChatRecord::system(text));
        if shared.player.is_connected() {
            shared.engine.lock().note_local_seek();
            queue_seek(shared, position);
        }
    }
}

/// Reply to the server with our position and the ping bookkeeping.
/// `announce` replaces the reported playstate for a local change.
fn send_state(shared: &Shared, latency_calculation: Option<f64>, announce: Option<PlayState>) {
    let playstate = announce.or_else(|| {
        let status = shared.player.observed();
        let position = status.position?;
        // Follow the room's pause state so replies never read as a change
        let paused = shared
            .session
            .read(|s| s.global().map(|g| g.fact.paused))
            .unwrap_or(status.paused);
        Some(PlayState {
            position,
            paused,
            do_seek: None,
            set_by: None,
        })
    });

    let counters = shared.session.read(|s| s.ignoring());
    let ignoring_on_the_fly = (counters.server != 0 || counters.client != 0).then(|| IgnoringOnTheFly {
        server: (counters.server != 0).then_some(counters.server),
        client: (counters.client != 0).then_some(counters.client),
    });

    let message = StateMessage {
        playstate,
        ping: Some(PingInfo {
            latency_calculation,
            client_latency_calculation: Some(wall_clock_secs()),
            client_rtt: Some(shared.latency.read().rtt()),
            server_rtt: None,
        }),
        ignoring_on_the_fly,
    };
    if shared.send(Envelope::State(message)) && counters.server != 0 {
        shared.apply(Transition::ServerIgnoreEchoed);
    }
}

fn send_local_file(shared: &Shared) {
    let Some(file) = shared.session.read(|s| s.local_file().cloned()) else {
        return;
    };
    shared.send(Envelope::set(SetMessage {
        file: Some(file.to_wire(shared.config.filename_privacy)),
        ..Default::default()
    }));
}

/// Push a local pause or seek to the room. Returns false when this user may
/// not control playback here.
fn announce_local_change(shared: &Shared, position: f64, paused: bool, do_seek: bool) -> bool {
    let allowed = shared.session.read(|s| s.is_online() && s.can_control());
    if !allowed {
        debug!("Local change not announced: no control over this room");
        return false;
    }
    shared.apply(Transition::LocalChangeAnnounced);
    shared.apply(Transition::GlobalPlaybackObserved {
        position,
        paused,
        set_by: Some(shared.identity.username.clone()),
        observed_at: Instant::now(),
    });
    send_state(
        shared,
        None,
        Some(PlayState {
            position,
            paused,
            do_seek: do_seek.then_some(true),
            set_by: None,
        }),
    );
    true
}

fn pause_on_leave(shared: &Shared, changes: &ChangeSet) {
    if !changes.last_peer_left() || !shared.config.sync.pause_on_leave {
        return;
    }
    let (ready, already_paused) = shared
        .session
        .read(|s| (s.local_ready(), s.global().is_some_and(|g| g.fact.paused)));
    if !ready || already_paused {
        return;
    }

    info!("Last viewer left; pausing");
    shared.narrate(ChatRecord::system("Everyone else has left, pausing"));
    queue_set_paused(shared, true);
    let position = shared
        .player
        .observed()
        .position
        .or_else(|| shared.session.read(|s| s.global().map(|g| g.fact.projected(Instant::now()))))
        .unwrap_or(0.0);
    announce_local_change(shared, position, true, false);
}

// ============================================================================
// Playlist
// ============================================================================

/// Broadcast a local playlist edit and follow the new selection
pub(crate) fn publish_playlist_edit(shared: &Shared, changes: &ChangeSet, playlist: &PlaylistState) {
    if changes.playlist {
        shared.send(Envelope::set(SetMessage {
            playlist_change: Some(PlaylistChange {
                user: None,
                files: playlist.items().to_vec(),
            }),
            ..Default::default()
        }));
    }
    if changes.playlist_index {
        shared.send(Envelope::set(SetMessage {
            playlist_index: Some(PlaylistIndexUpdate {
                user: None,
                index: playlist.current_index(),
            }),
            ..Default::default()
        }));
    }
    if changes.playlist || changes.playlist_index {
        shared.emit_playlist(playlist.clone());
    }
    if changes.playlist_index {
        load_current_item(shared);
    }
}

fn advance_playlist(shared: &Shared) {
    if !shared.session.read(|s| s.is_online() && !s.playlist().is_empty()) {
        return;
    }
    match shared.playlist.next() {
        Ok((changes, playlist)) if changes.playlist_index => {
            publish_playlist_edit(shared, &changes, &playlist);
        }
        Ok(_) => debug!("End of playlist"),
        Err(e) => debug!("Playlist not advanced: {}", e),
    }
}

/// Load the selected playlist item unless it is already playing
fn load_current_item(shared: &Shared) {
    let Some(item) = shared.session.read(|s| s.playlist().current_item().map(str::to_string)) else {
        return;
    };
    let item_name = Path::new(&item)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase());
    let playing = shared.session.read(|s| {
        s.local_file()
            .is_some_and(|f| Some(f.name.to_lowercase()) == item_name)
    });
    if playing {
        return;
    }
    let Some(path) = resolve_media(&item, &shared.config.player.media_directories) else {
        shared.advise(Advisory::MediaNotFound { item });
        return;
    };
    info!("Loading playlist item {}", path);
    shared.queue(PlayerAction::Load(path));
}

// ============================================================================
// Player
// ============================================================================

pub(crate) async fn handle_player_event(shared: &Shared, event: PlayerEvent) {
    match event {
        PlayerEvent::Connected => {
            info!("Player attached");
            *shared.activity.lock() = LocalActivity::default();
            shared.engine.lock().reset();
        }
        PlayerEvent::Disconnected(reason) => {
            *shared.activity.lock() = LocalActivity::default();
            shared.engine.lock().reset();
            shared.callback.emit(|cb| cb.on_player_state(PlayerStatus::default()));
            shared.advise(Advisory::PlayerUnavailable { reason });
        }
        PlayerEvent::Unresponsive { timeouts } => {
            shared.advise(Advisory::PlayerTimeout {
                reason: format!("{} commands in a row went unanswered", timeouts),
            });
        }
        PlayerEvent::PropertyChanged { property, status } => {
            if property == ObservedProperty::Pause {
                on_pause_reported(shared, &status);
            }
            emit_status(shared, property, status);
        }
        PlayerEvent::FileLoaded => on_file_loaded(shared).await,
        PlayerEvent::Seeked => on_seeked(shared).await,
        PlayerEvent::EndOfFile(EndFileReason::Eof) => advance_playlist(shared),
        PlayerEvent::EndOfFile(reason) => debug!("Playback ended: {:?}", reason),
        PlayerEvent::PlaybackError(reason) => shared.advise(Advisory::PlaybackError { reason }),
        PlayerEvent::Shutdown => shared.narrate(ChatRecord::system("The player is shutting down")),
    }
}

fn emit_status(shared: &Shared, property: ObservedProperty, status: PlayerStatus) {
    let now = Instant::now();
    let due = {
        let mut activity = shared.activity.lock();
        let due = property != ObservedProperty::TimePos
            || activity
                .last_status_emit
                .map_or(true, |t| now.duration_since(t) >= STATUS_EMIT_INTERVAL);
        if due {
            activity.last_status_emit = Some(now);
        }
        due
    };
    if due {
        shared.callback.emit(|cb| cb.on_player_state(status));
    }
}

fn on_pause_reported(shared: &Shared, status: &PlayerStatus) {
    let by_user = {
        let mut activity = shared.activity.lock();
        let previous = activity.last_paused.replace(status.paused);
        if activity.expected_pause == Some(status.paused) {
            activity.expected_pause = None;
            false
        } else {
            previous.is_some_and(|p| p != status.paused)
        }
    };
    if !by_user {
        return;
    }
    let Some(position) = status.position else {
        return;
    };
    info!("Playback {} locally", if status.paused { "paused" } else { "resumed" });
    if !announce_local_change(shared, position, status.paused, false) {
        shared.narrate(ChatRecord::error("You cannot control playback in this room"));
    }
}

async fn on_seeked(shared: &Shared) {
    {
        let mut activity = shared.activity.lock();
        if activity.expected_seeks > 0 {
            activity.expected_seeks -= 1;
            return;
        }
    }
    shared.engine.lock().note_local_seek();
    let position = match shared
        .player
        .request(PlayerCommand::GetProperty(ObservedProperty::TimePos))
        .await
    {
        Ok(value) => value.and_then(|v| v.as_f64()),
        Err(e) => {
            report_player_error(shared, e);
            return;
        }
    };
    let Some(position) = position else {
        return;
    };
    info!("Local seek to {}", format_time(position));
    let paused = shared.player.observed().paused;
    if !announce_local_change(shared, position, paused, true) {
        shared.narrate(ChatRecord::error("You cannot control playback in this room"));
    }
}

async fn on_file_loaded(shared: &Shared) {
    let status = match shared.player.query_status().await {
        Ok(status) => status,
        Err(e) => {
            report_player_error(shared, e);
            return;
        }
    };
    let file = status
        .filename
        .as_ref()
        .map(|name| FileFingerprint::new(name.clone(), status.duration, status.file_size));

    shared.engine.lock().reset();
    shared.activity.lock().last_paused = Some(status.paused);
    if shared.apply(Transition::LocalFileLoaded(file.clone())).is_none() {
        return;
    }
    if let Some(file) = &file {
        info!("Loaded {}", file.name);
    }
    shared.emit_roster();
    send_local_file(shared);
    shared.callback.emit(|cb| cb.on_player_state(status));
}

fn queue_set_paused(shared: &Shared, paused: bool) {
    shared.activity.lock().expected_pause = Some(paused);
    if !shared.queue(PlayerAction::SetPaused(paused)) {
        shared.activity.lock().expected_pause = None;
    }
}

fn queue_seek(shared: &Shared, position: f64) {
    shared.activity.lock().expected_seeks += 1;
    if !shared.queue(PlayerAction::Seek(position)) {
        unexpect_seek(shared);
    }
}

/// Carry out a queued command. Expectations were recorded when it was queued.
pub(crate) async fn perform_player_action(shared: &Shared, action: PlayerAction) {
    debug!("Player action: {:?}", action);
    match action {
        PlayerAction::Seek(position) => {
            if let Err(e) = shared.player.seek(position).await {
                unexpect_seek(shared);
                report_player_error(shared, e);
            }
        }
        PlayerAction::SetPaused(paused) => {
            if let Err(e) = shared.player.set_paused(paused).await {
                shared.activity.lock().expected_pause = None;
                report_player_error(shared, e);
            }
        }
        PlayerAction::Load(path) => {
            if let Err(e) = shared.player.load_file(&path).await {
                report_player_error(shared, e);
            }
        }
    }
}

fn unexpect_seek(shared: &Shared) {
    let mut activity = shared.activity.lock();
    activity.expected_seeks = activity.expected_seeks.saturating_sub(1);
}

fn report_player_error(shared: &Shared, error: PlayerError) {
    match error {
        // Link loss is reported by the Disconnected event
        PlayerError::Unavailable => debug!("Player command skipped: not connected"),
        PlayerError::Timeout(after) => shared.advise(Advisory::PlayerTimeout {
            reason: format!("no answer within {:.1}s", after.as_secs_f64()),
        }),
        other => warn!("Player command failed: {}", other),
    }
}

// ============================================================================
// Sync pass
// ============================================================================

/// Compare local playback with the room and correct the player
pub(crate) async fn sync_pass(shared: &Shared) {
    if !shared.player.is_connected() {
        return;
    }
    let status = shared.player.observed();
    let Some(position) = status.position else {
        return;
    };
    let now = Instant::now();
    let fact = PlaybackFact {
        position,
        paused: status.paused,
        speed: status.speed,
        observed_at: now,
    };
    shared.apply(Transition::LocalPlaybackObserved(fact));

    let input = shared.session.read(|s| sync_input(s, &fact, now));
    let actions = shared.engine.lock().evaluate(&input);
    for action in actions {
        execute(shared, action).await;
    }
}

fn sync_input(state: &SessionState, local: &PlaybackFact, now: Instant) -> SyncInput {
    let remote = state
        .global()
        .filter(|_| state.is_online())
        .map(|global| RemoteView {
            position: global.fact.projected(now),
            paused: global.fact.paused,
            file: state.authoritative_file().cloned(),
            set_by: global.set_by.clone(),
        });
    SyncInput {
        local: Some(LocalView {
            position: local.position,
            paused: local.paused,
            file: state.local_file().cloned(),
        }),
        remote,
    }
}

async fn execute(shared: &Shared, action: SyncAction) {
    debug!("Sync action: {:?}", action);
    match action {
        SyncAction::SetPaused(paused) => {
            shared.activity.lock().expected_pause = Some(paused);
            perform_player_action(shared, PlayerAction::SetPaused(paused)).await;
        }
        SyncAction::Seek(position) => {
            shared.activity.lock().expected_seeks += 1;
            perform_player_action(shared, PlayerAction::Seek(position)).await;
        }
        SyncAction::SetSpeed(speed) => {
            if let Err(e) = shared.player.set_speed(speed).await {
                report_player_error(shared, e);
            }
        }
        SyncAction::FileMismatch {
            local,
            remote,
            set_by,
            differences,
        } => {
            let advisory = Advisory::FileMismatch {
                local,
                remote,
                set_by,
                differences: differences.into_iter().map(String::from).collect(),
            };
            let text = advisory.message();
            shared.advise(advisory);
            if let Err(e) = shared.player.show_text(&text).await {
                debug!("Could not show mismatch notice: {}", e);
            }
        }
    }
}

/// `m:ss`, or `h:mm:ss` past an hour
fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::session::Receivers;
    use crate::config::ClientConfig;
    use crate::protocol::{RosterEntry, UserEvent};
    use crate::session::SessionIdentity;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::{Framed, LinesCodec};

    /// Answers every player command with success and records it until the
    /// link goes away
    fn fake_player(stream: DuplexStream) -> JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, LinesCodec::new());
            let mut seen = Vec::new();
            while let Some(Ok(line)) = framed.next().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({"request_id": request["request_id"], "error": "success", "data": null});
                seen.push(request["command"].clone());
                if framed.send(reply.to_string()).await.is_err() {
                    break;
                }
            }
            seen
        })
    }

    fn online_shared(config: ClientConfig) -> (Shared, Receivers) {
        let (shared, receivers) = Shared::new(config, SessionIdentity::new("alice", "lobby"));
        shared.session.apply(Transition::ConnectionReady).unwrap();
        (shared, receivers)
    }

    /// Do what the player loop would do with everything queued so far
    async fn perform_queued(shared: &Shared, receivers: &mut Receivers) -> Vec<PlayerAction> {
        let mut performed = Vec::new();
        while let Ok(action) = receivers.player.actions.try_recv() {
            performed.push(action.clone());
            perform_player_action(shared, action).await;
        }
        performed
    }

    fn remote_state(paused: bool, do_seek: Option<bool>) -> Envelope {
        Envelope::State(StateMessage {
            playstate: Some(PlayState {
                position: 90.0,
                paused,
                do_seek,
                set_by: Some("bob".into()),
            }),
            ping: None,
            ignoring_on_the_fly: None,
        })
    }

    fn listing(users: &[(&str, Option<bool>)]) -> Envelope {
        let room: HashMap<String, RosterEntry> = users
            .iter()
            .map(|(name, ready)| {
                (
                    name.to_string(),
                    RosterEntry {
                        is_ready: *ready,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Envelope::List(Some(HashMap::from([("lobby".to_string(), room)])))
    }

    fn left(username: &str) -> Envelope {
        let update = UserUpdate {
            event: Some(UserEvent {
                left: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        Envelope::set(SetMessage {
            user: Some(HashMap::from([(username.to_string(), update)])),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_pause_on_leave_fires_once() {
        let mut config = ClientConfig::default();
        config.sync.pause_on_leave = true;
        let (shared, mut receivers) = online_shared(config);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let player = fake_player(theirs);
        shared.player.attach(ours).unwrap();

        handle_server_message(&shared, listing(&[("alice", Some(true)), ("bob", Some(true))]));
        handle_server_message(&shared, left("bob"));
        // A later full roster with nobody else must not pause again
        handle_server_message(&shared, listing(&[("alice", Some(true))]));
        handle_server_message(&shared, left("carol"));
        assert_eq!(
            perform_queued(&shared, &mut receivers).await,
            vec![PlayerAction::SetPaused(true)]
        );

        shared.player.flush().await;
        shared.player.detach().await;
        let commands = player.await.unwrap();
        let pauses = commands
            .iter()
            .filter(|c| **c == json!(["set_property", "pause", true]))
            .count();
        assert_eq!(pauses, 1);

        let global = shared.session.read(|s| s.global().cloned()).unwrap();
        assert!(global.fact.paused);
        assert_eq!(global.set_by.as_deref(), Some("alice"));
        assert!(shared
            .chat
            .recent(10)
            .iter()
            .any(|r| r.text.contains("Everyone else has left")));
    }

    #[tokio::test]
    async fn test_pause_on_leave_needs_local_readiness() {
        let mut config = ClientConfig::default();
        config.sync.pause_on_leave = true;
        let (shared, mut receivers) = online_shared(config);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let player = fake_player(theirs);
        shared.player.attach(ours).unwrap();

        handle_server_message(&shared, listing(&[("alice", Some(false)), ("bob", None)]));
        handle_server_message(&shared, left("bob"));
        assert!(perform_queued(&shared, &mut receivers).await.is_empty());

        shared.player.flush().await;
        shared.player.detach().await;
        let commands = player.await.unwrap();
        assert!(!commands.contains(&json!(["set_property", "pause", true])));
        assert!(commands.iter().any(|c| c[0] == "observe_property"));
    }

    #[tokio::test]
    async fn test_remote_playstate_is_recorded_and_narrated() {
        let (shared, _receivers) = online_shared(ClientConfig::default());

        handle_server_message(&shared, remote_state(true, None));
        handle_server_message(&shared, remote_state(false, None));
        handle_server_message(&shared, remote_state(false, Some(true)));

        let global = shared.session.read(|s| s.global().cloned()).unwrap();
        assert!(!global.fact.paused);
        assert_eq!(global.set_by.as_deref(), Some("bob"));
        let texts: Vec<String> = shared.chat.recent(10).into_iter().map(|r| r.text).collect();
        assert!(texts.iter().any(|t| t == "bob resumed at 1:30"));
        assert!(texts.iter().any(|t| t.starts_with("bob jumped from")));
    }

    #[tokio::test]
    async fn test_playstates_ignored_while_own_change_pending() {
        let (shared, _receivers) = online_shared(ClientConfig::default());
        shared.session.apply(Transition::LocalChangeAnnounced).unwrap();

        let pending = StateMessage {
            playstate: Some(PlayState {
                position: 5.0,
                paused: false,
                do_seek: None,
                set_by: Some("bob".into()),
            }),
            ping: None,
            ignoring_on_the_fly: None,
        };
        handle_server_message(&shared, Envelope::State(pending.clone()));
        assert!(shared.session.read(|s| s.global().is_none()));

        let acknowledged = StateMessage {
            ignoring_on_the_fly: Some(IgnoringOnTheFly {
                server: None,
                client: Some(1),
            }),
            ..pending
        };
        handle_server_message(&shared, Envelope::State(acknowledged));
        assert!(shared.session.read(|s| s.global().is_some()));
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced() {
        let (shared, _receivers) = online_shared(ClientConfig::default());
        handle_server_message(
            &shared,
            Envelope::Error(crate::protocol::ErrorMessage {
                message: "Wrong password supplied".into(),
            }),
        );
        let last = shared.chat.recent(1).pop().unwrap();
        assert_eq!(last.kind, crate::chat::ChatKind::Error);
        assert!(last.text.contains("Wrong password supplied"));
    }

    #[tokio::test]
    async fn test_missing_playlist_media_raises_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.player.media_directories = vec![dir.path().to_path_buf()];
        let (shared, _receivers) = online_shared(config);

        handle_server_message(
            &shared,
            Envelope::set(SetMessage {
                playlist_change: Some(PlaylistChange {
                    user: Some("bob".into()),
                    files: vec!["missing.mkv".into()],
                }),
                playlist_index: Some(PlaylistIndexUpdate {
                    user: Some("bob".into()),
                    index: Some(0),
                }),
                ..Default::default()
            }),
        );

        assert_eq!(shared.session.read(|s| s.playlist().current_index()), Some(0));
        let texts: Vec<String> = shared.chat.recent(10).into_iter().map(|r| r.text).collect();
        assert!(texts.iter().any(|t| t.contains("missing.mkv")));
    }

    #[tokio::test]
    async fn test_silent_player_does_not_hold_up_frames() {
        let mut config = ClientConfig::default();
        config.player.command_timeout = Duration::from_millis(200);
        let (shared, mut receivers) = online_shared(config);
        let (ours, _silent) = tokio::io::duplex(64 * 1024);
        shared.player.attach(ours).unwrap();

        let started = Instant::now();
        handle_server_message(&shared, remote_state(false, Some(true)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(shared.activity.lock().expected_seeks, 1);

        let queued = receivers.player.actions.try_recv().unwrap();
        assert!(matches!(queued, PlayerAction::Seek(p) if (p - 90.0).abs() < 1.0));
        // The seek is never answered, so it is no longer expected
        perform_player_action(&shared, queued).await;
        assert_eq!(shared.activity.lock().expected_seeks, 0);
        shared.player.detach().await;
    }

    #[tokio::test]
    async fn test_playlist_selection_queues_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv"), b"").unwrap();
        let mut config = ClientConfig::default();
        config.player.media_directories = vec![dir.path().to_path_buf()];
        let (shared, mut receivers) = online_shared(config);

        handle_server_message(
            &shared,
            Envelope::set(SetMessage {
                playlist_change: Some(PlaylistChange {
                    user: Some("bob".into()),
                    files: vec!["movie.mkv".into()],
                }),
                playlist_index: Some(PlaylistIndexUpdate {
                    user: Some("bob".into()),
                    index: Some(0),
                }),
                ..Default::default()
            }),
        );

        let expected = dir.path().join("movie.mkv").to_string_lossy().to_string();
        assert_eq!(receivers.player.actions.try_recv().unwrap(), PlayerAction::Load(expected));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(90.4), "1:30");
        assert_eq!(format_time(3725.0), "1:02:05");
        assert_eq!(format_time(-3.0), "0:00");
    }
}
