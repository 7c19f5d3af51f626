//! Client session: owns the connection, the player, and the loops between them

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::{
    handle_connection_event, handle_player_event, perform_player_action, publish_playlist_edit, sync_pass,
};
use super::types::{Advisory, CallbackSlot, ClientCallback, CoreError, LocalActivity, PlayerAction};
use crate::chat::{help_text, roster_summary, ChatCommand, ChatInput, ChatManager, ChatRecord};
use crate::config::ClientConfig;
use crate::latency::{self, SharedLatencyTracker};
use crate::network::{ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, ServerAddress};
use crate::player::{PlayerController, PlayerEvent, PlayerSettings, PlayerStatus};
use crate::playlist::{PlaylistManager, PlaylistState};
use crate::protocol::{Envelope, ReadyState, RoomInfo, SetMessage};
use crate::session::{
    ChangeSet, Member, SessionIdentity, SessionPolicy, SessionState, SharedSession, StateInvariantViolation,
    Transition,
};
use crate::sync::SyncEngine;

/// State reachable from every client task
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub identity: SessionIdentity,
    pub session: SharedSession,
    pub connection: ConnectionManager,
    pub player: PlayerController,
    pub playlist: PlaylistManager,
    pub chat: ChatManager,
    pub latency: SharedLatencyTracker,
    pub engine: Mutex<SyncEngine>,
    pub activity: Mutex<LocalActivity>,
    pub actions: UnboundedSender<PlayerAction>,
    pub callback: CallbackSlot,
}

/// Event channels, held while no tasks are consuming them
pub(crate) struct Receivers {
    pub connection: UnboundedReceiver<ConnectionEvent>,
    pub player: PlayerReceivers,
}

pub(crate) struct PlayerReceivers {
    pub events: UnboundedReceiver<PlayerEvent>,
    pub actions: UnboundedReceiver<PlayerAction>,
}

struct Running {
    cancel: CancellationToken,
    transport: JoinHandle<UnboundedReceiver<ConnectionEvent>>,
    player: JoinHandle<PlayerReceivers>,
    sync: JoinHandle<()>,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig, identity: SessionIdentity) -> (Self, Receivers) {
        let policy = SessionPolicy {
            max_controllers_per_room: config.max_controllers_per_room,
            playlist_loop: config.shared_playlist_loop,
        };
        let session = SharedSession::new(SessionState::new(identity.clone(), policy));
        let (connection, connection_rx) = ConnectionManager::new(ConnectionSettings::from(&config));
        let (player, player_rx) = PlayerController::new(PlayerSettings::from(&config));
        let (actions, actions_rx) = mpsc::unbounded_channel();

        let shared = Self {
            playlist: PlaylistManager::new(session.clone()),
            engine: Mutex::new(SyncEngine::from_config(&config.sync)),
            config,
            identity,
            session,
            connection,
            player,
            chat: ChatManager::new(),
            latency: latency::new_shared_tracker(),
            activity: Mutex::new(LocalActivity::default()),
            actions,
            callback: CallbackSlot::default(),
        };
        let receivers = Receivers {
            connection: connection_rx,
            player: PlayerReceivers {
                events: player_rx,
                actions: actions_rx,
            },
        };
        (shared, receivers)
    }

    /// Apply a server-driven transition. A rejection is surfaced as an
    /// advisory and the state is left as it was.
    pub(crate) fn apply(&self, transition: Transition) -> Option<ChangeSet> {
        self.apply_and_read(transition, |_| ()).map(|(changes, _)| changes)
    }

    pub(crate) fn apply_and_read<R>(
        &self,
        transition: Transition,
        read: impl FnOnce(&SessionState) -> R,
    ) -> Option<(ChangeSet, R)> {
        match self.session.apply_and_read(transition, read) {
            Ok(applied) => Some(applied),
            Err(StateInvariantViolation::NotOnline) => None,
            Err(e) => {
                self.advise(Advisory::InvariantViolation { reason: e.to_string() });
                None
            }
        }
    }

    /// Queue a frame; false when the connection is not ready
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        match self.connection.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!("Frame not sent: {}", e);
                false
            }
        }
    }

    pub(crate) fn narrate(&self, record: ChatRecord) {
        let record = self.chat.push(record);
        self.callback.emit(|cb| cb.on_chat(record));
    }

    pub(crate) fn advise(&self, advisory: Advisory) {
        warn!("{}", advisory.message());
        self.narrate(ChatRecord::error(advisory.message()));
        self.callback.emit(|cb| cb.on_advisory(advisory));
    }

    pub(crate) fn emit_roster(&self) {
        let members = self.session.read(|s| s.room_members(s.room()));
        self.callback.emit(|cb| cb.on_roster_changed(members));
    }

    pub(crate) fn emit_playlist(&self, playlist: PlaylistState) {
        self.callback.emit(|cb| cb.on_playlist_changed(playlist));
    }

    /// Hand a player command to the player loop; false once it has stopped
    pub(crate) fn queue(&self, action: PlayerAction) -> bool {
        match self.actions.send(action) {
            Ok(()) => true,
            Err(e) => {
                debug!("Player action dropped: {:?}", e.0);
                false
            }
        }
    }
}

/// A watch-party client bound to one identity and configuration
pub struct Client {
    shared: Arc<Shared>,
    idle: Mutex<Option<Receivers>>,
    running: Mutex<Option<Running>>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Client {
    /// Build a client. Nothing is opened until [`Client::connect`].
    pub fn new(config: ClientConfig, mut identity: SessionIdentity) -> Result<Self, CoreError> {
        config.validate()?;
        if identity.password.is_none() {
            identity.password = config.server.password.clone();
        }
        identity.validate().map_err(CoreError::Identity)?;

        info!("Creating client for {} in room {}", identity.username, identity.room);
        let (shared, receivers) = Shared::new(config, identity);
        Ok(Self {
            shared: Arc::new(shared),
            idle: Mutex::new(Some(receivers)),
            running: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn set_callback(&self, callback: Arc<dyn ClientCallback>) {
        self.shared.callback.set(Some(callback));
    }

    pub fn clear_callback(&self) {
        self.shared.callback.set(None);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.shared.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Consistent copy of everything known about the session
    pub fn session_snapshot(&self) -> SessionState {
        self.shared.session.snapshot()
    }

    /// Members of the room we are in
    pub fn members(&self) -> Vec<Member> {
        self.shared.session.read(|s| s.room_members(s.room()))
    }

    pub fn playlist(&self) -> PlaylistState {
        self.shared.playlist.snapshot()
    }

    pub fn chat_history(&self, limit: usize) -> Vec<ChatRecord> {
        self.shared.chat.recent(limit)
    }

    pub fn player(&self) -> &PlayerController {
        &self.shared.player
    }

    pub fn player_status(&self) -> PlayerStatus {
        self.shared.player.observed()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, authenticate, and start the event and sync loops.
    /// Returns once the server has accepted the session.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let receivers = self.idle.lock().take().ok_or(CoreError::AlreadyRunning)?;
        let cancel = CancellationToken::new();
        let running = Running {
            transport: tokio::spawn(transport_loop(
                self.shared.clone(),
                receivers.connection,
                cancel.clone(),
            )),
            player: tokio::spawn(player_loop(self.shared.clone(), receivers.player, cancel.clone())),
            sync: tokio::spawn(sync_loop(self.shared.clone(), cancel.clone())),
            cancel,
        };
        *self.running.lock() = Some(running);

        if self.shared.config.player.socket_path.is_none() && !self.shared.player.is_connected() {
            self.shared.advise(Advisory::PlayerUnavailable {
                reason: "no player control socket configured".into(),
            });
        }

        let address = ServerAddress::from(&self.shared.config.server);
        if let Err(e) = self.shared.connection.connect(&self.shared.identity, &address).await {
            error!("Failed to connect to {}:{}: {}", address.host, address.port, e);
            self.stop_tasks().await;
            return Err(e.into());
        }
        // Repeated by the transport loop; whichever runs first resets the session
        self.shared.session.apply(Transition::ConnectionReady)?;
        info!("Connected to {}:{}", address.host, address.port);
        Ok(())
    }

    /// Leave the server. Background loops are stopped before this returns
    /// and queued player commands are given a chance to finish.
    pub async fn disconnect(&self) {
        info!("Disconnecting");
        self.shared.connection.disconnect().await;
        self.stop_tasks().await;
        if self.shared.session.read(|s| s.is_online()) {
            self.shared.apply(Transition::ConnectionLost);
        }
        self.shared.player.flush().await;
    }

    /// Disconnect and release the player for good
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.stop_player_supervisor().await;
        self.shared.player.drain().await;
        info!("Client shut down");
    }

    /// Keep the player control channel connected in the background
    pub fn start_player_supervisor(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = self.shared.player.spawn_supervisor(cancel.clone());
        *supervisor = Some((cancel, handle));
    }

    pub async fn stop_player_supervisor(&self) {
        let running = self.supervisor.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Player supervisor ended abnormally: {}", e);
            }
        }
    }

    async fn stop_tasks(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.sync.await {
            warn!("Sync loop ended abnormally: {}", e);
        }
        let transport = running.transport.await;
        let player = running.player.await;
        match (transport, player) {
            (Ok(mut connection), Ok(mut player)) => {
                // Deliver the final state changes; frames are stale by now
                while let Ok(event) = connection.try_recv() {
                    if let ConnectionEvent::StateChanged(state) = event {
                        self.shared.callback.emit(|cb| cb.on_connection_state_changed(state));
                    }
                }
                while let Ok(action) = player.actions.try_recv() {
                    debug!("Dropping unperformed player action {:?}", action);
                }
                *self.idle.lock() = Some(Receivers { connection, player });
            }
            (transport, player) => {
                error!(
                    "Client task panicked (transport ok: {}, player ok: {}); reconnecting is no longer possible",
                    transport.is_ok(),
                    player.is_ok()
                );
            }
        }
    }

    // ========================================================================
    // Room
    // ========================================================================

    /// Handle a line typed into the chat box: plain text goes to the room,
    /// `/commands` run locally.
    pub fn send_chat_input(&self, input: &str) -> Result<(), CoreError> {
        match self.shared.chat.classify(input) {
            ChatInput::Empty => Ok(()),
            ChatInput::Message(text) => self.send_chat(&text),
            ChatInput::Command(command) => self.run_command(command),
            ChatInput::Rejected(record) => {
                self.shared.callback.emit(|cb| cb.on_chat(record));
                Ok(())
            }
        }
    }

    /// Send a chat line verbatim. The server echoes it back to everyone.
    pub fn send_chat(&self, text: &str) -> Result<(), CoreError> {
        self.ensure_online()?;
        self.shared.connection.send(Envelope::chat(text))?;
        Ok(())
    }

    fn run_command(&self, command: ChatCommand) -> Result<(), CoreError> {
        match command {
            ChatCommand::Room(room) => self.change_room(&room),
            ChatCommand::List => {
                let summary = self.shared.session.read(roster_summary);
                self.shared.narrate(ChatRecord::system(summary));
                Ok(())
            }
            ChatCommand::Help => {
                self.shared.narrate(ChatRecord::system(help_text()));
                Ok(())
            }
            ChatCommand::Ready => self.set_ready(true),
            ChatCommand::Unready => self.set_ready(false),
        }
    }

    pub fn set_ready(&self, ready: bool) -> Result<(), CoreError> {
        self.ensure_online()?;
        self.shared.connection.send(Envelope::set(SetMessage {
            ready: Some(ReadyState {
                is_ready: Some(ready),
                manually_initiated: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }))?;
        self.shared.session.apply(Transition::ReadinessChanged {
            username: self.shared.identity.username.clone(),
            is_ready: Some(ready),
        })?;
        self.shared.emit_roster();
        Ok(())
    }

    pub fn change_room(&self, room: &str) -> Result<(), CoreError> {
        let room = room.trim();
        if room.is_empty() {
            return Err(StateInvariantViolation::EmptyRoomName.into());
        }
        self.ensure_online()?;
        self.shared.connection.send(Envelope::set(SetMessage {
            room: Some(RoomInfo::named(room)),
            ..Default::default()
        }))?;
        self.shared.session.apply(Transition::RoomChanged(room.to_string()))?;
        self.shared
            .narrate(ChatRecord::system(format!("You joined room '{}'", room)));
        self.shared.send(Envelope::list_request());
        self.shared.emit_roster();
        Ok(())
    }

    fn ensure_online(&self) -> Result<(), CoreError> {
        if self.shared.session.read(|s| s.is_online()) && self.shared.connection.is_ready() {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    // ========================================================================
    // Playlist
    // ========================================================================

    pub async fn playlist_add(&self, item: impl Into<String>) -> Result<PlaylistState, CoreError> {
        let item = item.into();
        self.edit_playlist(move |p| p.add(item)).await
    }

    pub async fn playlist_remove(&self, index: usize) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.remove(index)).await
    }

    pub async fn playlist_move(&self, from: usize, to: usize) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.move_item(from, to)).await
    }

    pub async fn playlist_next(&self) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.next()).await
    }

    pub async fn playlist_previous(&self) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.previous()).await
    }

    pub async fn playlist_clear(&self) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.clear()).await
    }

    pub async fn playlist_select(&self, index: usize) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.set_index(index)).await
    }

    pub async fn set_playlist_loop(&self, looping: bool) -> Result<PlaylistState, CoreError> {
        self.edit_playlist(|p| p.set_loop(looping)).await
    }

    async fn edit_playlist(
        &self,
        edit: impl FnOnce(&PlaylistManager) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation>,
    ) -> Result<PlaylistState, CoreError> {
        self.ensure_online()?;
        let (changes, playlist) = edit(&self.shared.playlist)?;
        publish_playlist_edit(&self.shared, &changes, &playlist);
        Ok(playlist)
    }

    /// Open a file in the player outside the shared playlist
    pub async fn load_file(&self, path: &str) -> Result<(), CoreError> {
        self.shared.player.load_file(path).await?;
        Ok(())
    }
}

async fn transport_loop(
    shared: Arc<Shared>,
    mut events: UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
) -> UnboundedReceiver<ConnectionEvent> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => handle_connection_event(&shared, event),
                None => break,
            },
        }
    }
    debug!("Transport loop stopped");
    events
}

/// Player reports and queued player commands, in arrival order per channel
async fn player_loop(
    shared: Arc<Shared>,
    mut receivers: PlayerReceivers,
    cancel: CancellationToken,
) -> PlayerReceivers {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = receivers.events.recv() => match event {
                Some(event) => handle_player_event(&shared, event).await,
                None => break,
            },
            Some(action) = receivers.actions.recv() => perform_player_action(&shared, action).await,
        }
    }
    debug!("Player loop stopped");
    receivers
}

async fn sync_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let wakeup = shared.session.sync_wakeup();
    let mut ticker = interval(shared.config.sync.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wakeup.notified() => {}
        }
        sync_pass(&shared).await;
    }
    debug!("Sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::protocol::{ChatMessage, EnvelopeCodec, HelloMessage, RosterEntry};
    use futures::{SinkExt, StreamExt};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    type Server = Framed<TcpStream, EnvelopeCodec>;

    async fn recv(server: &mut Server) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .expect("timed out waiting for the client")
            .expect("client closed the connection")
            .expect("read failed")
            .expect("undecodable frame")
    }

    /// Accept the handshake and hand over a roster with just `alice`
    async fn accept(listener: &TcpListener) -> Server {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = Framed::new(stream, EnvelopeCodec::new());
        let hello = match recv(&mut server).await {
            Envelope::Hello(hello) => hello,
            other => panic!("expected Hello, got {:?}", other),
        };
        server
            .send(Envelope::Hello(HelloMessage {
                motd: Some("welcome".into()),
                ..hello.clone()
            }))
            .await
            .unwrap();
        assert_eq!(recv(&mut server).await, Envelope::list_request());
        let room = HashMap::from([(hello.username.clone(), RosterEntry::default())]);
        server
            .send(Envelope::List(Some(HashMap::from([(hello.room.name, room)]))))
            .await
            .unwrap();
        server
    }

    fn config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = port;
        config.server.use_tls = false;
        config.reconnect = ReconnectPolicy::disabled();
        config
    }

    #[tokio::test]
    async fn test_ready_command_is_not_sent_as_chat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            let mut frames = Vec::new();
            loop {
                let frame = recv(&mut server).await;
                let done = matches!(frame, Envelope::Chat(_));
                frames.push(frame);
                if done {
                    return frames;
                }
            }
        });

        let client = Client::new(config(port), SessionIdentity::new("alice", "lobby")).unwrap();
        client.connect().await.unwrap();
        client.send_chat_input("/ready").unwrap();
        client.send_chat_input("  ").unwrap();
        client.send_chat_input("hello everyone").unwrap();

        let frames = server.await.unwrap();
        let chats: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                Envelope::Chat(ChatMessage::Text(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chats, vec!["hello everyone"]);
        assert!(frames.iter().any(|f| matches!(
            f,
            Envelope::Set(SetMessage {
                ready: Some(ReadyState {
                    is_ready: Some(true),
                    manually_initiated: Some(true),
                    ..
                }),
                ..
            })
        )));

        client.disconnect().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.shared.session.read(|s| s.is_online()));
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let client = Client::new(ClientConfig::default(), SessionIdentity::new("alice", "lobby")).unwrap();
        assert!(matches!(client.send_chat_input("hi"), Err(CoreError::NotConnected)));
        assert!(matches!(client.set_ready(true), Err(CoreError::NotConnected)));
        assert!(matches!(client.playlist_add("a.mkv").await, Err(CoreError::NotConnected)));
        // Local commands still work offline
        client.send_chat_input("/help").unwrap();
        assert_eq!(client.chat_history(1)[0].text, help_text());
        client.send_chat_input("/bogus").unwrap();
        assert_eq!(client.chat_history(1)[0].kind, crate::chat::ChatKind::Error);
    }

    #[tokio::test]
    async fn test_connect_twice_and_reconnect_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let first = accept(&listener).await;
            let second = accept(&listener).await;
            (first, second)
        });

        let client = Client::new(config(port), SessionIdentity::new("alice", "lobby")).unwrap();
        client.connect().await.unwrap();
        assert!(matches!(client.connect().await, Err(CoreError::AlreadyRunning)));
        client.disconnect().await;
        client.connect().await.unwrap();
        assert!(client.shared.session.read(|s| s.is_online()));
        client.disconnect().await;
        drop(server.await.unwrap());
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let result = Client::new(ClientConfig::default(), SessionIdentity::new("", "lobby"));
        assert!(matches!(result, Err(CoreError::Identity(_))));
    }

    #[test]
    fn test_server_password_fills_identity() {
        let mut config = ClientConfig::default();
        config.server.password = Some("secret".into());
        let client = Client::new(config, SessionIdentity::new("alice", "lobby")).unwrap();
        assert_eq!(client.identity().password.as_deref(), Some("secret"));
    }
}
