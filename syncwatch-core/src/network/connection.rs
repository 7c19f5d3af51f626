//! Connection Manager
//!
//! Owns the line-framed link to the session server. `connect` runs the
//! handshake (optional STARTTLS, `Hello`, roster request) and then hands the
//! transport to a background task that pumps frames both ways, watches for
//! silence, and re-runs the full handshake with backoff when the link drops.
//! Everything the task observes is published on the event channel returned
//! by [`ConnectionManager::new`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use super::{tls, ConnectError, ConnectionState, SendError};
use crate::config::{ClientConfig, ReconnectPolicy, ServerConfig};
use crate::protocol::{
    CodecError, Decoded, Envelope, EnvelopeCodec, HelloMessage, ServerErrorKind, StartTls,
    TlsMessage,
};
use crate::session::SessionIdentity;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl From<&ServerConfig> for ServerAddress {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            use_tls: server.use_tls,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            heartbeat_timeout: config.heartbeat_timeout,
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Published by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A decoded server frame
    Frame(Envelope),
    /// A frame was dropped; the link stays up
    ProtocolError(String),
    /// The link failed; a reconnect may follow
    TransportLost(String),
    /// A reconnect handshake was refused by the server
    HandshakeRejected(String),
    /// The link is back after `attempts` tries
    Reconnected { attempts: u32 },
}

/// Framed transport, plain or upgraded
enum Transport {
    Plain(Framed<TcpStream, EnvelopeCodec>),
    Tls(Box<Framed<TlsStream<TcpStream>, EnvelopeCodec>>),
}

impl Transport {
    async fn send(&mut self, envelope: Envelope) -> Result<(), CodecError> {
        match self {
            Transport::Plain(framed) => framed.send(envelope).await,
            Transport::Tls(framed) => framed.send(envelope).await,
        }
    }

    async fn next(&mut self) -> Option<Result<Decoded, CodecError>> {
        match self {
            Transport::Plain(framed) => framed.next().await,
            Transport::Tls(framed) => framed.next().await,
        }
    }

    async fn upgrade(self, host: &str) -> Result<Transport, ConnectError> {
        match self {
            Transport::Plain(framed) => {
                let stream = tls::upgrade(framed.into_inner(), host).await?;
                Ok(Transport::Tls(Box::new(Framed::new(stream, EnvelopeCodec::new()))))
            }
            upgraded => Ok(upgraded),
        }
    }
}

/// Current state plus change notification
#[derive(Clone)]
struct StateCell {
    current: Arc<RwLock<ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl StateCell {
    fn get(&self) -> ConnectionState {
        *self.current.read()
    }

    fn set(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.current.write(), next);
        if previous != next {
            info!("Connection state: {:?} -> {:?}", previous, next);
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }
}

type Outbound = Arc<RwLock<Option<mpsc::UnboundedSender<Envelope>>>>;

pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: StateCell,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Outbound,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            state: StateCell {
                current: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                events: event_tx.clone(),
            },
            events: event_tx,
            outbound: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
        };
        (manager, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == ConnectionState::Ready
    }

    /// Open the link and authenticate. Returns once the session is `Ready`.
    #[instrument(skip_all, fields(host = %address.host, port = address.port))]
    pub async fn connect(
        &self,
        identity: &SessionIdentity,
        address: &ServerAddress,
    ) -> Result<(), ConnectError> {
        identity.validate().map_err(ConnectError::InvalidIdentity)?;
        if self.state.get().is_active() {
            return Err(ConnectError::AlreadyConnected);
        }

        self.state.set(ConnectionState::Connecting);
        let hello = identity.hello();
        let progress = self.state.clone();
        let handshake = establish(address, &hello, move |s| progress.set(s));

        let (transport, buffered) = match timeout(self.settings.handshake_timeout, handshake).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!("Connect failed: {}", e);
                self.state.set(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                warn!("Connect timed out after {:?}", self.settings.handshake_timeout);
                self.state.set(ConnectionState::Failed);
                return Err(ConnectError::Timeout);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.write() = Some(outbound_tx);

        let cancel = CancellationToken::new();
        let link = Link {
            address: address.clone(),
            hello,
            settings: self.settings.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            outbound: self.outbound.clone(),
            cancel: cancel.clone(),
        };

        self.state.set(ConnectionState::Ready);
        for frame in buffered {
            let _ = self.events.send(ConnectionEvent::Frame(frame));
        }

        let handle = tokio::spawn(link.run(transport, outbound_rx));
        if let Some((old_cancel, _)) = self.task.lock().replace((cancel, handle)) {
            old_cancel.cancel();
        }
        Ok(())
    }

    /// Tear the link down. Idempotent; always ends in `Disconnected`.
    pub async fn disconnect(&self) {
        let running = self.task.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Connection task ended abnormally: {}", e);
            }
        }
        self.outbound.write().take();
        self.state.set(ConnectionState::Disconnected);
    }

    /// Queue a frame for the server. Only valid while `Ready`.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if !self.is_ready() {
            return Err(SendError::NotConnected);
        }
        let guard = self.outbound.read();
        let tx = guard.as_ref().ok_or(SendError::NotConnected)?;
        tx.send(envelope).map_err(|_| SendError::NotConnected)
    }
}

/// Full handshake: TCP, optional STARTTLS, Hello, roster request.
/// Frames that arrive on the way are returned for delivery once `Ready`.
async fn establish<F>(
    address: &ServerAddress,
    hello: &HelloMessage,
    progress: F,
) -> Result<(Transport, Vec<Envelope>), ConnectError>
where
    F: Fn(ConnectionState),
{
    let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    let mut transport = Transport::Plain(Framed::new(stream, EnvelopeCodec::new()));
    let mut buffered = Vec::new();

    if address.use_tls {
        transport.send(Envelope::start_tls()).await?;
        transport = negotiate_tls(transport, &address.host, &mut buffered).await?;
    }

    progress(ConnectionState::Authenticating);
    transport.send(Envelope::Hello(hello.clone())).await?;

    let mut acknowledged = false;
    loop {
        match next_frame(&mut transport).await? {
            Envelope::Error(err) => {
                return Err(ConnectError::Rejected {
                    reason: err.message,
                })
            }
            hello @ Envelope::Hello(_) => {
                debug!("Hello acknowledged");
                acknowledged = true;
                progress(ConnectionState::Synchronizing);
                transport.send(Envelope::list_request()).await?;
                buffered.push(hello);
            }
            first @ (Envelope::State(_) | Envelope::List(_)) => {
                buffered.push(first);
                break;
            }
            other => buffered.push(other),
        }
    }

    if !acknowledged {
        transport.send(Envelope::list_request()).await?;
    }
    Ok((transport, buffered))
}

async fn negotiate_tls(
    mut transport: Transport,
    host: &str,
    buffered: &mut Vec<Envelope>,
) -> Result<Transport, ConnectError> {
    loop {
        match next_frame(&mut transport).await? {
            Envelope::Tls(TlsMessage {
                start_tls: StartTls::Accepted,
            }) => {
                info!("Server accepted STARTTLS, upgrading");
                return transport.upgrade(host).await;
            }
            Envelope::Tls(TlsMessage {
                start_tls: StartTls::Refused,
            }) => {
                warn!("Server does not offer TLS, continuing unencrypted");
                return Ok(transport);
            }
            Envelope::Error(err) if err.kind() == ServerErrorKind::TlsUnsupported => {
                warn!("Server does not understand STARTTLS, continuing unencrypted");
                return Ok(transport);
            }
            Envelope::Error(err) => {
                return Err(ConnectError::Rejected {
                    reason: err.message,
                })
            }
            other => buffered.push(other),
        }
    }
}

/// Next well-formed frame; bad frames are logged and skipped
async fn next_frame(transport: &mut Transport) -> Result<Envelope, ConnectError> {
    loop {
        match transport.next().await {
            Some(Ok(Ok(envelope))) => return Ok(envelope),
            Some(Ok(Err(e))) => warn!("Dropping frame during handshake: {}", e),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectError::Closed),
        }
    }
}

enum LinkExit {
    Cancelled,
    /// The server sent an `Error`; no reconnect
    Rejected(String),
    Lost(String),
}

enum ReconnectOutcome {
    Established {
        transport: Transport,
        buffered: Vec<Envelope>,
        attempts: u32,
    },
    Cancelled,
    GaveUp,
}

/// State owned by the background connection task
struct Link {
    address: ServerAddress,
    hello: HelloMessage,
    settings: ConnectionSettings,
    state: StateCell,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Outbound,
    cancel: CancellationToken,
}

impl Link {
    async fn run(self, mut transport: Transport, mut outbound_rx: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            match self.pump(&mut transport, &mut outbound_rx).await {
                LinkExit::Cancelled => {
                    debug!("Connection task cancelled");
                    break;
                }
                LinkExit::Rejected(reason) => {
                    error!("Server ended the session: {}", reason);
                    self.outbound.write().take();
                    self.state.set(ConnectionState::Failed);
                    break;
                }
                LinkExit::Lost(reason) => {
                    warn!("Connection lost: {}", reason);
                    let _ = self.events.send(ConnectionEvent::TransportLost(reason));
                    if !self.settings.reconnect.enabled {
                        self.outbound.write().take();
                        self.state.set(ConnectionState::Failed);
                        break;
                    }

                    self.state.set(ConnectionState::Reconnecting);
                    match self.reconnect().await {
                        ReconnectOutcome::Established {
                            transport: fresh,
                            buffered,
                            attempts,
                        } => {
                            transport = fresh;
                            let mut stale = 0;
                            while outbound_rx.try_recv().is_ok() {
                                stale += 1;
                            }
                            if stale > 0 {
                                debug!("Discarded {} frames queued before the link dropped", stale);
                            }
                            self.state.set(ConnectionState::Ready);
                            let _ = self.events.send(ConnectionEvent::Reconnected { attempts });
                            for frame in buffered {
                                let _ = self.events.send(ConnectionEvent::Frame(frame));
                            }
                        }
                        ReconnectOutcome::Cancelled => break,
                        ReconnectOutcome::GaveUp => {
                            self.outbound.write().take();
                            self.state.set(ConnectionState::Failed);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn pump(
        &self,
        transport: &mut Transport,
        outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> LinkExit {
        let heartbeat = self.settings.heartbeat_timeout;
        let mut deadline = Instant::now() + heartbeat;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LinkExit::Cancelled,
                Some(envelope) = outbound_rx.recv() => {
                    let kind = envelope.kind();
                    if let Err(e) = transport.send(envelope).await {
                        return LinkExit::Lost(format!("failed to send {kind}: {e}"));
                    }
                    debug!("Sent {} frame", kind);
                }
                frame = transport.next() => match frame {
                    Some(Ok(Ok(envelope))) => {
                        deadline = Instant::now() + heartbeat;
                        if let Envelope::Error(err) = &envelope {
                            let reason = err.message.clone();
                            let _ = self.events.send(ConnectionEvent::Frame(envelope));
                            return LinkExit::Rejected(reason);
                        }
                        let _ = self.events.send(ConnectionEvent::Frame(envelope));
                    }
                    Some(Ok(Err(e))) => {
                        deadline = Instant::now() + heartbeat;
                        warn!("Dropping frame: {}", e);
                        let _ = self.events.send(ConnectionEvent::ProtocolError(e.to_string()));
                    }
                    Some(Err(e)) => return LinkExit::Lost(e.to_string()),
                    None => return LinkExit::Lost("server closed the connection".to_string()),
                },
                _ = sleep_until(deadline) => {
                    return LinkExit::Lost(format!(
                        "no frames received for {:.1}s",
                        heartbeat.as_secs_f64()
                    ));
                }
            }
        }
    }

    async fn reconnect(&self) -> ReconnectOutcome {
        let mut backoff = Backoff::new(self.settings.reconnect.clone());
        loop {
            let Some(delay) = backoff.next_delay() else {
                warn!("Giving up after {} reconnect attempts", backoff.attempt());
                return ReconnectOutcome::GaveUp;
            };
            info!(
                "Reconnect attempt {} in {:.1}s",
                backoff.attempt(),
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = sleep(delay) => {}
            }

            self.state.set(ConnectionState::Connecting);
            let progress = self.state.clone();
            let handshake = establish(&self.address, &self.hello, move |s| progress.set(s));
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                result = timeout(self.settings.handshake_timeout, handshake) => result,
            };
            if !matches!(attempt, Ok(Ok(_))) {
                self.state.set(ConnectionState::Reconnecting);
            }

            match attempt {
                Ok(Ok((transport, buffered))) => {
                    info!("Reconnected after {} attempts", backoff.attempt());
                    return ReconnectOutcome::Established {
                        transport,
                        buffered,
                        attempts: backoff.attempt(),
                    };
                }
                Ok(Err(ConnectError::Rejected { reason })) => {
                    error!("Server refused the reconnect: {}", reason);
                    let _ = self.events.send(ConnectionEvent::HandshakeRejected(reason));
                    return ReconnectOutcome::GaveUp;
                }
                Ok(Err(e)) => warn!("Reconnect attempt {} failed: {}", backoff.attempt(), e),
                Err(_) => warn!("Reconnect attempt {} timed out", backoff.attempt()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ChatMessage, ErrorMessage, PlayState, RosterEntry, RosterListing, StateMessage,
    };
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    type ServerSide = Framed<TcpStream, EnvelopeCodec>;

    fn settings(reconnect: ReconnectPolicy) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect,
        }
    }

    fn fast_reconnect() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
            max_attempts: Some(5),
            ..ReconnectPolicy::default()
        }
    }

    async fn listen() -> (TcpListener, ServerAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = ServerAddress {
            host: "127.0.0.1".to_string(),
            port,
            use_tls: false,
        };
        (listener, address)
    }

    async fn recv(server: &mut ServerSide) -> Envelope {
        server.next().await.unwrap().unwrap().unwrap()
    }

    fn roster() -> Envelope {
        let mut room = HashMap::new();
        room.insert("alice".to_string(), RosterEntry::default());
        let mut listing: RosterListing = HashMap::new();
        listing.insert("lobby".to_string(), room);
        Envelope::List(Some(listing))
    }

    /// Accept one client and walk it through the handshake
    async fn accept_session(listener: &TcpListener) -> ServerSide {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = Framed::new(stream, EnvelopeCodec::new());
        let Envelope::Hello(hello) = recv(&mut server).await else {
            panic!("expected Hello first");
        };
        assert_eq!(hello.username, "alice");
        server
            .send(Envelope::Hello(HelloMessage {
                motd: Some("welcome".into()),
                ..hello
            }))
            .await
            .unwrap();
        assert_eq!(recv(&mut server).await, Envelope::list_request());
        server.send(roster()).await.unwrap();
        server
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, mut pred: F) -> Vec<ConnectionEvent>
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return;
                }
            }
        })
        .await
        .expect("event did not arrive in time");
        seen
    }

    fn identity() -> SessionIdentity {
        SessionIdentity::new("alice", "lobby")
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (listener, address) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept_session(&listener).await;
            recv(&mut server).await
        });

        let (manager, mut events) = ConnectionManager::new(settings(ReconnectPolicy::disabled()));
        manager.connect(&identity(), &address).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);

        let seen = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Frame(Envelope::List(_)))).await;
        let states: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::Synchronizing,
                ConnectionState::Ready
            ]
        );
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Frame(Envelope::Hello(h)) if h.motd.as_deref() == Some("welcome"))));

        manager.send(Envelope::chat("hi")).unwrap();
        assert_eq!(server.await.unwrap(), Envelope::Chat(ChatMessage::Text("hi".into())));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_hello_fails_connect() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = Framed::new(stream, EnvelopeCodec::new());
            let _hello = recv(&mut server).await;
            server
                .send(Envelope::Error(ErrorMessage {
                    message: "Wrong password supplied".into(),
                }))
                .await
                .unwrap();
        });

        let (manager, _events) = ConnectionManager::new(settings(fast_reconnect()));
        let err = manager.connect(&identity(), &address).await.unwrap_err();
        assert!(matches!(err, ConnectError::Rejected { ref reason } if reason.contains("password")));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_tls_refusal_continues_plain() {
        let (listener, mut address) = listen().await;
        address.use_tls = true;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = Framed::new(stream, EnvelopeCodec::new());
            assert_eq!(recv(&mut server).await, Envelope::start_tls());
            server
                .send(Envelope::Tls(TlsMessage {
                    start_tls: StartTls::Refused,
                }))
                .await
                .unwrap();
            let Envelope::Hello(hello) = recv(&mut server).await else {
                panic!("expected Hello after TLS refusal");
            };
            server.send(Envelope::Hello(hello)).await.unwrap();
            let _list = recv(&mut server).await;
            server.send(roster()).await.unwrap();
            // Keep the socket open until the client hangs up
            let _ = server.next().await;
        });

        let (manager, _events) = ConnectionManager::new(settings(ReconnectPolicy::disabled()));
        manager.connect(&identity(), &address).await.unwrap();
        assert!(manager.is_ready());
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let first = accept_session(&listener).await;
            drop(first);
            let mut second = accept_session(&listener).await;
            let _ = second.next().await;
        });

        let (manager, mut events) = ConnectionManager::new(settings(fast_reconnect()));
        manager.connect(&identity(), &address).await.unwrap();

        let seen = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Reconnected { .. })).await;
        assert!(seen.iter().any(|e| matches!(e, ConnectionEvent::TransportLost(_))));
        assert!(seen
            .iter()
            .any(|e| *e == ConnectionEvent::StateChanged(ConnectionState::Reconnecting)));
        assert_eq!(manager.state(), ConnectionState::Ready);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_reports_handshake_progress() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let first = accept_session(&listener).await;
            drop(first);
            // One refused attempt before the server is back
            let (refused, _) = listener.accept().await.unwrap();
            drop(refused);
            let mut second = accept_session(&listener).await;
            let _ = second.next().await;
        });

        let (manager, mut events) = ConnectionManager::new(settings(fast_reconnect()));
        manager.connect(&identity(), &address).await.unwrap();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::TransportLost(_))).await;

        let seen = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Reconnected { .. })).await;
        let states: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(states.first(), Some(&ConnectionState::Reconnecting));
        assert_eq!(
            states[states.len() - 4..],
            [
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
                ConnectionState::Synchronizing,
                ConnectionState::Ready
            ]
        );
        // The refused attempt falls back to Reconnecting before retrying
        assert!(states
            .windows(2)
            .any(|w| w == [ConnectionState::Connecting, ConnectionState::Reconnecting]
                || w == [ConnectionState::Authenticating, ConnectionState::Reconnecting]));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Reconnected { attempts } if *attempts >= 2)));

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_drop_without_reconnect_fails() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let first = accept_session(&listener).await;
            drop(first);
        });

        let (manager, mut events) = ConnectionManager::new(settings(ReconnectPolicy::disabled()));
        manager.connect(&identity(), &address).await.unwrap();
        wait_for(&mut events, |e| {
            *e == ConnectionEvent::StateChanged(ConnectionState::Failed)
        })
        .await;
        assert_eq!(manager.send(Envelope::chat("late")), Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_silence_counts_as_transport_error() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let mut server = accept_session(&listener).await;
            // Read but never answer
            while server.next().await.is_some() {}
        });

        let mut config = settings(ReconnectPolicy::disabled());
        config.heartbeat_timeout = Duration::from_millis(200);
        let (manager, mut events) = ConnectionManager::new(config);
        manager.connect(&identity(), &address).await.unwrap();

        let seen = wait_for(&mut events, |e| {
            *e == ConnectionEvent::StateChanged(ConnectionState::Failed)
        })
        .await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::TransportLost(r) if r.contains("no frames"))));
    }

    #[tokio::test]
    async fn test_error_after_ready_is_fatal() {
        let (listener, address) = listen().await;
        tokio::spawn(async move {
            let mut server = accept_session(&listener).await;
            server
                .send(Envelope::State(StateMessage {
                    playstate: Some(PlayState {
                        position: 1.0,
                        paused: true,
                        do_seek: None,
                        set_by: None,
                    }),
                    ..Default::default()
                }))
                .await
                .unwrap();
            server
                .send(Envelope::Error(ErrorMessage {
                    message: "You have been kicked".into(),
                }))
                .await
                .unwrap();
            let _ = server.next().await;
        });

        let (manager, mut events) = ConnectionManager::new(settings(fast_reconnect()));
        manager.connect(&identity(), &address).await.unwrap();
        let seen = wait_for(&mut events, |e| {
            *e == ConnectionEvent::StateChanged(ConnectionState::Failed)
        })
        .await;
        assert!(seen.iter().any(|e| matches!(e, ConnectionEvent::Frame(Envelope::Error(_)))));
        assert!(!seen
            .iter()
            .any(|e| *e == ConnectionEvent::StateChanged(ConnectionState::Reconnecting)));
    }

    #[tokio::test]
    async fn test_send_and_disconnect_when_idle() {
        let (manager, _events) = ConnectionManager::new(ConnectionSettings::default());
        assert_eq!(
            manager.send(Envelope::Set(Default::default())),
            Err(SendError::NotConnected)
        );
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let (listener, address) = listen().await;
        drop(listener);
        let (manager, _events) = ConnectionManager::new(settings(ReconnectPolicy::disabled()));
        let err = manager.connect(&identity(), &address).await.unwrap_err();
        assert!(matches!(err, ConnectError::Io(_)));
        assert_eq!(manager.state(), ConnectionState::Failed);

        let invalid = SessionIdentity::new("", "lobby");
        assert!(matches!(
            manager.connect(&invalid, &address).await,
            Err(ConnectError::InvalidIdentity(_))
        ));
    }
}
