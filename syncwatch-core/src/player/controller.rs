//! Public handle to the local media player

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::PlayerKind;
use super::commands::{ObservedProperty, PlayerCommand, PlayerStatus};
use super::ipc::{spawn_link, LinkHandle, LinkMessage, LinkSettings, LinkShared};
use super::{PlayerError, PlayerEvent};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::network::Backoff;

/// How long an on-screen message stays up
const OSD_DURATION_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub kind: PlayerKind,
    pub socket_path: Option<PathBuf>,
    pub command_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    /// Used by the supervisor when (re)connecting the control channel
    pub reconnect: ReconnectPolicy,
}

impl From<&ClientConfig> for PlayerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            kind: config.player.resolved_kind(),
            socket_path: config.player.socket_path.clone(),
            command_timeout: config.player.command_timeout,
            max_consecutive_timeouts: config.player.max_consecutive_timeouts,
            reconnect: config.reconnect.clone(),
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

struct Inner {
    settings: PlayerSettings,
    link: Mutex<Option<LinkHandle>>,
    shared: LinkShared,
}

/// Cloneable handle; every clone talks to the same control channel
#[derive(Clone)]
pub struct PlayerController {
    inner: Arc<Inner>,
}

impl PlayerController {
    pub fn new(settings: PlayerSettings) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            inner: Arc::new(Inner {
                settings,
                link: Mutex::new(None),
                shared: LinkShared {
                    status: Arc::new(RwLock::new(PlayerStatus::default())),
                    events,
                    closed: Arc::new(Notify::new()),
                    generation: Arc::new(AtomicU64::new(0)),
                },
            }),
        };
        (controller, events_rx)
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.inner.settings
    }

    /// Take over an already-open control channel, replacing any previous one
    #[instrument(skip_all, fields(player = self.inner.settings.kind.display_name()))]
    pub fn attach<S>(&self, stream: S) -> Result<(), PlayerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let backend = self.inner.settings.kind.backend()?;
        let handle = spawn_link(
            stream,
            backend,
            LinkSettings {
                command_timeout: self.inner.settings.command_timeout,
                max_consecutive_timeouts: self.inner.settings.max_consecutive_timeouts.max(1),
            },
            self.inner.shared.clone(),
        );
        for property in ObservedProperty::ALL {
            let _ = handle.tx.send(LinkMessage::Command {
                command: PlayerCommand::Observe(property),
                reply: None,
            });
        }
        if let Some(previous) = self.inner.link.lock().replace(handle) {
            debug!("Replacing existing player link");
            drop(previous.tx);
        }
        let _ = self.inner.shared.events.send(PlayerEvent::Connected);
        Ok(())
    }

    /// Open the configured Unix socket (or named pipe on Windows) and attach it
    #[instrument(skip_all)]
    pub async fn connect_ipc(&self) -> Result<(), PlayerError> {
        let path = self
            .inner
            .settings
            .socket_path
            .clone()
            .ok_or_else(|| PlayerError::Connect("no control socket configured".to_string()))?;
        debug!("Connecting to player at {}", path.display());

        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .map_err(|e| PlayerError::Connect(format!("{}: {}", path.display(), e)))?;

        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&path)
            .map_err(|e| PlayerError::Connect(format!("{}: {}", path.display(), e)))?;

        info!(
            "Connected to {} at {}",
            self.inner.settings.kind.display_name(),
            path.display()
        );
        self.attach(stream)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.tx.is_closed())
    }

    /// Send a command and wait for its response
    pub async fn request(&self, command: PlayerCommand) -> Result<Option<Value>, PlayerError> {
        let tx = match self.inner.link.lock().as_ref() {
            Some(link) if !link.tx.is_closed() => link.tx.clone(),
            _ => return Err(PlayerError::Unavailable),
        };
        let name = command.name();
        let (reply, rx) = oneshot::channel();
        tx.send(LinkMessage::Command {
            command,
            reply: Some(reply),
        })
        .map_err(|_| PlayerError::Unavailable)?;

        let result = rx.await.map_err(|_| PlayerError::Unavailable)?;
        if let Err(e) = &result {
            debug!("Player {} failed: {}", name, e);
        }
        result
    }

    pub async fn load_file(&self, path: &str) -> Result<(), PlayerError> {
        info!("Loading {}", path);
        self.request(PlayerCommand::LoadFile(path.to_string())).await.map(|_| ())
    }

    pub async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        self.request(PlayerCommand::Seek(position.max(0.0))).await.map(|_| ())
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        self.request(PlayerCommand::SetPaused(paused)).await.map(|_| ())
    }

    pub async fn set_speed(&self, speed: f64) -> Result<(), PlayerError> {
        self.request(PlayerCommand::SetSpeed(speed)).await.map(|_| ())
    }

    /// On-screen message
    pub async fn show_text(&self, text: &str) -> Result<(), PlayerError> {
        self.request(PlayerCommand::ShowText {
            text: text.to_string(),
            duration_ms: OSD_DURATION_MS,
        })
        .await
        .map(|_| ())
    }

    /// Ask the player for its current properties. Properties the player
    /// reports as unavailable come back as `None`.
    pub async fn query_status(&self) -> Result<PlayerStatus, PlayerError> {
        let (position, paused, speed, duration, filename, file_size) = tokio::join!(
            self.property(ObservedProperty::TimePos),
            self.property(ObservedProperty::Pause),
            self.property(ObservedProperty::Speed),
            self.property(ObservedProperty::Duration),
            self.property(ObservedProperty::Filename),
            self.property(ObservedProperty::FileSize),
        );

        let mut status = PlayerStatus::default();
        for (property, value) in [
            (ObservedProperty::TimePos, position?),
            (ObservedProperty::Pause, paused?),
            (ObservedProperty::Speed, speed?),
            (ObservedProperty::Duration, duration?),
            (ObservedProperty::Filename, filename?),
            (ObservedProperty::FileSize, file_size?),
        ] {
            status.apply(property, &value);
        }
        *self.inner.shared.status.write() = status.clone();
        Ok(status)
    }

    async fn property(&self, property: ObservedProperty) -> Result<Value, PlayerError> {
        match self.request(PlayerCommand::GetProperty(property)).await {
            Ok(value) => Ok(value.unwrap_or(Value::Null)),
            Err(PlayerError::Command(_)) => Ok(Value::Null),
            Err(e) => Err(e),
        }
    }

    /// Last observed properties, without a round trip
    pub fn observed(&self) -> PlayerStatus {
        self.inner.shared.status.read().clone()
    }

    /// Wait until every in-flight command is resolved; the channel stays open
    pub async fn flush(&self) {
        let tx = match self.inner.link.lock().as_ref() {
            Some(link) => link.tx.clone(),
            None => return,
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(LinkMessage::Flush(done_tx)).is_err() {
            return;
        }
        let limit = self.inner.settings.command_timeout * 2;
        if timeout(limit, done_rx).await.is_err() {
            warn!("Player commands still in flight after {:?}", limit);
        }
    }

    /// Let in-flight commands finish (or time out), then close the channel
    pub async fn drain(&self) {
        let Some(link) = self.inner.link.lock().take() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if link.tx.send(LinkMessage::Drain(done_tx)).is_ok() {
            let limit = self.inner.settings.command_timeout * 2;
            if timeout(limit, done_rx).await.is_err() {
                warn!("Player link did not drain within {:?}", limit);
            }
        }
        drop(link.tx);
        let _ = link.task.await;
    }

    /// Close the channel without waiting for in-flight commands
    pub async fn detach(&self) {
        let Some(link) = self.inner.link.lock().take() else {
            return;
        };
        drop(link.tx);
        let _ = link.task.await;
    }

    /// Keep the control channel connected until `cancel` fires, reconnecting
    /// with backoff whenever it drops.
    pub fn spawn_supervisor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(controller.inner.settings.reconnect.clone());
            loop {
                if !controller.is_connected() {
                    match controller.connect_ipc().await {
                        Ok(()) => backoff.reset(),
                        Err(e) => {
                            let Some(delay) = backoff.next_delay() else {
                                warn!("Giving up on the player after {} attempts", backoff.attempt());
                                let _ = controller.inner.shared.events.send(PlayerEvent::Disconnected(e.to_string()));
                                return;
                            };
                            debug!("Player connect failed ({}), retrying in {:.1}s", e, delay.as_secs_f64());
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = sleep(delay) => continue,
                            }
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = controller.inner.shared.closed.notified() => {
                        debug!("Player link closed, supervisor reconnecting");
                    }
                }
            }
        })
    }
}
