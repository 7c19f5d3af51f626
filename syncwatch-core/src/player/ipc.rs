//! Player control channel task
//!
//! A single task owns the channel. Commands reach it through one queue, get
//! a fresh request id, and wait in a pending map until the matching reply
//! arrives or their deadline passes. The player's dialect is left to a
//! [`PlayerBackend`]; property values and lifecycle notices it decodes are
//! folded into the shared [`PlayerStatus`] and republished as
//! [`PlayerEvent`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::backend::{Completion, Inbound, PlayerBackend};
use super::commands::{PlayerCommand, PlayerStatus};
use super::{PlayerError, PlayerEvent};

/// Longest line accepted from the player
const MAX_LINE_LEN: usize = 1024 * 1024;

pub(crate) type Reply = oneshot::Sender<Result<Option<Value>, PlayerError>>;

pub(crate) enum LinkMessage {
    Command {
        command: PlayerCommand,
        /// `None` for fire-and-forget commands
        reply: Option<Reply>,
    },
    /// Signal once every in-flight command has been answered or timed out
    Flush(oneshot::Sender<()>),
    /// Like `Flush`, but stop accepting commands and close afterwards
    Drain(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub command_timeout: Duration,
    pub max_consecutive_timeouts: u32,
}

/// What a link shares with the controller that spawned it
#[derive(Clone)]
pub(crate) struct LinkShared {
    pub status: Arc<RwLock<PlayerStatus>>,
    pub events: mpsc::UnboundedSender<PlayerEvent>,
    /// Notified when a link ends
    pub closed: Arc<Notify>,
    /// Bumped for every new link; only the newest may reset `status`
    pub generation: Arc<AtomicU64>,
}

pub(crate) struct LinkHandle {
    pub tx: mpsc::UnboundedSender<LinkMessage>,
    pub task: JoinHandle<()>,
}

/// Start the task that owns `stream`
pub(crate) fn spawn_link<S>(
    stream: S,
    backend: Box<dyn PlayerBackend>,
    settings: LinkSettings,
    shared: LinkShared,
) -> LinkHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let writer = FramedWrite::new(write_half, LinesCodec::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let closed = shared.closed.clone();

    let link = Link {
        backend,
        settings,
        shared,
        generation,
        pending: HashMap::new(),
        next_id: 1,
        consecutive_timeouts: 0,
    };
    let task = tokio::spawn(async move {
        link.run(reader, writer, rx).await;
        closed.notify_one();
    });
    LinkHandle { tx, task }
}

struct Pending {
    command: &'static str,
    reply: Option<Reply>,
    deadline: Instant,
}

enum LinkExit {
    /// The channel itself failed or closed
    Closed(String),
    /// The controller dropped its end
    Dropped,
    Drained,
    Unresponsive(u32),
}

struct Link {
    backend: Box<dyn PlayerBackend>,
    settings: LinkSettings,
    shared: LinkShared,
    generation: u64,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    consecutive_timeouts: u32,
}

impl Link {
    async fn run<R, W>(
        mut self,
        mut reader: FramedRead<R, LinesCodec>,
        mut writer: FramedWrite<W, LinesCodec>,
        mut rx: mpsc::UnboundedReceiver<LinkMessage>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut flush_waiters: Vec<oneshot::Sender<()>> = Vec::new();
        let mut closing = false;
        let poll_every = self.backend.poll_interval();
        let mut poll = interval(poll_every.unwrap_or(Duration::from_secs(3600)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            if self.pending.is_empty() && !flush_waiters.is_empty() {
                for waiter in flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if closing {
                    break LinkExit::Drained;
                }
            }
            let next_deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                biased;
                message = rx.recv(), if !closing => match message {
                    None => break LinkExit::Dropped,
                    Some(LinkMessage::Command { command, reply }) => {
                        if let Err(e) = self.submit(&mut writer, command, reply).await {
                            break LinkExit::Closed(e);
                        }
                    }
                    Some(LinkMessage::Flush(done)) => flush_waiters.push(done),
                    Some(LinkMessage::Drain(done)) => {
                        debug!("Player link draining {} in-flight command(s)", self.pending.len());
                        flush_waiters.push(done);
                        closing = true;
                    }
                },
                line = reader.next() => match line {
                    Some(Ok(line)) => self.handle_line(&line),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("Dropping oversized line from the player");
                    }
                    Some(Err(LinesCodecError::Io(e))) => break LinkExit::Closed(e.to_string()),
                    None => break LinkExit::Closed("player closed the control channel".to_string()),
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.expire(Instant::now());
                    if self.consecutive_timeouts >= self.settings.max_consecutive_timeouts {
                        break LinkExit::Unresponsive(self.consecutive_timeouts);
                    }
                }
                _ = poll.tick(), if poll_every.is_some() && !closing => {
                    if let Err(e) = self.poll(&mut writer).await {
                        break LinkExit::Closed(e);
                    }
                }
            }
        };

        for (id, pending) in self.pending.drain() {
            debug!("Failing request {} ({}) on link close", id, pending.command);
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(PlayerError::Unavailable));
            }
        }
        // A replaced link must not wipe its successor's status
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            *self.shared.status.write() = PlayerStatus::default();
        }

        let events = &self.shared.events;
        match exit {
            LinkExit::Closed(reason) => {
                info!("Player link closed: {}", reason);
                let _ = events.send(PlayerEvent::Disconnected(reason));
            }
            LinkExit::Unresponsive(timeouts) => {
                warn!("Player unresponsive after {} timeouts, dropping the link", timeouts);
                let _ = events.send(PlayerEvent::Unresponsive { timeouts });
                let _ = events.send(PlayerEvent::Disconnected("player stopped responding".to_string()));
            }
            LinkExit::Drained => debug!("Player link drained"),
            LinkExit::Dropped => debug!("Player link released"),
        }
    }

    async fn submit<W>(
        &mut self,
        writer: &mut FramedWrite<W, LinesCodec>,
        command: PlayerCommand,
        reply: Option<Reply>,
    ) -> Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.next_id;
        self.next_id += 1;

        let status = self.shared.status.read().clone();
        let outbound = self.backend.encode(&command, id, &status);
        for line in outbound.lines {
            debug!("Player << {}", line);
            if let Err(e) = writer.send(line).await {
                self.backend.forget(id);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(PlayerError::Unavailable));
                }
                return Err(format!("failed to write {}: {}", command.name(), e));
            }
        }
        if let Some(event) = outbound.echo {
            let _ = self.shared.events.send(event);
        }

        match outbound.completion {
            Completion::Immediate(result) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(result));
                }
            }
            Completion::AwaitReply => {
                self.pending.insert(
                    id,
                    Pending {
                        command: command.name(),
                        reply,
                        deadline: Instant::now() + self.settings.command_timeout,
                    },
                );
            }
        }
        Ok(())
    }

    /// Query the properties a push-less player cannot report on its own
    async fn poll<W>(&mut self, writer: &mut FramedWrite<W, LinesCodec>) -> Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        let unanswered = self
            .pending
            .values()
            .any(|p| p.reply.is_none() && p.command == "get_property");
        if unanswered {
            debug!("Previous poll still unanswered");
            return Ok(());
        }
        for property in self.backend.polled_properties() {
            self.submit(writer, PlayerCommand::GetProperty(*property), None).await?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) {
        debug!("Player >> {}", line);
        for inbound in self.backend.decode(line) {
            match inbound {
                Inbound::Reply { request_id, result } => self.resolve(request_id, result),
                Inbound::Unmatched => debug!("Ignoring reply without request id"),
                Inbound::Property { property, value } => {
                    let status = {
                        let mut status = self.shared.status.write();
                        status.apply(property, &value);
                        status.clone()
                    };
                    let _ = self
                        .shared
                        .events
                        .send(PlayerEvent::PropertyChanged { property, status });
                }
                Inbound::Event(event) => {
                    let _ = self.shared.events.send(event);
                }
            }
        }
    }

    fn resolve(&mut self, id: u64, result: Result<Option<Value>, PlayerError>) {
        let Some(pending) = self.pending.remove(&id) else {
            warn!("Dropping response for unknown request {}", id);
            return;
        };
        self.consecutive_timeouts = 0;
        match pending.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Player {} failed: {}", pending.command, e);
                }
            }
        }
    }

    /// Fail every request whose deadline has passed
    fn expire(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                self.backend.forget(id);
                self.consecutive_timeouts += 1;
                warn!(
                    "Player {} (request {}) timed out ({} in a row)",
                    pending.command, id, self.consecutive_timeouts
                );
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Err(PlayerError::Timeout(self.settings.command_timeout)));
                }
            }
        }
    }
}
