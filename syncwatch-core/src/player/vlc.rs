//! VLC remote-control interface (`--extraintf rc`, `--rc-unix=<path>`)
//!
//! Plain-text commands without request ids. Queries such as `get_time` are
//! answered by a bare line, in order, so outstanding queries wait in a FIFO.
//! Status changes arrive as `( state playing )` style lines. VLC pushes no
//! position updates, so the link polls and seeks are inferred from jumps.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::debug;

use super::backend::{Inbound, Outbound, PlayerBackend, PlayerKind};
use super::commands::{ObservedProperty, PlayerCommand, PlayerStatus};
use super::PlayerEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Position drift between polls that counts as a seek
const SEEK_JUMP: f64 = 2.5;

const POLLED: &[ObservedProperty] = &[
    ObservedProperty::TimePos,
    ObservedProperty::Pause,
    ObservedProperty::Duration,
];

struct PositionSample {
    position: f64,
    paused: bool,
    at: Instant,
}

pub struct VlcBackend {
    queries: VecDeque<(u64, ObservedProperty)>,
    file: Option<String>,
    rate: f64,
    paused: bool,
    last_position: Option<PositionSample>,
}

impl VlcBackend {
    pub fn new() -> Self {
        Self {
            queries: VecDeque::new(),
            file: None,
            rate: 1.0,
            paused: true,
            last_position: None,
        }
    }

    fn query(&mut self, request_id: u64, property: ObservedProperty) -> Outbound {
        let line = match property {
            ObservedProperty::TimePos => "get_time",
            ObservedProperty::Duration => "get_length",
            ObservedProperty::Pause => "is_playing",
            ObservedProperty::Filename => return Outbound::answered(json!(self.file)),
            ObservedProperty::Speed => return Outbound::answered(json!(self.rate)),
            ObservedProperty::FileSize => return Outbound::answered(Value::Null),
        };
        self.queries.push_back((request_id, property));
        Outbound::request(line.to_string())
    }

    /// `( state playing )`, `status change: ( new input: file:///a.mkv )`, ...
    fn status_line(&mut self, inner: &str) -> Vec<Inbound> {
        let inner = inner.trim();
        if let Some(uri) = inner.strip_prefix("new input:") {
            let name = file_name_from_uri(uri.trim());
            if self.file.as_deref() == Some(name.as_str()) {
                return Vec::new();
            }
            self.file = Some(name.clone());
            self.last_position = None;
            return vec![
                Inbound::Property {
                    property: ObservedProperty::Filename,
                    value: json!(name),
                },
                Inbound::Event(PlayerEvent::FileLoaded),
            ];
        }
        let paused = match inner
            .strip_prefix("state")
            .or_else(|| inner.strip_prefix("play state:"))
            .or_else(|| inner.strip_prefix("pause state:"))
            .map(str::trim)
        {
            Some("playing") | Some("3") => false,
            Some("paused") | Some("stopped") | Some("4") => true,
            _ => return Vec::new(),
        };
        self.paused = paused;
        vec![Inbound::Property {
            property: ObservedProperty::Pause,
            value: json!(paused),
        }]
    }

    fn answer(&mut self, request_id: u64, property: ObservedProperty, text: &str) -> Vec<Inbound> {
        let value = match property {
            ObservedProperty::TimePos | ObservedProperty::Duration => {
                text.parse::<f64>().map(|v| json!(v)).unwrap_or(Value::Null)
            }
            ObservedProperty::Pause => match text {
                "1" => json!(false),
                "0" => json!(true),
                _ => Value::Null,
            },
            _ => Value::Null,
        };

        let mut out = vec![Inbound::Reply {
            request_id,
            result: Ok(Some(value.clone())),
        }];
        if property == ObservedProperty::Pause {
            if let Some(paused) = value.as_bool() {
                self.paused = paused;
            }
        }
        if property == ObservedProperty::TimePos {
            if let Some(position) = value.as_f64() {
                if self.jumped_to(position) {
                    out.push(Inbound::Event(PlayerEvent::Seeked));
                }
            }
        }
        out.push(Inbound::Property { property, value });
        out
    }

    fn jumped_to(&mut self, position: f64) -> bool {
        let now = Instant::now();
        let jumped = self.last_position.as_ref().is_some_and(|last| {
            let elapsed = if last.paused {
                0.0
            } else {
                now.duration_since(last.at).as_secs_f64() * self.rate
            };
            (position - (last.position + elapsed)).abs() > SEEK_JUMP
        });
        self.last_position = Some(PositionSample {
            position,
            paused: self.paused,
            at: now,
        });
        jumped
    }
}

impl Default for VlcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerBackend for VlcBackend {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Vlc
    }

    fn encode(&mut self, command: &PlayerCommand, request_id: u64, status: &PlayerStatus) -> Outbound {
        match command {
            PlayerCommand::LoadFile(path) => Outbound::fire(format!("add {}", path)),
            PlayerCommand::Seek(position) => {
                let target = position.max(0.0).round();
                self.last_position = Some(PositionSample {
                    position: target,
                    paused: status.paused,
                    at: Instant::now(),
                });
                Outbound::fire(format!("seek {}", target as u64)).with_echo(PlayerEvent::Seeked)
            }
            // `pause` toggles, `play` only resumes
            PlayerCommand::SetPaused(true) if status.paused => Outbound::none(),
            PlayerCommand::SetPaused(true) => Outbound::fire("pause".to_string()),
            PlayerCommand::SetPaused(false) => Outbound::fire("play".to_string()),
            PlayerCommand::SetSpeed(speed) => {
                self.rate = *speed;
                Outbound::fire(format!("rate {}", speed))
            }
            PlayerCommand::GetProperty(property) => self.query(request_id, *property),
            // No observation or on-screen text over rc
            PlayerCommand::Observe(_) | PlayerCommand::ShowText { .. } => Outbound::none(),
        }
    }

    fn decode(&mut self, line: &str) -> Vec<Inbound> {
        let text = line.trim_start_matches(|c: char| c == '>' || c.is_whitespace()).trim_end();
        let text = text.strip_prefix("status change:").map(str::trim).unwrap_or(text);

        if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            return self.status_line(inner);
        }
        if text.starts_with("Unknown command") || text.starts_with("Type 'help'") {
            debug!("vlc: {}", text);
            return Vec::new();
        }
        match self.queries.pop_front() {
            Some((request_id, property)) => self.answer(request_id, property, text),
            None => {
                if !text.is_empty() {
                    debug!("vlc: {}", text);
                }
                Vec::new()
            }
        }
    }

    fn forget(&mut self, request_id: u64) {
        self.queries.retain(|(id, _)| *id != request_id);
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(POLL_INTERVAL)
    }

    fn polled_properties(&self) -> &'static [ObservedProperty] {
        POLLED
    }
}

/// Last path segment of a `file://` URI or plain path, percent-decoded
fn file_name_from_uri(uri: &str) -> String {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    let segment = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    percent_decode(&segment)
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let hex = |b: u8| (b as char).to_digit(16);
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((high * 16 + low) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
