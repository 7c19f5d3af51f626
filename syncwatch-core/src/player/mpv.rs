//! mpv JSON IPC
//!
//! One JSON object per line in each direction. Requests carry a numeric
//! `request_id` that the player echoes on its response; unsolicited events
//! carry an `event` name instead. mpv.net and IINA speak the same protocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::backend::{Inbound, Outbound, PlayerBackend, PlayerKind};
use super::commands::{EndFileReason, ObservedProperty, PlayerCommand, PlayerStatus};
use super::{PlayerError, PlayerEvent};

/// `error` value of a successful response
pub const SUCCESS: &str = "success";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MpvRequest {
    pub command: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MpvResponse {
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl MpvResponse {
    pub fn is_success(&self) -> bool {
        self.error == SUCCESS
    }
}

/// Unsolicited notification
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MpvNotice {
    pub event: String,
    /// Observation id for `property-change`
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    /// `end-file` reason
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub file_error: Option<String>,
}

/// Events are tried first since every field of a response is optional
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MpvMessage {
    Event(MpvNotice),
    Response(MpvResponse),
}

pub fn command_args(command: &PlayerCommand) -> Vec<Value> {
    match command {
        PlayerCommand::LoadFile(path) => vec![json!("loadfile"), json!(path), json!("replace")],
        PlayerCommand::Seek(position) => vec![json!("seek"), json!(position), json!("absolute")],
        PlayerCommand::SetPaused(paused) => vec![json!("set_property"), json!("pause"), json!(paused)],
        PlayerCommand::SetSpeed(speed) => vec![json!("set_property"), json!("speed"), json!(speed)],
        PlayerCommand::GetProperty(property) => vec![json!("get_property"), json!(property.name())],
        PlayerCommand::Observe(property) => {
            vec![json!("observe_property"), json!(property.id()), json!(property.name())]
        }
        PlayerCommand::ShowText { text, duration_ms } => {
            vec![json!("show_text"), json!(text), json!(duration_ms)]
        }
    }
}

pub struct MpvBackend {
    kind: PlayerKind,
}

impl MpvBackend {
    pub fn new(kind: PlayerKind) -> Self {
        Self { kind }
    }

    fn notice(notice: MpvNotice) -> Option<Inbound> {
        let event = match notice.event.as_str() {
            "property-change" => {
                let Some(property) = notice.id.and_then(ObservedProperty::from_id) else {
                    debug!("Ignoring change of unobserved property {:?}", notice.name);
                    return None;
                };
                return Some(Inbound::Property {
                    property,
                    value: notice.data.unwrap_or(Value::Null),
                });
            }
            "file-loaded" => PlayerEvent::FileLoaded,
            "seek" => PlayerEvent::Seeked,
            "end-file" => match EndFileReason::parse(notice.reason.as_deref()) {
                EndFileReason::Error => PlayerEvent::PlaybackError(
                    notice.file_error.unwrap_or_else(|| "playback failed".to_string()),
                ),
                reason => PlayerEvent::EndOfFile(reason),
            },
            "shutdown" => PlayerEvent::Shutdown,
            other => {
                debug!("Ignoring player event {}", other);
                return None;
            }
        };
        Some(Inbound::Event(event))
    }
}

impl PlayerBackend for MpvBackend {
    fn kind(&self) -> PlayerKind {
        self.kind
    }

    fn encode(&mut self, command: &PlayerCommand, request_id: u64, _status: &PlayerStatus) -> Outbound {
        let request = MpvRequest {
            command: command_args(command),
            request_id: Some(request_id),
        };
        match serde_json::to_string(&request) {
            Ok(line) => Outbound::request(line),
            Err(e) => {
                warn!("Cannot encode {}: {}", command.name(), e);
                Outbound::none()
            }
        }
    }

    fn decode(&mut self, line: &str) -> Vec<Inbound> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<MpvMessage>(line) {
            Ok(MpvMessage::Response(response)) => {
                let Some(request_id) = response.request_id else {
                    return vec![Inbound::Unmatched];
                };
                let result = if response.is_success() {
                    Ok(response.data)
                } else {
                    Err(PlayerError::Command(response.error))
                };
                vec![Inbound::Reply { request_id, result }]
            }
            Ok(MpvMessage::Event(notice)) => Self::notice(notice).into_iter().collect(),
            Err(e) => {
                warn!("Unparseable player message ({}): {}", e, line);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::backend::Completion;

    fn decode(line: Value) -> Vec<Inbound> {
        MpvBackend::new(PlayerKind::Mpv).decode(&line.to_string())
    }

    #[test]
    fn test_request_shape() {
        let mut backend = MpvBackend::new(PlayerKind::Mpv);
        let out = backend.encode(&PlayerCommand::Seek(12.5), 7, &PlayerStatus::default());
        assert_eq!(out.completion, Completion::AwaitReply);
        let sent: Value = serde_json::from_str(&out.lines[0]).unwrap();
        assert_eq!(sent, json!({"command": ["seek", 12.5, "absolute"], "request_id": 7}));
        assert_eq!(
            command_args(&PlayerCommand::Observe(ObservedProperty::FileSize)),
            vec![json!("observe_property"), json!(6), json!("file-size")]
        );
    }

    #[test]
    fn test_replies_and_errors() {
        assert_eq!(
            decode(json!({"request_id": 3, "error": "success", "data": 1.5})),
            vec![Inbound::Reply {
                request_id: 3,
                result: Ok(Some(json!(1.5)))
            }]
        );
        assert_eq!(
            decode(json!({"request_id": 4, "error": "property unavailable"})),
            vec![Inbound::Reply {
                request_id: 4,
                result: Err(PlayerError::Command("property unavailable".into()))
            }]
        );
        assert_eq!(decode(json!({"error": "success"})), vec![Inbound::Unmatched]);
    }

    #[test]
    fn test_notices() {
        assert_eq!(
            decode(json!({"event": "property-change", "id": 2, "name": "pause", "data": true})),
            vec![Inbound::Property {
                property: ObservedProperty::Pause,
                value: json!(true)
            }]
        );
        assert_eq!(
            decode(json!({"event": "end-file", "reason": "error", "file_error": "unrecognized file format"})),
            vec![Inbound::Event(PlayerEvent::PlaybackError("unrecognized file format".into()))]
        );
        assert_eq!(
            decode(json!({"event": "seek"})),
            vec![Inbound::Event(PlayerEvent::Seeked)]
        );
        assert!(decode(json!({"event": "property-change", "id": 99, "data": 1})).is_empty());
        assert!(decode(json!({"event": "audio-reconfig"})).is_empty());
    }
}
