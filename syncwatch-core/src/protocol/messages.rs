//! Wire messages
//!
//! Every frame is one JSON object with exactly one key naming the message
//! kind, for example `{"Hello": {...}}`. The enum below is externally tagged
//! so serde produces and consumes that shape directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version announced in `Hello`
pub const PROTOCOL_VERSION: &str = "1.2.255";

/// Client release announced as `realversion`
pub const CLIENT_VERSION: &str = "1.7.3";

/// Message kinds the decoder accepts
pub const KNOWN_KINDS: &[&str] = &["Hello", "Set", "State", "List", "Chat", "Error", "TLS"];

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    Hello(HelloMessage),
    Set(SetMessage),
    State(StateMessage),
    /// `null` is the client's roster request; servers answer with the listing
    List(Option<RosterListing>),
    Chat(ChatMessage),
    Error(ErrorMessage),
    #[serde(rename = "TLS")]
    Tls(TlsMessage),
}

impl Envelope {
    /// The top-level key this envelope is encoded under
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "Hello",
            Envelope::Set(_) => "Set",
            Envelope::State(_) => "State",
            Envelope::List(_) => "List",
            Envelope::Chat(_) => "Chat",
            Envelope::Error(_) => "Error",
            Envelope::Tls(_) => "TLS",
        }
    }

    pub fn list_request() -> Self {
        Envelope::List(None)
    }

    pub fn start_tls() -> Self {
        Envelope::Tls(TlsMessage {
            start_tls: StartTls::Send,
        })
    }

    /// Outbound chat is sent as bare text; the server attaches the username
    pub fn chat(text: impl Into<String>) -> Self {
        Envelope::Chat(ChatMessage::Text(text.into()))
    }

    pub fn set(set: SetMessage) -> Self {
        Envelope::Set(set)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub room: RoomInfo,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realversion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl RoomInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }
}

/// Feature flags exchanged in `Hello` and `Set`. Servers add keys of their
/// own; unknown keys are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_playlists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_rooms: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_list: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_chat_message_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_username_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_room_name_length: Option<usize>,
}

impl Features {
    /// What this client supports
    pub fn client() -> Self {
        Self {
            shared_playlists: Some(true),
            chat: Some(true),
            readiness: Some(true),
            managed_rooms: Some(true),
            feature_list: Some(true),
            ..Default::default()
        }
    }
}

/// Partial update; every sub-field is optional and absent ones are omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<HashMap<String, UserUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadyState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_index: Option<PlaylistIndexUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_change: Option<PlaylistChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_auth: Option<ControllerAuth>,
    /// Playstate pushed through `Set` instead of `State`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PlayState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

/// File size is a byte count, or a hash string when the sender redacts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSize {
    Bytes(u64),
    Redacted(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<FileSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<UserEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
    /// Servers attach extra details (e.g. the joiner's version)
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manually_initiated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
}

/// `index: null` clears the selection, so it is always encoded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistIndexUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playstate: Option<PlayState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignoring_on_the_fly: Option<IgnoringOnTheFly>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayState {
    /// Seconds
    pub position: f64,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_seek: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
}

/// Latency probes. Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_calculation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_latency_calculation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_rtt: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoringOnTheFly {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<u32>,
}

/// room name -> username -> entry
pub type RosterListing = HashMap<String, HashMap<String, RosterEntry>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

/// Inbound chat carries the sender; outbound chat is a bare string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatMessage {
    Entry { username: String, message: String },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Coarse classification of server error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerErrorKind {
    TlsUnsupported,
    BadPassword,
    VersionMismatch,
    Other,
}

impl ErrorMessage {
    pub fn kind(&self) -> ServerErrorKind {
        let lower = self.message.to_lowercase();
        if lower.contains("starttls") {
            ServerErrorKind::TlsUnsupported
        } else if lower.contains("password") {
            ServerErrorKind::BadPassword
        } else if lower.contains("version") {
            ServerErrorKind::VersionMismatch
        } else {
            ServerErrorKind::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTls {
    #[serde(rename = "send")]
    Send,
    #[serde(rename = "true")]
    Accepted,
    #[serde(rename = "false")]
    Refused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsMessage {
    #[serde(rename = "startTLS")]
    pub start_tls: StartTls,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_omits_absent_fields() {
        let hello = Envelope::Hello(HelloMessage {
            username: "alice".into(),
            password: None,
            room: RoomInfo::named("lobby"),
            version: PROTOCOL_VERSION.into(),
            realversion: None,
            features: None,
            motd: None,
        });
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(
            value,
            json!({"Hello": {"username": "alice", "room": {"name": "lobby"}, "version": PROTOCOL_VERSION}})
        );
    }

    #[test]
    fn test_list_request_is_null() {
        let value = serde_json::to_value(Envelope::list_request()).unwrap();
        assert_eq!(value, json!({"List": null}));
    }

    #[test]
    fn test_set_user_map_decodes() {
        let raw = json!({"Set": {"user": {"bob": {
            "room": {"name": "lobby"},
            "event": {"joined": true, "version": "1.7.0"}
        }}}});
        let env: Envelope = serde_json::from_value(raw).unwrap();
        let Envelope::Set(set) = env else {
            panic!("expected Set");
        };
        let bob = &set.user.unwrap()["bob"];
        assert_eq!(bob.room.as_ref().unwrap().name, "lobby");
        let event = bob.event.as_ref().unwrap();
        assert_eq!(event.joined, Some(true));
        assert_eq!(event.extra.get("version"), Some(&json!("1.7.0")));
    }

    #[test]
    fn test_playlist_index_keeps_null() {
        let set = SetMessage {
            playlist_index: Some(PlaylistIndexUpdate {
                user: None,
                index: None,
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(Envelope::set(set)).unwrap();
        assert_eq!(value, json!({"Set": {"playlistIndex": {"index": null}}}));
    }

    #[test]
    fn test_chat_shapes() {
        let inbound: Envelope =
            serde_json::from_value(json!({"Chat": {"username": "bob", "message": "hi"}})).unwrap();
        assert_eq!(
            inbound,
            Envelope::Chat(ChatMessage::Entry {
                username: "bob".into(),
                message: "hi".into()
            })
        );
        assert_eq!(
            serde_json::to_value(Envelope::chat("hello")).unwrap(),
            json!({"Chat": "hello"})
        );
    }

    #[test]
    fn test_redacted_size() {
        let info: FileInfo =
            serde_json::from_value(json!({"name": "abc", "size": "0f1e2d3c4b5a"})).unwrap();
        assert_eq!(info.size, Some(FileSize::Redacted("0f1e2d3c4b5a".into())));
        let info: FileInfo = serde_json::from_value(json!({"size": 1024})).unwrap();
        assert_eq!(info.size, Some(FileSize::Bytes(1024)));
    }

    #[test]
    fn test_error_kind() {
        let kind = |m: &str| {
            ErrorMessage {
                message: m.into(),
            }
            .kind()
        };
        assert_eq!(kind("Unknown command startTLS"), ServerErrorKind::TlsUnsupported);
        assert_eq!(kind("Wrong password supplied"), ServerErrorKind::BadPassword);
        assert_eq!(kind("Your version is too old"), ServerErrorKind::VersionMismatch);
        assert_eq!(kind("Room is full"), ServerErrorKind::Other);
    }

    #[test]
    fn test_tls_sentinel() {
        assert_eq!(
            serde_json::to_value(Envelope::start_tls()).unwrap(),
            json!({"TLS": {"startTLS": "send"}})
        );
        let reply: Envelope = serde_json::from_value(json!({"TLS": {"startTLS": "true"}})).unwrap();
        assert_eq!(
            reply,
            Envelope::Tls(TlsMessage {
                start_tls: StartTls::Accepted
            })
        );
    }
}
