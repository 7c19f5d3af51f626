//! Chat history and chat commands
//!
//! Input starting with [`COMMAND_PREFIX`] is a command, never chat text.
//! Recognized commands are returned to the caller for dispatch; anything
//! else with the prefix becomes an error record.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::session::SessionState;

/// Records kept before the oldest is evicted
pub const CHAT_HISTORY_CAP: usize = 1000;

pub const COMMAND_PREFIX: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    User,
    System,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub timestamp: DateTime<Utc>,
    /// Absent for system and error records
    pub username: Option<String>,
    pub text: String,
    pub kind: ChatKind,
}

impl ChatRecord {
    pub fn user(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            username: Some(username.into()),
            text: text.into(),
            kind: ChatKind::User,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            username: None,
            text: text.into(),
            kind: ChatKind::System,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            username: None,
            text: text.into(),
            kind: ChatKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Room(String),
    List,
    Help,
    Ready,
    Unready,
}

/// Result of classifying one line of user input
#[derive(Debug, Clone, PartialEq)]
pub enum ChatInput {
    Empty,
    /// Plain text to send to the room
    Message(String),
    Command(ChatCommand),
    /// Bad command; the record has already been appended
    Rejected(ChatRecord),
}

const HELP: &[(&str, &str)] = &[
    ("/room <name>, /r <name>", "switch to another room"),
    ("/list, /l", "show who is in the room"),
    ("/help, /h, /?", "show this help"),
    ("/ready", "mark yourself ready"),
    ("/unready", "mark yourself not ready"),
];

pub fn help_text() -> String {
    let mut text = String::from("Available commands:");
    for (usage, what) in HELP {
        text.push_str(&format!("\n  {} - {}", usage, what));
    }
    text
}

/// Parse a command line (without deciding anything about plain text)
fn parse_command(line: &str) -> Result<ChatCommand, String> {
    let body = line.strip_prefix(COMMAND_PREFIX).unwrap_or(line);
    let (name, arg) = match body.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (body, ""),
    };

    match name.to_lowercase().as_str() {
        "room" | "r" => {
            if arg.is_empty() {
                Err("/room needs a room name".to_string())
            } else {
                Ok(ChatCommand::Room(arg.to_string()))
            }
        }
        "list" | "l" => Ok(ChatCommand::List),
        "help" | "h" | "?" => Ok(ChatCommand::Help),
        "ready" => Ok(ChatCommand::Ready),
        "unready" => Ok(ChatCommand::Unready),
        other => Err(format!("Unknown command /{} (try /help)", other)),
    }
}

/// One-record roster summary for `/list`
pub fn roster_summary(state: &SessionState) -> String {
    let members = state.room_members(state.room());
    let mut text = format!("In room '{}' ({}):", state.room(), members.len());
    for member in members {
        let mut line = format!("\n  {}", member.username);
        if member.controller {
            line.push_str(" [controller]");
        }
        match member.is_ready {
            Some(true) => line.push_str(" (ready)"),
            Some(false) => line.push_str(" (not ready)"),
            None => {}
        }
        match &member.file {
            Some(file) => line.push_str(&format!(" - {}", file.name)),
            None => line.push_str(" - no file"),
        }
        text.push_str(&line);
    }
    text
}

/// Bounded chat history
#[derive(Debug)]
pub struct ChatManager {
    history: RwLock<VecDeque<ChatRecord>>,
    cap: usize,
}

impl ChatManager {
    pub fn new() -> Self {
        Self::with_capacity(CHAT_HISTORY_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(cap.min(64))),
            cap: cap.max(1),
        }
    }

    /// Append, evicting the oldest record when full
    pub fn push(&self, record: ChatRecord) -> ChatRecord {
        let mut history = self.history.write();
        while history.len() >= self.cap {
            history.pop_front();
        }
        history.push_back(record.clone());
        record
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }

    /// Newest `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<ChatRecord> {
        let history = self.history.read();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.history.write().clear();
    }

    /// Decide what a line of user input is. Rejected commands are recorded
    /// here; everything else is left to the caller.
    pub fn classify(&self, input: &str) -> ChatInput {
        let line = input.trim();
        if line.is_empty() {
            return ChatInput::Empty;
        }
        if !line.starts_with(COMMAND_PREFIX) {
            return ChatInput::Message(line.to_string());
        }
        match parse_command(line) {
            Ok(command) => {
                debug!("Chat command: {:?}", command);
                ChatInput::Command(command)
            }
            Err(reason) => ChatInput::Rejected(self.push(ChatRecord::error(reason))),
        }
    }
}

impl Default for ChatManager {
    fn default() -> Self {
        Self::new()
    }
}
