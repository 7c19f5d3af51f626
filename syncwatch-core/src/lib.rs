//! Syncwatch - Core Library
//!
//! Keeps a local media player in step with a shared watch-party room on a
//! Syncplay-compatible server.

pub mod chat;
pub mod client;
pub mod config;
pub mod latency;
pub mod logging;
pub mod network;
pub mod player;
pub mod playlist;
pub mod protocol;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use chat::{ChatKind, ChatRecord};
pub use client::{Advisory, Client, ClientCallback, CoreError};
pub use config::ClientConfig;
pub use logging::init_tracing;
pub use network::ConnectionState;
pub use player::{PlayerController, PlayerKind, PlayerStatus};
pub use playlist::PlaylistState;
pub use session::{Member, SessionIdentity};
