//! Synchronization between the local player and the room

pub mod engine;

pub use engine::{LocalView, RemoteView, SyncAction, SyncEngine, SyncInput, SyncThresholds};
