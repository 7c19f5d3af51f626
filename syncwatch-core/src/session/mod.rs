//! Session State: the client's single view of the shared session

pub mod model;
pub mod shared;
pub mod state;
pub mod transition;

pub use model::{privacy_hash, FileFingerprint, Member, PlaybackFact, SessionIdentity};
pub use shared::SharedSession;
pub use state::{GlobalPlayback, IgnoreCounters, SessionPolicy, SessionState, StateInvariantViolation};
pub use transition::{ChangeSet, MemberUpdate, Transition};
