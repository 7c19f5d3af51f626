//! Single serialization point for the session aggregate

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::state::{SessionState, StateInvariantViolation};
use super::transition::{ChangeSet, Transition};

/// Cloneable handle to the one live [`SessionState`]. All writers go through
/// [`SharedSession::apply`]; readers get a consistent view under the lock.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<SessionState>>,
    sync_wakeup: Arc<Notify>,
}

impl SharedSession {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            sync_wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn apply(&self, transition: Transition) -> Result<ChangeSet, StateInvariantViolation> {
        self.apply_and_read(transition, |_| ()).map(|(changes, _)| changes)
    }

    /// Apply and read the resulting state in the same critical section
    pub fn apply_and_read<R>(
        &self,
        transition: Transition,
        read: impl FnOnce(&SessionState) -> R,
    ) -> Result<(ChangeSet, R), StateInvariantViolation> {
        let mut guard = self.inner.lock();
        let (next, changes) = match guard.apply(&transition) {
            Ok(applied) => applied,
            Err(e) => {
                debug!("Rejected {:?}: {}", transition, e);
                return Err(e);
            }
        };
        *guard = next;
        let out = read(&guard);
        drop(guard);

        if changes.needs_sync() {
            self.sync_wakeup.notify_one();
        }
        Ok((changes, out))
    }

    pub fn read<R>(&self, read: impl FnOnce(&SessionState) -> R) -> R {
        read(&self.inner.lock())
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.lock().clone()
    }

    /// Signalled whenever a transition asks for an immediate sync pass
    pub fn sync_wakeup(&self) -> Arc<Notify> {
        self.sync_wakeup.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionIdentity, SessionPolicy};
    use std::time::Duration;

    fn shared() -> SharedSession {
        SharedSession::new(SessionState::new(
            SessionIdentity::new("alice", "lobby"),
            SessionPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn test_sync_wakeup_on_relevant_change() {
        let session = shared();
        let wakeup = session.sync_wakeup();
        session.apply(Transition::ConnectionReady).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wakeup.notified())
            .await
            .expect("ConnectionReady should request a sync pass");
    }

    #[test]
    fn test_rejected_transition_keeps_version() {
        let session = shared();
        assert!(session.apply(Transition::RoomChanged("x".into())).is_err());
        assert_eq!(session.read(|s| s.version()), 0);
        session.apply(Transition::ConnectionReady).unwrap();
        let (changes, room) = session
            .apply_and_read(Transition::RoomChanged("cinema".into()), |s| s.room().to_string())
            .unwrap();
        assert!(changes.room);
        assert_eq!(room, "cinema");
        assert_eq!(session.snapshot().version(), 2);
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let session = shared();
        session.apply(Transition::ConnectionReady).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        session.apply(Transition::LocalChangeAnnounced).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(session.read(|s| s.ignoring().client), 400);
    }
}
