//! Shared playlist
//!
//! [`PlaylistState`] is the plain ordered list plus the selected index; it
//! lives inside the session aggregate. [`PlaylistManager`] is the handle the
//! client uses to edit it, every edit going through a session transition.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::session::{ChangeSet, SharedSession, StateInvariantViolation, Transition};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaylistError {
    #[error("playlist index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A single playlist edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistOp {
    Add(String),
    Remove(usize),
    Move { from: usize, to: usize },
    Next,
    Previous,
    Clear,
    SetIndex(usize),
    SetLoop(bool),
}

/// Ordered entries and the selected one. `current` is always `None` or a
/// valid index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaylistState {
    items: Vec<String>,
    current: Option<usize>,
    looping: bool,
}

impl PlaylistState {
    pub fn new(looping: bool) -> Self {
        Self {
            looping,
            ..Self::default()
        }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_item(&self) -> Option<&str> {
        self.current.and_then(|i| self.items.get(i)).map(String::as_str)
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn is_consistent(&self) -> bool {
        self.current.map_or(true, |c| c < self.items.len())
    }

    pub fn apply(&mut self, op: &PlaylistOp) -> Result<(), PlaylistError> {
        match op {
            PlaylistOp::Add(item) => self.add(item.clone()),
            PlaylistOp::Remove(index) => self.remove(*index).map(|_| ())?,
            PlaylistOp::Move { from, to } => self.move_item(*from, *to)?,
            PlaylistOp::Next => {
                self.next();
            }
            PlaylistOp::Previous => {
                self.previous();
            }
            PlaylistOp::Clear => self.clear(),
            PlaylistOp::SetIndex(index) => self.set_index(*index)?,
            PlaylistOp::SetLoop(looping) => self.looping = *looping,
        }
        Ok(())
    }

    /// Append; the first entry of an empty list becomes current
    pub fn add(&mut self, item: String) {
        self.items.push(item);
        if self.current.is_none() {
            self.current = Some(0);
        }
    }

    pub fn remove(&mut self, index: usize) -> Result<String, PlaylistError> {
        self.check(index)?;
        let removed = self.items.remove(index);
        self.current = match self.current {
            Some(c) if index < c => Some(c - 1),
            Some(c) if index == c => {
                if self.items.is_empty() {
                    None
                } else {
                    Some(c.min(self.items.len() - 1))
                }
            }
            other => other,
        };
        Ok(removed)
    }

    /// Reorder, keeping the current index on the same entry
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<(), PlaylistError> {
        self.check(from)?;
        self.check(to)?;
        let item = self.items.remove(from);
        self.items.insert(to, item);
        self.current = self.current.map(|c| {
            if c == from {
                to
            } else if from < c && to >= c {
                c - 1
            } else if from > c && to <= c {
                c + 1
            } else {
                c
            }
        });
        Ok(())
    }

    /// Advance. At the end this is a no-op unless looping. Returns the new
    /// index when it moved.
    pub fn next(&mut self) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        let next = match self.current {
            None => 0,
            Some(c) if c + 1 < self.items.len() => c + 1,
            Some(_) if self.looping => 0,
            Some(_) => return None,
        };
        self.current = Some(next);
        Some(next)
    }

    pub fn previous(&mut self) -> Option<usize> {
        let len = self.items.len();
        let prev = match self.current {
            Some(c) if c > 0 => c - 1,
            Some(_) if self.looping && len > 0 => len - 1,
            _ => return None,
        };
        self.current = Some(prev);
        Some(prev)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
    }

    pub fn set_index(&mut self, index: usize) -> Result<(), PlaylistError> {
        self.check(index)?;
        self.current = Some(index);
        Ok(())
    }

    /// Remote index update; `None` clears the selection
    pub fn select(&mut self, index: Option<usize>) -> Result<(), PlaylistError> {
        match index {
            Some(i) => self.set_index(i),
            None => {
                self.current = None;
                Ok(())
            }
        }
    }

    /// Wholesale replacement from a remote change. The current entry is kept
    /// when it still exists, otherwise the index is clamped.
    pub fn replace(&mut self, files: Vec<String>) {
        let keep = self.current_item().map(str::to_owned);
        self.items = files;
        self.current = match keep.and_then(|name| self.items.iter().position(|i| *i == name)) {
            Some(found) => Some(found),
            None if self.items.is_empty() => None,
            None => self.current.map(|c| c.min(self.items.len() - 1)),
        };
    }

    fn check(&self, index: usize) -> Result<(), PlaylistError> {
        if index < self.items.len() {
            Ok(())
        } else {
            Err(PlaylistError::IndexOutOfRange {
                index,
                len: self.items.len(),
            })
        }
    }
}

/// Find a playable location for a playlist entry: URLs pass through, paths
/// are tried as given and then under each media directory in order.
pub fn resolve_media(item: &str, media_directories: &[PathBuf]) -> Option<String> {
    if item.contains("://") {
        return Some(item.to_string());
    }
    let direct = Path::new(item);
    if direct.is_absolute() && direct.exists() {
        return Some(item.to_string());
    }
    let file_name = direct.file_name()?;
    media_directories
        .iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
        .map(|found| found.to_string_lossy().into_owned())
}

/// Edits the shared playlist through session transitions
#[derive(Clone)]
pub struct PlaylistManager {
    session: SharedSession,
}

impl PlaylistManager {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    pub fn snapshot(&self) -> PlaylistState {
        self.session.read(|s| s.playlist().clone())
    }

    pub fn add(&self, item: impl Into<String>) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Add(item.into()))
    }

    pub fn remove(&self, index: usize) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Remove(index))
    }

    pub fn move_item(&self, from: usize, to: usize) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Move { from, to })
    }

    pub fn next(&self) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Next)
    }

    pub fn previous(&self) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Previous)
    }

    pub fn clear(&self) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::Clear)
    }

    pub fn set_index(&self, index: usize) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::SetIndex(index))
    }

    pub fn set_loop(&self, looping: bool) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        self.edit(PlaylistOp::SetLoop(looping))
    }

    fn edit(&self, op: PlaylistOp) -> Result<(ChangeSet, PlaylistState), StateInvariantViolation> {
        tracing::debug!("Playlist edit: {:?}", op);
        self.session
            .apply_and_read(Transition::PlaylistEdited(op), |s| s.playlist().clone())
    }
}
