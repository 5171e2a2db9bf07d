//! Prepared-session registry.
//!
//! The master client stages `(session id, key)` pairs here; another client
//! later proves it is the intended owner by presenting the same key. The
//! registry belongs to the router and is only touched under the router lock.
//!
//! # Invariants
//!
//! - Session ids are unique within the registry.
//! - The entry count never exceeds the configured capacity.
//! - A key mismatch leaves the entry in place.

use subtle::ConstantTimeEq;

use crate::error::GuestCtlError;
use crate::protocol::ALL_SESSIONS;

/// One staged session.
struct PreparedSession {
    session_id: u32,
    key: Vec<u8>,
}

/// Outcome of presenting a key for a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    /// The key matches; the entry may be consumed.
    Match,
    /// An entry exists but the key differs.
    Mismatch,
    /// No entry with that id.
    Missing,
}

/// Sessions staged by the master, awaiting acceptance.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Vec<PreparedSession>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of staged sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `session_id` is staged.
    #[must_use]
    pub fn contains(&self, session_id: u32) -> bool {
        self.entries.iter().any(|e| e.session_id == session_id)
    }

    /// Staged ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.session_id).collect()
    }

    /// Checks whether a new entry could be inserted.
    ///
    /// # Errors
    ///
    /// - [`GuestCtlError::Duplicate`] if the id is already staged
    /// - [`GuestCtlError::OutOfResources`] if the registry is full
    pub fn check_insert(&self, session_id: u32, capacity: usize) -> Result<(), GuestCtlError> {
        if self.contains(session_id) {
            return Err(GuestCtlError::Duplicate {
                what: "prepared session",
                id: session_id,
            });
        }
        if self.entries.len() >= capacity {
            return Err(GuestCtlError::OutOfResources { limit: capacity });
        }
        Ok(())
    }

    /// Stages a session. Call [`check_insert`](Self::check_insert) first.
    pub fn insert(&mut self, session_id: u32, key: Vec<u8>) {
        debug_assert!(!self.contains(session_id));
        self.entries.push(PreparedSession { session_id, key });
    }

    /// Compares `key` with the staged key in constant time.
    #[must_use]
    pub fn check_key(&self, session_id: u32, key: &[u8]) -> KeyCheck {
        match self.entries.iter().find(|e| e.session_id == session_id) {
            None => KeyCheck::Missing,
            Some(entry) => {
                if entry.key.len() == key.len() && bool::from(entry.key.as_slice().ct_eq(key)) {
                    KeyCheck::Match
                } else {
                    KeyCheck::Mismatch
                }
            },
        }
    }

    /// Removes one entry, or all of them for [`ALL_SESSIONS`].
    ///
    /// Returns the number of entries removed.
    pub fn remove(&mut self, session_id: u32) -> usize {
        let before = self.entries.len();
        if session_id == ALL_SESSIONS {
            self.entries.clear();
        } else {
            self.entries.retain(|e| e.session_id != session_id);
        }
        before - self.entries.len()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
