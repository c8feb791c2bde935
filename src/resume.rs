//! Reload resume marker.
//!
//! Two keys in the shared key-value store remember the room a process was in
//! so the next start can rejoin it: `activeRoomCode` holds the code and
//! `joinedRoom` is `"true"` while membership is live. Both are written on join
//! and deleted on leave. Answer history lives in the ledger, not here.

use std::sync::Arc;

use crate::storage::{KeyValueStore, StorageError};

pub const ACTIVE_ROOM_CODE_KEY: &str = "activeRoomCode";
pub const JOINED_ROOM_KEY: &str = "joinedRoom";

#[derive(Clone)]
pub struct ResumeMarker {
    store: Arc<dyn KeyValueStore>,
}

impl ResumeMarker {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Remember `room_code` as the room to rejoin.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn save(&self, room_code: &str) -> Result<(), StorageError> {
        self.store.set(ACTIVE_ROOM_CODE_KEY, room_code)?;
        self.store.set(JOINED_ROOM_KEY, "true")
    }

    /// The room to rejoin, if the last run left one joined.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn load(&self) -> Result<Option<String>, StorageError> {
        if self.store.get(JOINED_ROOM_KEY)?.as_deref() != Some("true") {
            return Ok(None);
        }
        Ok(self
            .store
            .get(ACTIVE_ROOM_CODE_KEY)?
            .map(|code| code.trim().to_owned())
            .filter(|code| !code.is_empty()))
    }

    /// Forget the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.delete(JOINED_ROOM_KEY)?;
        self.store.delete(ACTIVE_ROOM_CODE_KEY)
    }
}

#[cfg(test)]
#[path = "resume_test.rs"]
mod tests;
