//! Persistent answer ledger.
//!
//! DESIGN
//! ======
//! One storage key per room, `answeredPolls:{roomCode}`, holding a JSON object
//! `{ pollId: answeredOptionIndex }`. Entries are append-only: recording an
//! answer for a poll that already has one is rejected, never overwritten.
//! This is the durable half of at-most-one-answer-per-poll; the lifecycle
//! store enforces the in-memory half.
//!
//! Read-modify-write on a room key goes through [`KeyValueStore::update`], so
//! two session views (or two processes on one store file) cannot interleave
//! and drop or overwrite an entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::storage::{KeyUpdate, KeyValueStore, StorageError};

/// Storage key prefix for per-room answer maps.
pub const ANSWERED_POLLS_PREFIX: &str = "answeredPolls:";

/// Answers recorded for one room, keyed by poll id.
pub type RoomAnswers = BTreeMap<String, usize>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("poll {poll_id} in room {room_code} already answered with option {existing}")]
    AlreadyAnswered { room_code: String, poll_id: String, existing: usize },
    #[error("ledger entry for room {room_code} is unreadable: {source}")]
    Corrupt { room_code: String, source: serde_json::Error },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for LedgerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyAnswered { .. } => "E_ALREADY_ANSWERED",
            Self::Corrupt { .. } => "E_LEDGER_CORRUPT",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Durable record of answered polls. Clones share storage.
#[derive(Clone)]
pub struct AnswerLedger {
    store: Arc<dyn KeyValueStore>,
}

impl AnswerLedger {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn key(room_code: &str) -> String {
        format!("{ANSWERED_POLLS_PREFIX}{room_code}")
    }

    /// Load every answer recorded for `room_code`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored value is not a map.
    pub fn load(&self, room_code: &str) -> Result<RoomAnswers, LedgerError> {
        let Some(raw) = self.store.get(&Self::key(room_code))? else {
            return Ok(RoomAnswers::new());
        };
        serde_json::from_str(&raw).map_err(|source| LedgerError::Corrupt { room_code: room_code.to_owned(), source })
    }

    /// Look up the answer recorded for one poll.
    ///
    /// # Errors
    ///
    /// Same as [`AnswerLedger::load`].
    pub fn get(&self, room_code: &str, poll_id: &str) -> Result<Option<usize>, LedgerError> {
        Ok(self.load(room_code)?.get(poll_id).copied())
    }

    /// Append an answer. Rejects a second write for the same poll.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyAnswered`] for a duplicate key, or a
    /// storage/corruption error.
    pub fn record(&self, room_code: &str, poll_id: &str, option_index: usize) -> Result<(), LedgerError> {
        let mut outcome = Ok(());
        self.store.update(&Self::key(room_code), &mut |current| {
            match Self::append(room_code, current, poll_id, option_index) {
                Ok(raw) => KeyUpdate::Set(raw),
                Err(e) => {
                    outcome = Err(e);
                    KeyUpdate::Keep
                }
            }
        })?;
        outcome
    }

    fn append(room_code: &str, current: Option<&str>, poll_id: &str, option_index: usize) -> Result<String, LedgerError> {
        let corrupt = |source| LedgerError::Corrupt { room_code: room_code.to_owned(), source };
        let mut answers: RoomAnswers = match current {
            Some(raw) => serde_json::from_str(raw).map_err(corrupt)?,
            None => RoomAnswers::new(),
        };
        if let Some(&existing) = answers.get(poll_id) {
            return Err(LedgerError::AlreadyAnswered {
                room_code: room_code.to_owned(),
                poll_id: poll_id.to_owned(),
                existing,
            });
        }
        answers.insert(poll_id.to_owned(), option_index);
        serde_json::to_string(&answers).map_err(corrupt)
    }

    /// Drop all history for a room.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn forget(&self, room_code: &str) -> Result<(), LedgerError> {
        self.store.delete(&Self::key(room_code))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "ledger_test.rs"]
mod tests;
