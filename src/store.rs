//! Poll lifecycle store: the authoritative set of active polls.
//!
//! DESIGN
//! ======
//! Each poll id moves through `Active → Expired` or `Active → Answered`.
//! Both end states remove the poll from the active list in the same call
//! that reaches them, so no caller ever observes a poll with zero seconds
//! left or an answered poll still open.
//!
//! The store is plain synchronous state owned by the session controller's
//! single task. Countdown is driven from outside: one [`tick`] per scheduler
//! period decrements every active poll by exactly one second.
//!
//! Answered and expired poll ids are remembered for the lifetime of the room
//! attachment. Answered ids are pre-seeded from the ledger on join so a
//! broadcast redelivered after a reload is discarded; expired ids are memory
//! only.
//!
//! [`tick`]: PollLifecycleStore::tick

use std::collections::HashSet;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::ledger::{AnswerLedger, LedgerError, RoomAnswers};
use crate::poll::{ActivePoll, Poll, PollError, PollRuntime, SubmissionState};

// =============================================================================
// TYPES
// =============================================================================

/// Local validation failure. Never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("poll {poll_id} is not active")]
    NotActive { poll_id: String },
    #[error("option {index} is out of range for poll {poll_id} ({count} options)")]
    InvalidOption { poll_id: String, index: usize, count: usize },
    #[error("poll {poll_id} was already answered")]
    AlreadyAnswered { poll_id: String },
    #[error("an answer for poll {poll_id} is already being submitted")]
    SubmissionPending { poll_id: String },
    #[error("select an option for poll {poll_id} first")]
    NoSelection { poll_id: String },
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotActive { .. } => "E_POLL_NOT_ACTIVE",
            Self::InvalidOption { .. } => "E_INVALID_OPTION",
            Self::AlreadyAnswered { .. } => "E_ALREADY_ANSWERED",
            Self::SubmissionPending { .. } => "E_SUBMISSION_PENDING",
            Self::NoSelection { .. } => "E_NO_SELECTION",
        }
    }
}

/// What happened to an inbound broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Poll is now active and counting down.
    Inserted,
    /// Arrived with a zero timer: expired on arrival, never offered.
    ExpiredOnArrival,
    /// No room attached.
    NotJoined,
    /// Broadcast addressed to a room other than the current one.
    WrongRoom,
    /// Already answered per the ledger or this session.
    AlreadyAnswered,
    /// Already expired earlier in this session.
    AlreadyExpired,
    /// Same poll id is already active; the running countdown is kept.
    AlreadyActive,
    /// Broadcast violated the poll shape invariants.
    Invalid(PollError),
}

/// Result of [`PollLifecycleStore::mark_answered`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answered {
    /// The poll removed from the active set, if it was still active.
    pub poll: Option<Poll>,
    /// Whether the durable ledger holds the answer.
    pub persisted: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    poll: Poll,
    runtime: PollRuntime,
    arrived_at: Instant,
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Default)]
pub struct PollLifecycleStore {
    room_code: Option<String>,
    /// Active polls in arrival order.
    active: Vec<Entry>,
    answered: RoomAnswers,
    expired: HashSet<String>,
}

impl PollLifecycleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the store to a room, seeding already-answered polls from history.
    pub fn attach(&mut self, room_code: &str, answered: RoomAnswers) {
        self.room_code = Some(room_code.to_owned());
        self.active.clear();
        self.expired.clear();
        self.answered = answered;
    }

    /// Drop all in-memory state. Durable history is untouched.
    pub fn detach(&mut self) {
        self.room_code = None;
        self.active.clear();
        self.expired.clear();
        self.answered.clear();
    }

    #[must_use]
    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_answered(&self, poll_id: &str) -> bool {
        self.answered.contains_key(poll_id)
    }

    #[must_use]
    pub fn answered(&self) -> &RoomAnswers {
        &self.answered
    }

    #[must_use]
    pub fn get(&self, poll_id: &str) -> Option<ActivePoll> {
        self.entry(poll_id)
            .map(|e| ActivePoll { poll: e.poll.clone(), runtime: e.runtime.clone() })
    }

    #[must_use]
    pub fn active_polls(&self) -> Vec<ActivePoll> {
        self.active
            .iter()
            .map(|e| ActivePoll { poll: e.poll.clone(), runtime: e.runtime.clone() })
            .collect()
    }

    /// Submission state as a view should render it. Answered polls report
    /// `Submitted` even though they have left the active set.
    #[must_use]
    pub fn submission_state(&self, poll_id: &str) -> SubmissionState {
        if let Some(entry) = self.entry(poll_id) {
            return entry.runtime.submission_state;
        }
        if self.is_answered(poll_id) {
            return SubmissionState::Submitted;
        }
        SubmissionState::None
    }

    fn entry(&self, poll_id: &str) -> Option<&Entry> {
        self.active.iter().find(|e| e.poll.id == poll_id)
    }

    fn entry_mut(&mut self, poll_id: &str) -> Option<&mut Entry> {
        self.active.iter_mut().find(|e| e.poll.id == poll_id)
    }

    // -------------------------------------------------------------------------
    // INGEST
    // -------------------------------------------------------------------------

    /// Accept a broadcast poll into the active set.
    pub fn ingest(&mut self, poll: Poll, now: Instant) -> IngestOutcome {
        let Some(room_code) = self.room_code.as_deref() else {
            return IngestOutcome::NotJoined;
        };
        if poll.room_code != room_code {
            debug!(poll_id = %poll.id, poll_room = %poll.room_code, %room_code, "discarding poll for other room");
            return IngestOutcome::WrongRoom;
        }
        if let Err(e) = poll.validate() {
            warn!(poll_id = %poll.id, error = %e, "discarding malformed poll");
            return IngestOutcome::Invalid(e);
        }
        if self.is_answered(&poll.id) {
            debug!(poll_id = %poll.id, "discarding redelivered poll already answered");
            return IngestOutcome::AlreadyAnswered;
        }
        if self.expired.contains(&poll.id) {
            debug!(poll_id = %poll.id, "discarding redelivered poll already expired");
            return IngestOutcome::AlreadyExpired;
        }
        if self.entry(&poll.id).is_some() {
            return IngestOutcome::AlreadyActive;
        }
        if poll.initial_timer_seconds == 0 {
            info!(poll_id = %poll.id, "poll arrived with no time left");
            self.expired.insert(poll.id);
            return IngestOutcome::ExpiredOnArrival;
        }

        info!(poll_id = %poll.id, timer = poll.initial_timer_seconds, "poll active");
        let runtime = PollRuntime::new(poll.initial_timer_seconds);
        self.active.push(Entry { poll, runtime, arrived_at: now });
        IngestOutcome::Inserted
    }

    // -------------------------------------------------------------------------
    // COUNTDOWN
    // -------------------------------------------------------------------------

    /// Advance every active poll by one second. Returns the polls that expired.
    pub fn tick(&mut self) -> Vec<Poll> {
        for entry in &mut self.active {
            entry.runtime.remaining_seconds = entry.runtime.remaining_seconds.saturating_sub(1);
        }
        self.remove_expired()
    }

    /// Recompute remaining time from arrival instants instead of decrementing.
    ///
    /// Remaining time never increases, so a late tick can only shorten a
    /// countdown. Returns the polls that expired.
    pub fn resync(&mut self, now: Instant) -> Vec<Poll> {
        for entry in &mut self.active {
            let elapsed = now.saturating_duration_since(entry.arrived_at).as_secs();
            let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
            let wall = entry.poll.initial_timer_seconds.saturating_sub(elapsed);
            entry.runtime.remaining_seconds = entry.runtime.remaining_seconds.min(wall);
        }
        self.remove_expired()
    }

    fn remove_expired(&mut self) -> Vec<Poll> {
        let (done, still_active): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|e| e.runtime.remaining_seconds == 0);
        self.active = still_active;

        done.into_iter()
            .map(|e| {
                info!(poll_id = %e.poll.id, "poll expired");
                self.expired.insert(e.poll.id.clone());
                e.poll
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // SELECTION & SUBMISSION
    // -------------------------------------------------------------------------

    fn check_answerable(&self, poll_id: &str, index: usize) -> Result<&Entry, ValidationError> {
        if self.is_answered(poll_id) {
            return Err(ValidationError::AlreadyAnswered { poll_id: poll_id.to_owned() });
        }
        let entry = self
            .entry(poll_id)
            .filter(|e| e.runtime.remaining_seconds > 0)
            .ok_or_else(|| ValidationError::NotActive { poll_id: poll_id.to_owned() })?;
        if !entry.poll.has_option(index) {
            return Err(ValidationError::InvalidOption {
                poll_id: poll_id.to_owned(),
                index,
                count: entry.poll.options.len(),
            });
        }
        if entry.runtime.submission_state == SubmissionState::Pending {
            return Err(ValidationError::SubmissionPending { poll_id: poll_id.to_owned() });
        }
        Ok(entry)
    }

    /// Record a provisional choice. No network effect.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the poll is not open for this choice.
    pub fn select_option(&mut self, poll_id: &str, index: usize) -> Result<(), ValidationError> {
        self.check_answerable(poll_id, index)?;
        if let Some(entry) = self.entry_mut(poll_id) {
            entry.runtime.selected_option_index = Some(index);
        }
        Ok(())
    }

    /// The provisional choice for an active poll.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NotActive`] or [`ValidationError::NoSelection`].
    pub fn selection(&self, poll_id: &str) -> Result<usize, ValidationError> {
        let entry = self
            .entry(poll_id)
            .ok_or_else(|| ValidationError::NotActive { poll_id: poll_id.to_owned() })?;
        entry
            .runtime
            .selected_option_index
            .ok_or_else(|| ValidationError::NoSelection { poll_id: poll_id.to_owned() })
    }

    /// Move a poll into `Pending` ahead of the network call.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the poll cannot be answered with `index`.
    pub fn begin_submission(&mut self, poll_id: &str, index: usize) -> Result<(), ValidationError> {
        self.check_answerable(poll_id, index)?;
        if let Some(entry) = self.entry_mut(poll_id) {
            entry.runtime.submission_state = SubmissionState::Pending;
            entry.runtime.selected_option_index = None;
        }
        Ok(())
    }

    /// Mark a pending submission as failed. The poll stays active for retry.
    /// Returns `false` if the poll is no longer active.
    pub fn fail_submission(&mut self, poll_id: &str) -> bool {
        let Some(entry) = self.entry_mut(poll_id) else {
            return false;
        };
        entry.runtime.submission_state = SubmissionState::Failed;
        true
    }

    /// Move a poll to `Answered` and commit the answer to the ledger.
    ///
    /// The in-memory transition always happens; a ledger failure only clears
    /// `persisted`, since the service already accepted the answer.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::AlreadyAnswered`] if this session already
    /// holds an answer for the poll, or [`ValidationError::NotActive`] when no
    /// room is attached.
    pub fn mark_answered(
        &mut self,
        poll_id: &str,
        index: usize,
        ledger: &AnswerLedger,
    ) -> Result<Answered, ValidationError> {
        let Some(room_code) = self.room_code.clone() else {
            return Err(ValidationError::NotActive { poll_id: poll_id.to_owned() });
        };
        if self.is_answered(poll_id) {
            return Err(ValidationError::AlreadyAnswered { poll_id: poll_id.to_owned() });
        }

        let poll = self
            .active
            .iter()
            .position(|e| e.poll.id == poll_id)
            .map(|pos| self.active.remove(pos).poll);
        self.answered.insert(poll_id.to_owned(), index);

        let persisted = match ledger.record(&room_code, poll_id, index) {
            Ok(()) => true,
            Err(LedgerError::AlreadyAnswered { existing, .. }) => {
                warn!(%room_code, %poll_id, existing, "ledger already held an answer for poll");
                true
            }
            Err(e) => {
                warn!(%room_code, %poll_id, error = %e, "ledger write failed; answer kept in memory only");
                false
            }
        };

        info!(%room_code, %poll_id, index, persisted, "poll answered");
        Ok(Answered { poll, persisted })
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
