//! Poll and room data model shared by the channel, store, and controller.

use serde::{Deserialize, Serialize};

/// Minimum number of options a poll must carry to be answerable.
pub const MIN_POLL_OPTIONS: usize = 2;

/// A poll as broadcast by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: String,
    pub question: String,
    /// Option labels. The index into this list is the answer encoding.
    pub options: Vec<String>,
    pub room_code: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub created_at: String,
    /// Countdown length in whole seconds. Called `timer` on the wire.
    #[serde(rename = "timer", alias = "initialTimerSeconds")]
    pub initial_timer_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("poll id is empty")]
    MissingId,
    #[error("poll {id} has {count} options; at least {MIN_POLL_OPTIONS} required")]
    TooFewOptions { id: String, count: usize },
}

impl Poll {
    /// Check the shape invariants a broadcast must satisfy before ingest.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), PollError> {
        if self.id.trim().is_empty() {
            return Err(PollError::MissingId);
        }
        if self.options.len() < MIN_POLL_OPTIONS {
            return Err(PollError::TooFewOptions { id: self.id.clone(), count: self.options.len() });
        }
        Ok(())
    }

    #[must_use]
    pub fn has_option(&self, index: usize) -> bool {
        index < self.options.len()
    }
}

/// Room details returned by `GET /rooms/{code}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub code: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub created_at: String,
}

/// Where an answer attempt for a poll stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    #[default]
    None,
    Pending,
    Submitted,
    Failed,
}

/// Per-poll countdown and answer state owned by the lifecycle store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRuntime {
    pub remaining_seconds: u32,
    pub selected_option_index: Option<usize>,
    pub submission_state: SubmissionState,
}

impl PollRuntime {
    #[must_use]
    pub fn new(remaining_seconds: u32) -> Self {
        Self { remaining_seconds, selected_option_index: None, submission_state: SubmissionState::None }
    }
}

/// A poll currently open for answers, as seen by a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePoll {
    pub poll: Poll,
    pub runtime: PollRuntime,
}

#[cfg(test)]
#[path = "poll_test.rs"]
mod tests;
