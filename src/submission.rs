//! Answer submission service.
//!
//! ARCHITECTURE
//! ============
//! A submission is split around its one network call so the lifecycle store
//! is only ever touched from the session task:
//!
//! 1. [`AnswerSubmissionService::prepare`]: local checks, poll → `Pending`
//! 2. [`AnswerSubmissionService::spawn`] / [`send`]: the REST round trip,
//!    off the session task, producing a [`SubmissionOutcome`]
//! 3. [`AnswerSubmissionService::apply`]: back on the session task, either
//!    `mark_answered` (ledger commit) or `fail_submission`
//!
//! ERROR HANDLING
//! ==============
//! Local validation failures never reach the network. A refused or failed
//! request leaves the poll active in `Failed` with the ledger untouched; the
//! user decides whether to retry. Outcomes captured for a room that is no
//! longer current are dropped as stale.
//!
//! [`send`]: AnswerSubmissionService::send

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::ledger::AnswerLedger;
use crate::net::api::{AnswerRequest, ApiError, SessionApi};
use crate::store::{Answered, PollLifecycleStore, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no user id configured; set LIVEPOLL_USER_ID")]
    MissingUser,
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ErrorCode for SubmitError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_code(),
            Self::MissingUser => "E_CONFIG",
            Self::Api(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Validation(e) => e.retryable(),
            Self::MissingUser => false,
            Self::Api(e) => e.retryable(),
        }
    }
}

/// A submission that passed local checks and is ready for the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedAnswer {
    pub room_code: String,
    pub request: AnswerRequest,
}

/// Network result of one submission, tagged with the room it was made in.
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub room_code: String,
    pub poll_id: String,
    pub option_index: usize,
    pub result: Result<(), ApiError>,
}

/// What applying an outcome did to the store.
#[derive(Debug)]
pub enum SubmissionApplied {
    /// Captured room is no longer current, or the poll was already answered.
    Stale,
    Accepted { poll_id: String, option_index: usize, answered: Answered },
    Rejected { poll_id: String, error: SubmitError },
}

pub struct AnswerSubmissionService {
    api: Arc<dyn SessionApi>,
    ledger: AnswerLedger,
    user_id: Option<String>,
}

impl AnswerSubmissionService {
    #[must_use]
    pub fn new(api: Arc<dyn SessionApi>, ledger: AnswerLedger, user_id: Option<String>) -> Self {
        Self { api, ledger, user_id }
    }

    /// Check preconditions and move the poll to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Validation`] if `room_code` is not the current
    /// room, the poll is not open, the index is out of range, or the ledger
    /// already holds an answer. Returns [`SubmitError::MissingUser`] without
    /// touching the poll when no identity is configured.
    pub fn prepare(
        &self,
        store: &mut PollLifecycleStore,
        room_code: &str,
        poll_id: &str,
        option_index: usize,
    ) -> Result<PreparedAnswer, SubmitError> {
        if store.room_code() != Some(room_code) {
            return Err(ValidationError::NotActive { poll_id: poll_id.to_owned() }.into());
        }
        let user_id = self.user_id.clone().ok_or(SubmitError::MissingUser)?;

        match self.ledger.get(room_code, poll_id) {
            Ok(Some(_)) => {
                return Err(ValidationError::AlreadyAnswered { poll_id: poll_id.to_owned() }.into());
            }
            Ok(None) => {}
            // The store's answered set, seeded from the ledger on join, still guards.
            Err(e) => warn!(%room_code, %poll_id, error = %e, "ledger unreadable; checking session answers only"),
        }

        store.begin_submission(poll_id, option_index)?;
        debug!(%room_code, %poll_id, option_index, "submission pending");

        Ok(PreparedAnswer {
            room_code: room_code.to_owned(),
            request: AnswerRequest { poll_id: poll_id.to_owned(), user_id, answer_index: option_index },
        })
    }

    /// Perform the request/response call. Never retries.
    pub async fn send(api: &dyn SessionApi, prepared: PreparedAnswer) -> SubmissionOutcome {
        let result = api.submit_answer(&prepared.room_code, &prepared.request).await;
        SubmissionOutcome {
            room_code: prepared.room_code,
            poll_id: prepared.request.poll_id,
            option_index: prepared.request.answer_index,
            result,
        }
    }

    /// Run [`send`](Self::send) on its own task and deliver the outcome to
    /// `results` wrapped by `wrap`.
    pub fn spawn<E>(&self, prepared: PreparedAnswer, results: mpsc::UnboundedSender<E>, wrap: fn(SubmissionOutcome) -> E)
    where
        E: Send + 'static,
    {
        let api = self.api.clone();
        tokio::spawn(async move {
            let outcome = Self::send(api.as_ref(), prepared).await;
            // Receiver gone means the session shut down; nothing to update.
            let _ = results.send(wrap(outcome));
        });
    }

    /// Fold a network outcome back into the store.
    pub fn apply(&self, store: &mut PollLifecycleStore, outcome: SubmissionOutcome) -> SubmissionApplied {
        let SubmissionOutcome { room_code, poll_id, option_index, result } = outcome;

        if store.room_code() != Some(room_code.as_str()) {
            debug!(%room_code, %poll_id, "ignoring submission result for room no longer joined");
            return SubmissionApplied::Stale;
        }

        match result {
            Ok(()) => match store.mark_answered(&poll_id, option_index, &self.ledger) {
                Ok(answered) => SubmissionApplied::Accepted { poll_id, option_index, answered },
                Err(e) => {
                    debug!(%room_code, %poll_id, error = %e, "submission accepted for poll already answered");
                    SubmissionApplied::Stale
                }
            },
            Err(e) => {
                let still_active = store.fail_submission(&poll_id);
                warn!(%room_code, %poll_id, error = %e, still_active, "answer submission failed");
                SubmissionApplied::Rejected { poll_id, error: SubmitError::Api(e) }
            }
        }
    }
}

#[cfg(test)]
#[path = "submission_test.rs"]
mod tests;
