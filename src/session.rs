//! Room session controller: the single task that owns a live poll session.
//!
//! ARCHITECTURE
//! ============
//! A [`RoomSession`] owns the lifecycle store, the countdown scheduler, and
//! the submission service. It runs as one tokio task and folds every input
//! into a closed [`SessionEvent`] before dispatching it through
//! [`RoomSession::handle`]:
//!
//! ```text
//! SessionHandle ──commands──┐
//! push channel ──broadcasts─┤
//! scheduler ──────ticks─────┼──► handle(SessionEvent) ──► store / ledger
//! REST tasks ─────results───┘            │
//!                                        ├──► SessionSnapshot (watch)
//!                                        └──► SessionNotice (broadcast)
//! ```
//!
//! Only this task mutates the store, so it needs no lock. Network round trips
//! (room metadata, answer submission) run on spawned tasks and re-enter the
//! loop as events tagged with the room they were made for; a result for a
//! room that is no longer current is ignored.
//!
//! MEMBERSHIP
//! ==========
//! `Disconnected → Joining → Joined → Leaving → Disconnected`. Join asks the
//! push channel for the room, seeds answered polls from the ledger, starts the
//! scheduler, writes the resume marker, and fetches room metadata once. Leave
//! reverses each step. In-memory state is dropped on leave; the ledger is not.
//! If the service refuses the `join-room`, the room is left again and a
//! `JoinRefused` notice carries the reason.
//!
//! TRADE-OFFS
//! ==========
//! Join and leave await the push channel's acknowledgment inside `handle`, so
//! events arriving meanwhile queue behind them. The acknowledgment is local
//! (the frame was handed to the socket) and leave is bounded by
//! `leave_ack_timeout`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CountdownMode, SessionConfig};
use crate::error::{ErrorCode, ErrorStatus};
use crate::frame::JOIN_ROOM;
use crate::ledger::{AnswerLedger, LedgerError, RoomAnswers};
use crate::net::api::{ApiError, SessionApi};
use crate::net::channel::{ChannelError, ChannelEvent, ChannelHandle, ConnectionStatus, Subscription};
use crate::poll::{ActivePoll, Poll, RoomMetadata};
use crate::resume::ResumeMarker;
use crate::scheduler::TimerScheduler;
use crate::store::{IngestOutcome, PollLifecycleStore, ValidationError};
use crate::submission::{AnswerSubmissionService, SubmissionApplied, SubmissionOutcome, SubmitError};

const COMMAND_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 128;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    #[default]
    Disconnected,
    Joining,
    Joined,
    Leaving,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("room code is empty")]
    InvalidRoomCode,
    #[error("not joined to a room")]
    NotJoined,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("answer history unavailable: {0}")]
    Ledger(#[from] LedgerError),
    #[error("session task has stopped")]
    Stopped,
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRoomCode => "E_INVALID_ROOM",
            Self::NotJoined => "E_NOT_JOINED",
            Self::Validation(e) => e.error_code(),
            Self::Submit(e) => e.error_code(),
            Self::Channel(e) => e.error_code(),
            Self::Ledger(e) => e.error_code(),
            Self::Stopped => "E_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Submit(e) => e.retryable(),
            Self::Channel(e) => e.retryable(),
            Self::Ledger(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Everything the controller needs from outside, injected at construction.
#[derive(Clone)]
pub struct SessionContext {
    pub channel: ChannelHandle,
    pub api: Arc<dyn SessionApi>,
    pub ledger: AnswerLedger,
    pub resume: ResumeMarker,
    pub config: SessionConfig,
}

pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from an attached view.
#[derive(Debug)]
pub enum SessionCommand {
    Join { room_code: String, reply: Reply<SessionSnapshot> },
    Leave { reply: Reply<()> },
    Select { poll_id: String, option_index: usize, reply: Reply<()> },
    /// Submit `option_index`, or the current selection when `None`.
    Submit { poll_id: String, option_index: Option<usize>, reply: Reply<()> },
    /// Stop the session task without leaving, keeping the resume marker.
    Detach { reply: Reply<()> },
}

/// Every input the controller reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Command(SessionCommand),
    RoomMetadata { room_code: String, result: Result<RoomMetadata, ApiError> },
    PollBroadcast(Poll),
    ConnectionChanged(ConnectionStatus),
    RequestRefused(ChannelError),
    SubmissionResult(SubmissionOutcome),
    TickElapsed,
}

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotice {
    Joined { room_code: String },
    Left { room_code: String },
    PollReceived { poll_id: String, question: String },
    PollExpired { poll_id: String },
    AnswerAccepted { poll_id: String, option_index: usize, persisted: bool },
    AnswerFailed { poll_id: String, error: ErrorStatus },
    SelectionRequired { poll_id: String },
    ConnectionChanged { status: ConnectionStatus },
    JoinRefused { room_code: String, error: ErrorStatus },
}

/// Read-only view of the session, republished after every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub room_code: Option<String>,
    pub membership: MembershipState,
    pub metadata: Option<RoomMetadata>,
    /// Open polls in arrival order.
    pub active_polls: Vec<ActivePoll>,
    /// Polls answered in this room, from history and this session.
    pub answered: RoomAnswers,
    pub connection: ConnectionStatus,
    pub last_error: Option<ErrorStatus>,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable front end to a running [`RoomSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    notices: broadcast::Sender<SessionNotice>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Join `room_code`. Joining the current room again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty code, an unreadable ledger, or a
    /// stopped channel or session.
    pub async fn join(&self, room_code: &str) -> Result<SessionSnapshot, SessionError> {
        let room_code = room_code.to_owned();
        self.call(|reply| SessionCommand::Join { room_code, reply }).await
    }

    /// Leave the current room, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session task is gone.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::Leave { reply }).await
    }

    /// Record a provisional choice for an open poll.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the poll is not open for this choice.
    pub async fn select(&self, poll_id: &str, option_index: usize) -> Result<(), SessionError> {
        let poll_id = poll_id.to_owned();
        self.call(|reply| SessionCommand::Select { poll_id, option_index, reply })
            .await
    }

    /// Submit an answer. Resolves once the request is in flight; the result
    /// arrives as a notice and in the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if local checks fail.
    pub async fn submit(&self, poll_id: &str, option_index: usize) -> Result<(), SessionError> {
        let poll_id = poll_id.to_owned();
        self.call(|reply| SessionCommand::Submit { poll_id, option_index: Some(option_index), reply })
            .await
    }

    /// Submit the current selection for `poll_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NoSelection`] when nothing is selected, or
    /// any error [`SessionHandle::submit`] can return.
    pub async fn submit_selected(&self, poll_id: &str) -> Result<(), SessionError> {
        let poll_id = poll_id.to_owned();
        self.call(|reply| SessionCommand::Submit { poll_id, option_index: None, reply })
            .await
    }

    /// Stop the session without leaving the room, so the next run can
    /// resume it. Commands sent afterwards fail with
    /// [`SessionError::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session task is already gone.
    pub async fn detach(&self) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::Detach { reply }).await
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

pub struct RoomSession {
    ctx: SessionContext,
    store: PollLifecycleStore,
    scheduler: TimerScheduler,
    submissions: AnswerSubmissionService,
    membership: MembershipState,
    metadata: Option<RoomMetadata>,
    connection: ConnectionStatus,
    last_error: Option<ErrorStatus>,
    /// Present only while joined; dropping it unsubscribes.
    subscription: Option<Subscription>,
    detached: bool,
    results_tx: mpsc::UnboundedSender<SessionEvent>,
    results_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notices: broadcast::Sender<SessionNotice>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl RoomSession {
    #[must_use]
    pub fn new(ctx: SessionContext) -> Self {
        let submissions =
            AnswerSubmissionService::new(ctx.api.clone(), ctx.ledger.clone(), ctx.config.user_id.clone());
        let scheduler = TimerScheduler::new(ctx.config.tick);
        let connection = ctx.channel.status();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (snapshots, _) = watch::channel(SessionSnapshot { connection, ..SessionSnapshot::default() });

        Self {
            ctx,
            store: PollLifecycleStore::new(),
            scheduler,
            submissions,
            membership: MembershipState::Disconnected,
            metadata: None,
            connection,
            last_error: None,
            subscription: None,
            detached: false,
            results_tx,
            results_rx,
            notices,
            snapshots,
        }
    }

    /// Start the controller on its own task.
    #[must_use]
    pub fn spawn(self) -> SessionHandle {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SessionHandle {
            commands,
            notices: self.notices.clone(),
            snapshots: self.snapshots.subscribe(),
        };
        tokio::spawn(self.run(commands_rx));
        handle
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_code: self.store.room_code().map(ToOwned::to_owned),
            membership: self.membership,
            metadata: self.metadata.clone(),
            active_polls: self.store.active_polls(),
            answered: self.store.answered().clone(),
            connection: self.connection,
            last_error: self.last_error.clone(),
        }
    }

    /// Event loop. Returns when every [`SessionHandle`] has been dropped,
    /// leaving the room on the way out, or after a detach, which leaves
    /// nothing.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => SessionEvent::Command(command),
                    None => break,
                },
                Some(event) = self.results_rx.recv() => event,
                event = next_channel_event(&mut self.subscription) => match event {
                    Some(ChannelEvent::PollBroadcast(poll)) => SessionEvent::PollBroadcast(poll),
                    Some(ChannelEvent::ConnectionChanged(status)) => SessionEvent::ConnectionChanged(status),
                    Some(ChannelEvent::RequestRefused { syscall, room_code, message }) => {
                        SessionEvent::RequestRefused(ChannelError::Refused { syscall, room_code, message })
                    }
                    None => {
                        warn!("push channel closed; no further broadcasts");
                        self.subscription = None;
                        continue;
                    }
                },
                _ = self.scheduler.tick() => SessionEvent::TickElapsed,
            };
            self.handle(event).await;
            if self.detached {
                debug!(room_code = ?self.store.room_code(), "session detached; room kept for resume");
                return;
            }
        }

        self.leave_room().await;
        debug!("session task stopped");
    }

    /// Dispatch one event and republish the snapshot.
    pub async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.handle_command(command).await,
            SessionEvent::RoomMetadata { room_code, result } => self.on_metadata(&room_code, result),
            SessionEvent::PollBroadcast(poll) => self.on_poll(poll),
            SessionEvent::ConnectionChanged(status) => self.on_connection(status),
            SessionEvent::RequestRefused(error) => self.on_refused(error).await,
            SessionEvent::SubmissionResult(outcome) => self.on_submission(outcome),
            SessionEvent::TickElapsed => self.on_tick(),
        }
        self.snapshots.send_replace(self.snapshot());
    }

    /// Next event produced by a spawned network task.
    #[cfg(test)]
    pub(crate) async fn next_result(&mut self) -> Option<SessionEvent> {
        self.results_rx.recv().await
    }

    fn notify(&self, notice: SessionNotice) {
        // No attached view is fine.
        let _ = self.notices.send(notice);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join { room_code, reply } => {
                let result = self.join_room(&room_code).await.map(|()| self.snapshot());
                let _ = reply.send(result);
            }
            SessionCommand::Leave { reply } => {
                self.leave_room().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Detach { reply } => {
                self.scheduler.stop();
                self.subscription = None;
                self.detached = true;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Select { poll_id, option_index, reply } => {
                let _ = reply.send(self.select(&poll_id, option_index));
            }
            SessionCommand::Submit { poll_id, option_index, reply } => {
                let _ = reply.send(self.submit(&poll_id, option_index));
            }
        }
    }

    // -------------------------------------------------------------------------
    // MEMBERSHIP
    // -------------------------------------------------------------------------

    async fn join_room(&mut self, room_code: &str) -> Result<(), SessionError> {
        let room_code = room_code.trim();
        if room_code.is_empty() {
            return Err(SessionError::InvalidRoomCode);
        }
        if self.membership == MembershipState::Joined && self.store.room_code() == Some(room_code) {
            debug!(%room_code, "already joined");
            return Ok(());
        }
        if self.store.room_code().is_some() {
            self.leave_room().await;
        }

        self.membership = MembershipState::Joining;
        // Subscribe first so nothing broadcast right after the join is missed.
        let subscription = self.ctx.channel.subscribe();
        if let Err(e) = self.ctx.channel.join(room_code).await {
            self.membership = MembershipState::Disconnected;
            return Err(e.into());
        }

        let answered = match self.ctx.ledger.load(room_code) {
            Ok(answered) => answered,
            Err(e) => {
                warn!(%room_code, error = %e, "cannot load answer history; join aborted");
                let _ = self.ctx.channel.leave(room_code).await;
                self.membership = MembershipState::Disconnected;
                return Err(e.into());
            }
        };
        let previously_answered = answered.len();

        self.store.attach(room_code, answered);
        self.subscription = Some(subscription);
        self.scheduler.start();
        self.metadata = None;
        self.last_error = None;
        if let Err(e) = self.ctx.resume.save(room_code) {
            warn!(%room_code, error = %e, "failed to save resume marker");
        }
        self.spawn_metadata_fetch(room_code);

        self.membership = MembershipState::Joined;
        info!(%room_code, previously_answered, "joined room");
        self.notify(SessionNotice::Joined { room_code: room_code.to_owned() });
        Ok(())
    }

    async fn leave_room(&mut self) {
        let Some(room_code) = self.store.room_code().map(ToOwned::to_owned) else {
            self.membership = MembershipState::Disconnected;
            return;
        };

        self.membership = MembershipState::Leaving;
        self.scheduler.stop();
        self.subscription = None;

        match tokio::time::timeout(self.ctx.config.leave_ack_timeout, self.ctx.channel.leave(&room_code)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%room_code, error = %e, "leave not delivered"),
            Err(_) => warn!(%room_code, "leave acknowledgment timed out"),
        }

        self.store.detach();
        self.metadata = None;
        self.last_error = None;
        if let Err(e) = self.ctx.resume.clear() {
            warn!(%room_code, error = %e, "failed to clear resume marker");
        }

        self.membership = MembershipState::Disconnected;
        info!(%room_code, "left room");
        self.notify(SessionNotice::Left { room_code });
    }

    fn spawn_metadata_fetch(&self, room_code: &str) {
        let api = self.ctx.api.clone();
        let results = self.results_tx.clone();
        let room_code = room_code.to_owned();
        tokio::spawn(async move {
            let result = api.fetch_room(&room_code).await;
            let _ = results.send(SessionEvent::RoomMetadata { room_code, result });
        });
    }

    fn on_metadata(&mut self, room_code: &str, result: Result<RoomMetadata, ApiError>) {
        if self.store.room_code() != Some(room_code) {
            debug!(%room_code, "ignoring metadata for room no longer joined");
            return;
        }
        match result {
            Ok(metadata) => {
                debug!(%room_code, creator_id = %metadata.creator_id, "room metadata loaded");
                self.metadata = Some(metadata);
            }
            Err(e) => warn!(%room_code, error = %e, "room metadata unavailable"),
        }
    }

    async fn on_refused(&mut self, error: ChannelError) {
        let ChannelError::Refused { syscall, room_code, .. } = &error else {
            return;
        };
        let joined_here = self.membership == MembershipState::Joined && self.store.room_code() == Some(room_code.as_str());
        if syscall != JOIN_ROOM || !joined_here {
            warn!(error = %error, "push channel request refused");
            return;
        }

        let room_code = room_code.clone();
        warn!(%room_code, error = %error, "join refused; leaving room");
        self.leave_room().await;
        let status = ErrorStatus::from_error(&error);
        self.last_error = Some(status.clone());
        self.notify(SessionNotice::JoinRefused { room_code, error: status });
    }

    fn on_connection(&mut self, status: ConnectionStatus) {
        if self.connection == status {
            return;
        }
        self.connection = status;
        self.notify(SessionNotice::ConnectionChanged { status });
    }

    // -------------------------------------------------------------------------
    // POLLS
    // -------------------------------------------------------------------------

    fn on_poll(&mut self, poll: Poll) {
        if self.membership != MembershipState::Joined {
            debug!(poll_id = %poll.id, membership = ?self.membership, "discarding poll while not joined");
            return;
        }
        let poll_id = poll.id.clone();
        let question = poll.question.clone();

        match self.store.ingest(poll, Instant::now()) {
            IngestOutcome::Inserted => {
                self.scheduler.start();
                self.notify(SessionNotice::PollReceived { poll_id, question });
            }
            IngestOutcome::ExpiredOnArrival => self.notify(SessionNotice::PollExpired { poll_id }),
            outcome => debug!(%poll_id, ?outcome, "broadcast not ingested"),
        }
    }

    fn on_tick(&mut self) {
        let expired = match self.ctx.config.countdown {
            CountdownMode::Fixed => self.store.tick(),
            CountdownMode::WallClock => self.store.resync(Instant::now()),
        };
        for poll in expired {
            self.notify(SessionNotice::PollExpired { poll_id: poll.id });
        }
        self.stop_scheduler_if_idle();
    }

    fn stop_scheduler_if_idle(&mut self) {
        if self.store.is_empty() {
            self.scheduler.stop();
        }
    }

    // -------------------------------------------------------------------------
    // ANSWERS
    // -------------------------------------------------------------------------

    fn select(&mut self, poll_id: &str, option_index: usize) -> Result<(), SessionError> {
        if self.store.room_code().is_none() {
            return Err(SessionError::NotJoined);
        }
        self.store.select_option(poll_id, option_index)?;
        Ok(())
    }

    fn submit(&mut self, poll_id: &str, option_index: Option<usize>) -> Result<(), SessionError> {
        let Some(room_code) = self.store.room_code().map(ToOwned::to_owned) else {
            return Err(SessionError::NotJoined);
        };
        let option_index = match option_index {
            Some(index) => index,
            None => self.store.selection(poll_id).inspect_err(|e| {
                if matches!(e, ValidationError::NoSelection { .. }) {
                    self.notify(SessionNotice::SelectionRequired { poll_id: poll_id.to_owned() });
                }
            })?,
        };

        let prepared = self
            .submissions
            .prepare(&mut self.store, &room_code, poll_id, option_index)?;
        self.last_error = None;
        self.submissions
            .spawn(prepared, self.results_tx.clone(), SessionEvent::SubmissionResult);
        Ok(())
    }

    fn on_submission(&mut self, outcome: SubmissionOutcome) {
        match self.submissions.apply(&mut self.store, outcome) {
            SubmissionApplied::Stale => {}
            SubmissionApplied::Accepted { poll_id, option_index, answered } => {
                self.notify(SessionNotice::AnswerAccepted { poll_id, option_index, persisted: answered.persisted });
                self.stop_scheduler_if_idle();
            }
            SubmissionApplied::Rejected { poll_id, error } => {
                let status = ErrorStatus::from_error(&error);
                self.last_error = Some(status.clone());
                self.notify(SessionNotice::AnswerFailed { poll_id, error: status });
            }
        }
    }
}

async fn next_channel_event(subscription: &mut Option<Subscription>) -> Option<ChannelEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
