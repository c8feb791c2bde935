use std::time::Duration;

use super::*;
use crate::frame::{JOIN_ROOM, LEAVE_ROOM};
use crate::net::api::MockApi;
use crate::net::channel::Loopback;
use crate::poll::SubmissionState;
use crate::storage::{KeyValueStore, MemoryStore};

// =============================================================================
// HELPERS
// =============================================================================

struct Fixture {
    session: RoomSession,
    loopback: Loopback,
    api: Arc<MockApi>,
    kv: MemoryStore,
    ledger: AnswerLedger,
    notices: broadcast::Receiver<SessionNotice>,
}

fn config() -> SessionConfig {
    SessionConfig { user_id: Some("student-456".into()), ..SessionConfig::default() }
}

fn fixture_with(api: MockApi, config: SessionConfig) -> Fixture {
    let (channel, loopback) = ChannelHandle::loopback();
    let kv = MemoryStore::new();
    let shared: Arc<dyn KeyValueStore> = Arc::new(kv.clone());
    let ledger = AnswerLedger::new(shared.clone());
    let api = Arc::new(api);
    let ctx = SessionContext {
        channel,
        api: api.clone(),
        ledger: ledger.clone(),
        resume: ResumeMarker::new(shared),
        config,
    };
    let session = RoomSession::new(ctx);
    let notices = session.notices.subscribe();
    Fixture { session, loopback, api, kv, ledger, notices }
}

fn fixture() -> Fixture {
    fixture_with(MockApi::new(), config())
}

fn poll_in(room_code: &str, id: &str, timer: u32) -> Poll {
    Poll {
        id: id.into(),
        question: format!("question {id}"),
        options: vec!["A".into(), "B".into(), "C".into()],
        room_code: room_code.into(),
        creator_id: "host-1".into(),
        created_at: String::new(),
        initial_timer_seconds: timer,
    }
}

fn poll(id: &str, timer: u32) -> Poll {
    poll_in("ABCD", id, timer)
}

async fn command<T>(session: &mut RoomSession, build: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
    let (reply, rx) = oneshot::channel();
    session.handle(SessionEvent::Command(build(reply))).await;
    rx.await.unwrap()
}

async fn join(session: &mut RoomSession, room_code: &str) -> Result<SessionSnapshot, SessionError> {
    let room_code = room_code.to_owned();
    command(session, |reply| SessionCommand::Join { room_code, reply }).await
}

async fn leave(session: &mut RoomSession) {
    command(session, |reply| SessionCommand::Leave { reply }).await.unwrap();
}

async fn select(session: &mut RoomSession, poll_id: &str, option_index: usize) -> Result<(), SessionError> {
    let poll_id = poll_id.to_owned();
    command(session, |reply| SessionCommand::Select { poll_id, option_index, reply }).await
}

async fn submit(session: &mut RoomSession, poll_id: &str, option_index: Option<usize>) -> Result<(), SessionError> {
    let poll_id = poll_id.to_owned();
    command(session, |reply| SessionCommand::Submit { poll_id, option_index, reply }).await
}

/// Handle the next result produced by a spawned network task.
async fn settle(session: &mut RoomSession) {
    let event = tokio::time::timeout(Duration::from_secs(5), session.next_result())
        .await
        .unwrap()
        .unwrap();
    session.handle(event).await;
}

/// Join `ABCD` and apply the metadata fetch.
async fn joined() -> Fixture {
    let mut f = fixture();
    join(&mut f.session, "ABCD").await.unwrap();
    settle(&mut f.session).await;
    drain(&mut f.notices);
    f
}

fn drain(rx: &mut broadcast::Receiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        out.push(notice);
    }
    out
}

fn sent(syscall: &str, room_code: &str) -> (String, String) {
    (syscall.to_owned(), room_code.to_owned())
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

#[tokio::test]
async fn join_requests_room_seeds_history_and_saves_resume_marker() {
    let mut f = fixture();
    f.ledger.record("ABCD", "p0", 2).unwrap();

    let snapshot = join(&mut f.session, "ABCD").await.unwrap();

    assert_eq!(snapshot.membership, MembershipState::Joined);
    assert_eq!(snapshot.room_code.as_deref(), Some("ABCD"));
    assert_eq!(snapshot.answered.get("p0"), Some(&2));
    assert_eq!(f.loopback.sent(), vec![sent(JOIN_ROOM, "ABCD")]);
    assert_eq!(f.kv.get("activeRoomCode").unwrap().as_deref(), Some("ABCD"));
    assert_eq!(f.kv.get("joinedRoom").unwrap().as_deref(), Some("true"));
    assert_eq!(drain(&mut f.notices), vec![SessionNotice::Joined { room_code: "ABCD".into() }]);
}

#[tokio::test]
async fn join_fetches_metadata_once() {
    let mut f = fixture();
    join(&mut f.session, "ABCD").await.unwrap();
    assert_eq!(f.session.snapshot().metadata, None);

    settle(&mut f.session).await;
    let metadata = f.session.snapshot().metadata.unwrap();
    assert_eq!(metadata.code, "ABCD");
    assert_eq!(metadata.creator_id, "host-1");
}

#[tokio::test]
async fn metadata_failure_is_not_fatal() {
    let mut f = fixture_with(MockApi::without_rooms(), config());
    join(&mut f.session, "ABCD").await.unwrap();
    settle(&mut f.session).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.metadata, None);
    assert_eq!(snapshot.membership, MembershipState::Joined);
}

#[tokio::test]
async fn metadata_for_previous_room_is_ignored() {
    let mut f = fixture();
    join(&mut f.session, "ABCD").await.unwrap();
    leave(&mut f.session).await;
    join(&mut f.session, "WXYZ").await.unwrap();

    // Both fetches land; only WXYZ applies.
    settle(&mut f.session).await;
    settle(&mut f.session).await;
    assert_eq!(f.session.snapshot().metadata.map(|m| m.code).as_deref(), Some("WXYZ"));
}

#[tokio::test]
async fn second_join_for_same_room_is_a_no_op() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    let snapshot = join(&mut f.session, "ABCD").await.unwrap();

    assert_eq!(snapshot.active_polls.len(), 1);
    assert_eq!(f.loopback.sent(), vec![sent(JOIN_ROOM, "ABCD")]);
    assert!(!drain(&mut f.notices).iter().any(|n| matches!(n, SessionNotice::Joined { .. })));
}

#[tokio::test]
async fn joining_another_room_leaves_the_current_one() {
    let mut f = joined().await;
    join(&mut f.session, "WXYZ").await.unwrap();

    assert_eq!(
        f.loopback.sent(),
        vec![sent(JOIN_ROOM, "ABCD"), sent(LEAVE_ROOM, "ABCD"), sent(JOIN_ROOM, "WXYZ")]
    );
    assert_eq!(
        drain(&mut f.notices),
        vec![
            SessionNotice::Left { room_code: "ABCD".into() },
            SessionNotice::Joined { room_code: "WXYZ".into() },
        ]
    );
}

#[tokio::test]
async fn blank_room_code_is_rejected() {
    let mut f = fixture();
    assert!(matches!(join(&mut f.session, "  ").await, Err(SessionError::InvalidRoomCode)));
    assert!(f.loopback.sent().is_empty());
}

#[tokio::test]
async fn unreadable_history_aborts_join() {
    let mut f = fixture();
    f.kv.set("answeredPolls:ABCD", "not json").unwrap();

    let err = join(&mut f.session, "ABCD").await.unwrap_err();

    assert_eq!(err.error_code(), "E_LEDGER_CORRUPT");
    assert_eq!(f.session.snapshot().membership, MembershipState::Disconnected);
    assert_eq!(f.loopback.sent(), vec![sent(JOIN_ROOM, "ABCD"), sent(LEAVE_ROOM, "ABCD")]);
    assert_eq!(f.kv.get("joinedRoom").unwrap(), None);
}

#[tokio::test]
async fn leave_clears_memory_and_marker_but_keeps_history() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    f.ledger.record("ABCD", "p0", 1).unwrap();

    leave(&mut f.session).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.membership, MembershipState::Disconnected);
    assert_eq!(snapshot.room_code, None);
    assert!(snapshot.active_polls.is_empty());
    assert!(snapshot.answered.is_empty());
    assert_eq!(f.loopback.sent().last(), Some(&sent(LEAVE_ROOM, "ABCD")));
    assert_eq!(f.kv.get("activeRoomCode").unwrap(), None);
    assert_eq!(f.kv.get("joinedRoom").unwrap(), None);
    assert_eq!(f.ledger.get("ABCD", "p0").unwrap(), Some(1));
    assert!(!f.session.scheduler.is_running());
}

#[tokio::test]
async fn leave_without_room_is_harmless() {
    let mut f = fixture();
    leave(&mut f.session).await;
    assert!(f.loopback.sent().is_empty());
    assert!(drain(&mut f.notices).is_empty());
}

// =============================================================================
// POLLS & COUNTDOWN
// =============================================================================

#[tokio::test]
async fn broadcast_for_current_room_becomes_active() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.active_polls.len(), 1);
    assert_eq!(snapshot.active_polls[0].runtime.remaining_seconds, 5);
    assert!(f.session.scheduler.is_running());
    assert_eq!(
        drain(&mut f.notices),
        vec![SessionNotice::PollReceived { poll_id: "p1".into(), question: "question p1".into() }]
    );
}

#[tokio::test]
async fn broadcasts_for_other_rooms_or_before_join_are_ignored() {
    let mut f = fixture();
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    join(&mut f.session, "ABCD").await.unwrap();
    f.session.handle(SessionEvent::PollBroadcast(poll_in("WXYZ", "p2", 5))).await;

    assert!(f.session.snapshot().active_polls.is_empty());
}

#[tokio::test]
async fn ticks_count_down_and_expire_polls() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p2", 2))).await;
    drain(&mut f.notices);

    for _ in 0..2 {
        f.session.handle(SessionEvent::TickElapsed).await;
    }

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.active_polls.len(), 1);
    assert_eq!(snapshot.active_polls[0].poll.id, "p1");
    assert_eq!(snapshot.active_polls[0].runtime.remaining_seconds, 3);
    assert_eq!(drain(&mut f.notices), vec![SessionNotice::PollExpired { poll_id: "p2".into() }]);
}

#[tokio::test]
async fn five_ticks_without_answer_expire_poll_for_good() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    for _ in 0..5 {
        f.session.handle(SessionEvent::TickElapsed).await;
    }

    assert!(f.session.snapshot().active_polls.is_empty());
    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), None);
    assert!(!f.session.scheduler.is_running());
    assert!(matches!(
        select(&mut f.session, "p1", 0).await,
        Err(SessionError::Validation(ValidationError::NotActive { .. }))
    ));

    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    assert!(f.session.snapshot().active_polls.is_empty());
}

#[tokio::test]
async fn zero_timer_poll_expires_on_arrival() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 0))).await;

    assert!(f.session.snapshot().active_polls.is_empty());
    assert_eq!(drain(&mut f.notices), vec![SessionNotice::PollExpired { poll_id: "p1".into() }]);
    assert!(select(&mut f.session, "p1", 0).await.is_err());
}

#[tokio::test]
async fn redelivered_poll_answered_before_reload_is_discarded() {
    let mut f = fixture();
    f.ledger.record("ABCD", "p1", 1).unwrap();
    join(&mut f.session, "ABCD").await.unwrap();

    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    assert!(f.session.snapshot().active_polls.is_empty());
    assert!(!drain(&mut f.notices).iter().any(|n| matches!(n, SessionNotice::PollReceived { .. })));
}

#[tokio::test(start_paused = true)]
async fn wall_clock_mode_counts_elapsed_time() {
    let mut f = fixture_with(MockApi::new(), SessionConfig { countdown: CountdownMode::WallClock, ..config() });
    join(&mut f.session, "ABCD").await.unwrap();
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 10))).await;

    // One late tick after four seconds of stall.
    tokio::time::advance(Duration::from_millis(4200)).await;
    f.session.handle(SessionEvent::TickElapsed).await;

    assert_eq!(f.session.snapshot().active_polls[0].runtime.remaining_seconds, 6);
}

#[tokio::test]
async fn connection_changes_reach_snapshot_and_notices() {
    let mut f = joined().await;
    f.session
        .handle(SessionEvent::ConnectionChanged(ConnectionStatus::Disconnected))
        .await;

    assert_eq!(f.session.snapshot().connection, ConnectionStatus::Disconnected);
    assert_eq!(
        drain(&mut f.notices),
        vec![SessionNotice::ConnectionChanged { status: ConnectionStatus::Disconnected }]
    );
}

fn refusal(syscall: &str, room_code: &str) -> SessionEvent {
    SessionEvent::RequestRefused(ChannelError::Refused {
        syscall: syscall.into(),
        room_code: room_code.into(),
        message: "room not found".into(),
    })
}

#[tokio::test]
async fn refused_join_leaves_room_and_reports_reason() {
    let mut f = joined().await;
    f.session.handle(refusal(JOIN_ROOM, "ABCD")).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.membership, MembershipState::Disconnected);
    assert_eq!(snapshot.room_code, None);
    assert_eq!(snapshot.last_error.as_ref().map(|e| e.code), Some("E_REFUSED"));
    assert_eq!(f.kv.get("joinedRoom").unwrap(), None);

    let notices = drain(&mut f.notices);
    assert_eq!(notices.first(), Some(&SessionNotice::Left { room_code: "ABCD".into() }));
    let Some(SessionNotice::JoinRefused { room_code, error }) = notices.last() else {
        panic!("expected join refusal notice");
    };
    assert_eq!(room_code, "ABCD");
    assert!(error.message.contains("room not found"));
}

#[tokio::test]
async fn refusal_for_other_room_or_leave_is_only_logged() {
    let mut f = joined().await;
    f.session.handle(refusal(JOIN_ROOM, "WXYZ")).await;
    f.session.handle(refusal(LEAVE_ROOM, "ABCD")).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.membership, MembershipState::Joined);
    assert_eq!(snapshot.last_error, None);
    assert!(drain(&mut f.notices).is_empty());
}

#[tokio::test]
async fn refusal_from_channel_reaches_running_session() {
    let f = fixture();
    let loopback = f.loopback;
    let handle = f.session.spawn();
    let mut snapshots = handle.snapshots();
    handle.join("ABCD").await.unwrap();

    loopback.inject(ChannelEvent::RequestRefused {
        syscall: JOIN_ROOM.into(),
        room_code: "ABCD".into(),
        message: "room not found".into(),
    });

    tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.last_error.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.snapshot().membership, MembershipState::Disconnected);
}

// =============================================================================
// ANSWERS
// =============================================================================

#[tokio::test]
async fn select_then_submit_selected_records_answer() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    select(&mut f.session, "p1", 1).await.unwrap();
    assert_eq!(f.session.snapshot().active_polls[0].runtime.selected_option_index, Some(1));

    submit(&mut f.session, "p1", None).await.unwrap();
    assert_eq!(f.session.snapshot().active_polls[0].runtime.submission_state, SubmissionState::Pending);

    settle(&mut f.session).await;

    let snapshot = f.session.snapshot();
    assert!(snapshot.active_polls.is_empty());
    assert_eq!(snapshot.answered.get("p1"), Some(&1));
    assert_eq!(f.session.store.submission_state("p1"), SubmissionState::Submitted);
    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), Some(1));
    assert_eq!(f.api.submitted()[0].1.answer_index, 1);
    assert!(drain(&mut f.notices).contains(&SessionNotice::AnswerAccepted {
        poll_id: "p1".into(),
        option_index: 1,
        persisted: true,
    }));
}

#[tokio::test]
async fn submit_selected_without_selection_asks_for_one() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    drain(&mut f.notices);

    let err = submit(&mut f.session, "p1", None).await.unwrap_err();

    assert!(matches!(err, SessionError::Validation(ValidationError::NoSelection { .. })));
    assert_eq!(drain(&mut f.notices), vec![SessionNotice::SelectionRequired { poll_id: "p1".into() }]);
    assert!(f.api.submitted().is_empty());
}

#[tokio::test]
async fn invalid_option_never_reaches_network() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    assert!(select(&mut f.session, "p1", 7).await.is_err());
    let err = submit(&mut f.session, "p1", Some(7)).await.unwrap_err();

    assert_eq!(err.error_code(), "E_INVALID_OPTION");
    assert!(f.api.submitted().is_empty());
}

#[tokio::test]
async fn failed_submission_keeps_poll_open_for_retry() {
    let mut f = joined().await;
    f.api.queue_submit_result(Err(ApiError::Rejected { status: 503, message: "busy".into() }));
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    submit(&mut f.session, "p1", Some(1)).await.unwrap();
    settle(&mut f.session).await;

    let snapshot = f.session.snapshot();
    assert_eq!(snapshot.active_polls[0].runtime.submission_state, SubmissionState::Failed);
    assert_eq!(snapshot.last_error.as_ref().map(|e| e.code), Some("E_SERVER"));
    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), None);
    assert!(drain(&mut f.notices).iter().any(|n| matches!(n, SessionNotice::AnswerFailed { .. })));

    submit(&mut f.session, "p1", Some(2)).await.unwrap();
    settle(&mut f.session).await;
    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), Some(2));
    assert_eq!(f.session.snapshot().last_error, None);
}

#[tokio::test]
async fn double_submit_is_rejected_while_pending() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;

    submit(&mut f.session, "p1", Some(0)).await.unwrap();
    let err = submit(&mut f.session, "p1", Some(1)).await.unwrap_err();
    assert_eq!(err.error_code(), "E_SUBMISSION_PENDING");

    settle(&mut f.session).await;
    assert_eq!(f.api.submitted().len(), 1);
    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), Some(0));
}

#[tokio::test]
async fn result_arriving_after_leave_is_ignored() {
    let mut f = joined().await;
    f.session.handle(SessionEvent::PollBroadcast(poll("p1", 5))).await;
    submit(&mut f.session, "p1", Some(0)).await.unwrap();

    leave(&mut f.session).await;
    settle(&mut f.session).await;

    assert_eq!(f.ledger.get("ABCD", "p1").unwrap(), None);
    assert!(f.session.snapshot().answered.is_empty());
}

#[tokio::test]
async fn commands_require_a_room() {
    let mut f = fixture();
    assert!(matches!(select(&mut f.session, "p1", 0).await, Err(SessionError::NotJoined)));
    assert!(matches!(submit(&mut f.session, "p1", Some(0)).await, Err(SessionError::NotJoined)));
}

// =============================================================================
// SPAWNED SESSION
// =============================================================================

#[tokio::test]
async fn spawned_session_round_trip() {
    let f = fixture();
    let loopback = f.loopback;
    let ledger = f.ledger;
    let handle = f.session.spawn();
    let mut snapshots = handle.snapshots();

    handle.join("ABCD").await.unwrap();
    loopback.inject(ChannelEvent::PollBroadcast(poll("p1", 30)));

    tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.active_polls.len() == 1))
        .await
        .unwrap()
        .unwrap();

    handle.select("p1", 2).await.unwrap();
    handle.submit_selected("p1").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.answered.contains_key("p1")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.get("ABCD", "p1").unwrap(), Some(2));

    handle.leave().await.unwrap();
    assert_eq!(handle.snapshot().membership, MembershipState::Disconnected);
}

#[tokio::test]
async fn dropping_last_handle_leaves_room() {
    let f = fixture();
    let loopback = f.loopback;
    let handle = f.session.spawn();
    handle.join("ABCD").await.unwrap();
    drop(handle);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !loopback.sent().contains(&sent(LEAVE_ROOM, "ABCD")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(f.kv.get("joinedRoom").unwrap(), None);
}

#[tokio::test]
async fn detach_stops_session_but_keeps_room_for_resume() {
    let f = fixture();
    let loopback = f.loopback;
    let handle = f.session.spawn();
    handle.join("ABCD").await.unwrap();

    handle.detach().await.unwrap();
    let other = handle.clone();
    drop(handle);

    // Task is gone without sending leave.
    assert!(matches!(other.leave().await, Err(SessionError::Stopped)));
    assert!(!loopback.sent().contains(&sent(LEAVE_ROOM, "ABCD")));
    assert_eq!(f.kv.get("activeRoomCode").unwrap().as_deref(), Some("ABCD"));
    assert_eq!(f.kv.get("joinedRoom").unwrap().as_deref(), Some("true"));
    assert_eq!(ResumeMarker::new(Arc::new(f.kv.clone())).load().unwrap().as_deref(), Some("ABCD"));
}
