use super::*;
use crate::storage::{FileStore, MemoryStore};

fn ledger() -> (AnswerLedger, MemoryStore) {
    let store = MemoryStore::new();
    (AnswerLedger::new(Arc::new(store.clone())), store)
}

#[test]
fn key_uses_room_prefix() {
    assert_eq!(AnswerLedger::key("ABCD"), "answeredPolls:ABCD");
}

#[test]
fn load_of_unknown_room_is_empty() {
    let (ledger, _) = ledger();
    assert!(ledger.load("ABCD").unwrap().is_empty());
}

#[test]
fn record_then_get() {
    let (ledger, store) = ledger();
    ledger.record("ABCD", "p1", 1).unwrap();

    assert_eq!(ledger.get("ABCD", "p1").unwrap(), Some(1));
    assert_eq!(ledger.get("ABCD", "p2").unwrap(), None);
    assert_eq!(
        store.get("answeredPolls:ABCD").unwrap().as_deref(),
        Some(r#"{"p1":1}"#)
    );
}

#[test]
fn second_record_for_same_poll_is_rejected_and_not_applied() {
    let (ledger, _) = ledger();
    ledger.record("ABCD", "p1", 1).unwrap();

    let err = ledger.record("ABCD", "p1", 0).unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyAnswered { existing: 1, .. }));
    assert_eq!(ledger.get("ABCD", "p1").unwrap(), Some(1));
    assert_eq!(err.error_code(), "E_ALREADY_ANSWERED");
}

#[test]
fn rooms_are_isolated() {
    let (ledger, _) = ledger();
    ledger.record("ABCD", "p1", 1).unwrap();
    ledger.record("WXYZ", "p1", 0).unwrap();

    assert_eq!(ledger.get("ABCD", "p1").unwrap(), Some(1));
    assert_eq!(ledger.get("WXYZ", "p1").unwrap(), Some(0));
}

#[test]
fn reads_entries_written_by_previous_session() {
    let (_, store) = ledger();
    store.set("answeredPolls:ABCD", r#"{"p1":1,"p2":0}"#).unwrap();

    let reloaded = AnswerLedger::new(Arc::new(store));
    let answers = reloaded.load("ABCD").unwrap();
    assert_eq!(answers.len(), 2);
    assert_eq!(answers.get("p2"), Some(&0));
}

#[test]
fn corrupt_entry_is_reported_and_not_overwritten() {
    let (ledger, store) = ledger();
    store.set("answeredPolls:ABCD", "[1,2").unwrap();

    assert!(matches!(ledger.load("ABCD"), Err(LedgerError::Corrupt { .. })));
    assert!(matches!(ledger.record("ABCD", "p1", 0), Err(LedgerError::Corrupt { .. })));
    assert_eq!(store.get("answeredPolls:ABCD").unwrap().as_deref(), Some("[1,2"));
}

#[test]
fn forget_removes_room_history() {
    let (ledger, _) = ledger();
    ledger.record("ABCD", "p1", 1).unwrap();
    ledger.forget("ABCD").unwrap();
    assert!(ledger.load("ABCD").unwrap().is_empty());
}

#[test]
fn concurrent_records_for_distinct_polls_are_all_kept() {
    let (ledger, _) = ledger();
    let handles = (0..8)
        .map(|i| {
            let ledger = ledger.clone();
            std::thread::spawn(move || ledger.record("ABCD", &format!("p{i}"), i % 2))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(ledger.load("ABCD").unwrap().len(), 8);
}

#[test]
fn ledgers_on_one_store_file_never_overwrite_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let a = AnswerLedger::new(Arc::new(FileStore::open(&path).unwrap()));
    let b = AnswerLedger::new(Arc::new(FileStore::open(&path).unwrap()));

    a.record("ABCD", "p1", 0).unwrap();
    let err = b.record("ABCD", "p1", 1).unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyAnswered { existing: 0, .. }));

    a.record("ROOMX", "q1", 0).unwrap();
    b.record("ROOMY", "q2", 0).unwrap();

    let reopened = AnswerLedger::new(Arc::new(FileStore::open(&path).unwrap()));
    assert_eq!(reopened.get("ABCD", "p1").unwrap(), Some(0));
    assert_eq!(reopened.get("ROOMX", "q1").unwrap(), Some(0));
    assert_eq!(reopened.get("ROOMY", "q2").unwrap(), Some(0));
}
