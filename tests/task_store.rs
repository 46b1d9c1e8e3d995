//! Task Store Integration Tests
//!
//! Tests for atomic claiming across connections, ordering, staging and
//! deletion against an on-disk database.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use aftershock::core::{SqliteTaskStore, TaskStore, TaskStoreError};
use aftershock::domain::{NewTask, Opcode, TaskId, EXEC_TIME_CLAIMED};
use tempfile::TempDir;

fn task(event_id: &str, sched_time: i64) -> NewTask {
    NewTask::new(Opcode::NoOp, event_id, sched_time, 1, "test")
}

#[test]
fn test_concurrent_claims_never_duplicate() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("tasks.db");

    let store = SqliteTaskStore::open(&path).unwrap();
    let mut submitted = HashSet::new();
    for i in 0..200 {
        submitted.insert(store.submit(task("ev1", 1_000 + i)).unwrap());
    }

    // Separate connections stand in for separate processes
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let store = SqliteTaskStore::open(&path).unwrap();
                let mut claimed = Vec::new();
                while let Some(record) = store.claim_ready(i64::MAX).unwrap() {
                    claimed.push(record.id);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "{} claimed twice", id);
        }
    }
    assert_eq!(seen, submitted);

    // Every record is now marked claimed
    let claimed = store.range_query(EXEC_TIME_CLAIMED, EXEC_TIME_CLAIMED, None).unwrap();
    assert_eq!(claimed.len(), 200);
}

#[test]
fn test_shared_store_across_threads() {
    let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
    for i in 0..50 {
        store.submit(task("ev1", 10 + i)).unwrap();
    }

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let mut count = 0;
                while store.claim_ready(i64::MAX).unwrap().is_some() {
                    count += 1;
                }
                count
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 50);
}

#[test]
fn test_claim_returns_earliest_due() {
    let store = SqliteTaskStore::in_memory().unwrap();
    store.submit(task("ev1", 300)).unwrap();
    let earliest = store.submit(task("ev2", 100)).unwrap();
    store.submit(task("ev3", 200)).unwrap();

    let record = store.claim_ready(1_000).unwrap().unwrap();
    assert_eq!(record.id, earliest);
    assert_eq!(record.event_id, "ev2");
    // The returned record carries its exec time from before the claim
    assert_eq!(record.exec_time, 100);

    assert_eq!(store.claim_ready(1_000).unwrap().unwrap().event_id, "ev3");
    assert_eq!(store.claim_ready(250).unwrap(), None);
}

#[test]
fn test_stage_rearms_claimed_record() {
    let store = SqliteTaskStore::in_memory().unwrap();
    let id = store
        .submit(task("ev1", 100).with_details("{\"x\":1}".to_string()))
        .unwrap();

    let record = store.claim_ready(100).unwrap().unwrap();
    store.stage(record.id, 500, 3, None).unwrap();

    assert!(store.claim_ready(499).unwrap().is_none());
    let again = store.claim_ready(500).unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.stage, 3);
    assert_eq!(again.sched_time, 100);
    assert_eq!(again.details.as_deref(), Some("{\"x\":1}"));

    let err = store.stage(id, 0, 4, None).unwrap_err();
    assert!(matches!(err, TaskStoreError::InvalidArgument(_)));
}

#[test]
fn test_deleted_record_is_gone() {
    let store = SqliteTaskStore::in_memory().unwrap();
    let id = store.submit(task("ev1", 100)).unwrap();

    store.delete(id).unwrap();
    assert!(store.claim_ready(i64::MAX).unwrap().is_none());
    assert!(store.range_query(i64::MIN, i64::MAX, None).unwrap().is_empty());
    assert!(matches!(
        store.delete(id),
        Err(TaskStoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_ids_are_never_reused() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("tasks.db");

    let first = {
        let store = SqliteTaskStore::open(&path).unwrap();
        let id = store.submit(task("ev1", 100)).unwrap();
        store.delete(id).unwrap();
        id
    };

    let store = SqliteTaskStore::open(&path).unwrap();
    let second: TaskId = store.submit(task("ev1", 100)).unwrap();
    assert_ne!(first, second);
    assert!(second.get() > first.get());
}

#[test]
fn test_range_query_filters_by_event() {
    let store = SqliteTaskStore::in_memory().unwrap();
    store.submit(task("ev1", 100)).unwrap();
    store.submit(task("ev2", 150)).unwrap();
    store.submit(task("ev1", 200)).unwrap();

    let ev1 = store.range_query(0, 1_000, Some("ev1")).unwrap();
    assert_eq!(ev1.iter().map(|t| t.exec_time).collect::<Vec<_>>(), vec![100, 200]);

    let window = store.range_query(120, 180, None).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].event_id, "ev2");
}

#[test]
fn test_identical_submits_get_distinct_ids() {
    let store = SqliteTaskStore::in_memory().unwrap();
    let first = store.submit(task("ev1", 100)).unwrap();
    let second = store.submit(task("ev1", 100)).unwrap();

    assert_ne!(first, second);
    assert_eq!(store.range_query(100, 100, Some("ev1")).unwrap().len(), 2);
}
