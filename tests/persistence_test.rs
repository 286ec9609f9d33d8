//! Integration tests for durability: reload across instances, crash
//! recovery, corrupt data, write failures, and the SQLite backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use offline_queue::config::DEFAULT_STORAGE_KEY;
use offline_queue::persistence;
use offline_queue::*;
use serde_json::json;

fn config() -> QueueConfig {
    QueueConfig::default().with_retry_interval(Duration::ZERO)
}

fn queue_over(store: &MemoryStore) -> OfflineQueue {
    OfflineQueue::new(config(), Arc::new(store.clone())).expect("failed to build queue")
}

/// A store whose writes always fail.
struct BrokenStore;

impl KvStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Other("disk full".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::Other("disk full".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Reload
// ---------------------------------------------------------------------------

#[test]
fn records_survive_a_new_instance() {
    let store = MemoryStore::new();
    let first = queue_over(&store);
    first
        .add(
            NewOperation::new("sync")
                .payload(json!({"x": 1}))
                .metadata(json!({"origin": "test"})),
        )
        .unwrap();
    first.add(NewOperation::new("urgent").priority(9)).unwrap();
    let cancelled = first.add(NewOperation::new("dropped")).unwrap();
    first.cancel(cancelled.id);

    let second = queue_over(&store);
    assert_eq!(second.get_all(), first.get_all());
}

#[test]
fn snapshot_is_versioned_under_the_storage_key() {
    let store = MemoryStore::new();
    let q = OfflineQueue::new(config().with_storage_key("app:outbox"), Arc::new(store.clone()))
        .unwrap();
    q.add(NewOperation::new("a")).unwrap();

    assert!(store.get(DEFAULT_STORAGE_KEY).unwrap().is_none());
    let raw = store.get("app:outbox").unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["version"], persistence::SNAPSHOT_VERSION);
    assert_eq!(value["operations"][0]["operation_type"], "a");
}

#[tokio::test]
async fn processing_record_recovers_as_pending() {
    let store = MemoryStore::new();
    let q = queue_over(&store);
    let op = q.add(NewOperation::new("sync")).unwrap();

    // Simulate a crash mid-handler: the persisted snapshot says processing.
    let mut crashed = q.get(op.id).unwrap();
    crashed.status = Status::Processing;
    store
        .set(DEFAULT_STORAGE_KEY, &persistence::encode([&crashed]).unwrap())
        .unwrap();

    let restarted = queue_over(&store);
    let recovered = restarted.get(op.id).unwrap();
    assert_eq!(recovered.status, Status::Pending);
    assert_eq!(restarted.get_state().processing_count, 0);

    // Recovered work is picked up by the next run.
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let handler = handler_fn(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    restarted.process(Arc::new(handler)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn recovered_snapshot_is_rewritten() {
    let store = MemoryStore::new();
    let q = queue_over(&store);
    let mut op = q.add(NewOperation::new("sync")).unwrap();
    op.status = Status::Processing;
    store
        .set(DEFAULT_STORAGE_KEY, &persistence::encode([&op]).unwrap())
        .unwrap();

    queue_over(&store);

    let raw = store.get(DEFAULT_STORAGE_KEY).unwrap().unwrap();
    let on_disk = persistence::decode(&raw).unwrap();
    assert_eq!(on_disk[0].status, Status::Pending);
}

#[tokio::test]
async fn retry_state_survives_reload() {
    let store = MemoryStore::new();
    let q = queue_over(&store);
    let op = q.add(NewOperation::new("sync").max_retries(3)).unwrap();
    q.process(Arc::new(handler_fn(|_| async {
        Err(anyhow::anyhow!("connection refused"))
    })))
    .await
    .unwrap();

    let reloaded = queue_over(&store).get(op.id).unwrap();
    assert_eq!(reloaded.status, Status::Pending);
    assert_eq!(reloaded.retry_count, 1);
    assert_eq!(reloaded.error.as_deref(), Some("connection refused"));
}

#[test]
fn legacy_bare_array_loads() {
    let store = MemoryStore::new();
    let op = queue_over(&MemoryStore::new())
        .add(NewOperation::new("legacy"))
        .unwrap();
    store
        .set(DEFAULT_STORAGE_KEY, &serde_json::to_string(&vec![&op]).unwrap())
        .unwrap();

    let q = queue_over(&store);
    assert_eq!(q.get_all(), vec![op]);
}

// ---------------------------------------------------------------------------
// Capacity after reload
// ---------------------------------------------------------------------------

/// Three records saved under a roomy config, one of them failed.
async fn three_saved_records(store: &MemoryStore) -> (OperationId, OperationId, OperationId) {
    let q = queue_over(store);
    let failed = q.add(NewOperation::new("doomed").max_retries(1)).unwrap();
    q.process(Arc::new(handler_fn(|op: Operation| async move {
        anyhow::ensure!(op.operation_type != "doomed", "HTTP 500");
        Ok(())
    })))
    .await
    .unwrap();
    let a = q.add(NewOperation::new("a")).unwrap();
    let b = q.add(NewOperation::new("b")).unwrap();
    assert_eq!(q.get(failed.id).unwrap().status, Status::Failed);
    (failed.id, a.id, b.id)
}

#[tokio::test]
async fn add_over_a_shrunk_limit_evicts_down_to_max_size() {
    let store = MemoryStore::new();
    let (failed, a, b) = three_saved_records(&store).await;

    // Two pending records already fill max_size = 2; evicting the one failed
    // record is not enough room.
    let q = OfflineQueue::new(config().with_max_size(2), Arc::new(store.clone())).unwrap();
    assert_eq!(q.len(), 3);
    let err = q.add(NewOperation::new("new")).unwrap_err();
    assert!(matches!(err, Error::QueueFull { max_size: 2 }));
    assert_eq!(q.len(), 3);
    assert!(q.get(failed).is_some(), "a rejected add evicts nothing");

    // With max_size = 3 the failed record makes room.
    let q = OfflineQueue::new(config().with_max_size(3), Arc::new(store.clone())).unwrap();
    q.add(NewOperation::new("new")).unwrap();
    assert_eq!(q.len(), 3);
    assert!(q.get(failed).is_none());
    assert!(q.get(a).is_some() && q.get(b).is_some());
}

#[tokio::test]
async fn add_evicts_several_failed_records_when_over_limit() {
    let store = MemoryStore::new();
    let q = queue_over(&store);
    let doomed: Vec<_> = (0..3)
        .map(|_| q.add(NewOperation::new("doomed").max_retries(1)).unwrap().id)
        .collect();
    let kept = q.add(NewOperation::new("kept").max_retries(5)).unwrap();
    q.process(Arc::new(handler_fn(|_| async { Err(anyhow::anyhow!("HTTP 500")) })))
        .await
        .unwrap();
    assert_eq!(q.get_failed().len(), 3);

    let q = OfflineQueue::new(config().with_max_size(2), Arc::new(store.clone())).unwrap();
    let new = q.add(NewOperation::new("new")).unwrap();

    assert_eq!(q.len(), 2);
    assert!(doomed.iter().all(|id| q.get(*id).is_none()));
    assert!(q.get(kept.id).is_some());
    assert!(q.get(new.id).is_some());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[test]
fn corrupt_snapshot_starts_empty() {
    let store = MemoryStore::new();
    store.set(DEFAULT_STORAGE_KEY, "{\"version\": 1, \"operations\": [{").unwrap();

    let q = queue_over(&store);
    assert!(q.is_empty());

    // The next mutation replaces the garbage.
    q.add(NewOperation::new("a")).unwrap();
    assert_eq!(queue_over(&store).len(), 1);
}

#[test]
fn unknown_snapshot_version_starts_empty() {
    let store = MemoryStore::new();
    store
        .set(DEFAULT_STORAGE_KEY, r#"{"version": 2, "operations": []}"#)
        .unwrap();
    assert!(queue_over(&store).is_empty());
}

#[test]
fn write_failures_do_not_fail_mutations() {
    let q = OfflineQueue::new(config(), Arc::new(BrokenStore)).unwrap();
    let op = q.add(NewOperation::new("a")).unwrap();

    assert!(q.cancel(op.id));
    assert_eq!(q.cleanup(), 1);
    assert!(!q.flush());
}

#[tokio::test]
async fn close_reports_a_failed_final_write() {
    let q = OfflineQueue::new(config(), Arc::new(BrokenStore)).unwrap();
    q.add(NewOperation::new("a")).unwrap();
    assert!(q.close().await.is_err());
}

#[test]
fn disabled_persistence_writes_nothing() {
    let store = MemoryStore::new();
    let q = OfflineQueue::new(config().with_persistence(false), Arc::new(store.clone())).unwrap();
    q.add(NewOperation::new("a")).unwrap();

    assert!(store.get(DEFAULT_STORAGE_KEY).unwrap().is_none());
}

#[test]
fn clear_erases_the_slot() {
    let store = MemoryStore::new();
    let q = queue_over(&store);
    q.add(NewOperation::new("a")).unwrap();
    q.clear();

    assert!(store.get(DEFAULT_STORAGE_KEY).unwrap().is_none());
    assert!(queue_over(&store).is_empty());
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offq.db");

    let id = {
        let q = OfflineQueue::new(config(), Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
        let op = q
            .add(NewOperation::new("sync").payload(json!({"x": 1})).priority(3))
            .unwrap();
        q.close().await.unwrap();
        op.id
    };

    let q = OfflineQueue::new(config(), Arc::new(SqliteStore::open(&path).unwrap())).unwrap();
    let op = q.get(id).expect("record reloaded from sqlite");
    assert_eq!(op.payload, json!({"x": 1}));
    assert_eq!(op.priority, 3);
    assert_eq!(op.status, Status::Pending);
}
