//! Error handling tests for the record store.

use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use workstream::{ClaimRequest, RecordId, RecordInput, RecordStatus, Store, StoreConfig, StoreError};

fn test_store(dir: &TempDir) -> Store {
    Store::create(StoreConfig::new(dir.path().join("store"))).unwrap()
}

// --- Validation Errors ---

#[test]
fn test_empty_topic_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.append(RecordInput::task("  ", "kind", json!({})));
    assert!(matches!(result, Err(StoreError::Validation(_))));
    assert_eq!(store.stats().record_count, 0);
}

#[test]
fn test_zero_max_attempts_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.append(RecordInput::task("t", "k", json!({})).with_max_attempts(0));
    assert!(matches!(result, Err(StoreError::Validation(_))));
}

#[test]
fn test_bulk_append_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let inputs = vec![
        RecordInput::task("t", "ok", json!({})),
        RecordInput::task("t", "", json!({})),
    ];
    assert!(matches!(
        store.bulk_append(inputs),
        Err(StoreError::Validation(_))
    ));
    assert_eq!(store.stats().record_count, 0);
    assert_eq!(store.bulk_append(Vec::new()).unwrap(), 0);
}

#[test]
fn test_event_without_aggregate_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.append_event("", "account", "opened", json!({}));
    assert!(matches!(result, Err(StoreError::Validation(_))));
    assert_eq!(store.aggregate_version(""), 0);
}

// --- Transition Errors ---

#[test]
fn test_complete_unknown_record() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let id = RecordId::new();
    assert!(matches!(
        store.complete(id, None),
        Err(StoreError::RecordNotFound(missing)) if missing == id
    ));
}

#[test]
fn test_complete_pending_record_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let record = store.append(RecordInput::task("t", "k", json!({}))).unwrap();

    assert!(matches!(
        store.complete(record.id, None),
        Err(StoreError::InvalidTransition { .. })
    ));
    assert_eq!(
        store.get_record(record.id).unwrap().status,
        RecordStatus::Pending
    );
}

#[test]
fn test_double_complete_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.append(RecordInput::task("t", "k", json!({}))).unwrap();

    let claimed = store.claim(&ClaimRequest::new("w1")).unwrap().unwrap();
    store.complete(claimed.id, Some(json!(1))).unwrap();
    let second = store.complete(claimed.id, Some(json!(2)));
    assert!(matches!(second, Err(StoreError::InvalidTransition { .. })));
    assert!(!second.unwrap_err().is_retryable());

    let record = store.get_record(claimed.id).unwrap();
    assert_eq!(record.result, Some(json!(1)));
}

#[test]
fn test_renew_by_other_worker_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.append(RecordInput::task("t", "k", json!({}))).unwrap();

    let claimed = store.claim(&ClaimRequest::new("w1")).unwrap().unwrap();
    let result = store.renew_lease(claimed.id, "w2", Duration::from_secs(60));
    assert!(matches!(result, Err(StoreError::LeaseNotHeld(_))));
}

#[test]
fn test_claim_on_empty_store_is_none() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(store.claim(&ClaimRequest::new("w1")).unwrap().is_none());
    assert!(store
        .claim(&ClaimRequest::new("w1").topic("nothing.here"))
        .unwrap()
        .is_none());
}

// --- Replay Errors ---

#[test]
fn test_snapshot_beyond_current_version() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store
        .append_event("acc-1", "account", "opened", json!({}))
        .unwrap();

    let result = store.save_snapshot("acc-1", 5, json!({}));
    assert!(matches!(result, Err(StoreError::Validation(_))));
    assert!(store.get_latest_snapshot("acc-1").is_none());
}

#[test]
fn test_rebuild_with_mismatched_snapshot_state() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store
        .append_event("acc-1", "account", "opened", json!({}))
        .unwrap();
    store
        .save_snapshot("acc-1", 1, json!("not a number"))
        .unwrap();

    let result: Result<i64, _> = store.rebuild("acc-1", |state, _| state);
    assert!(matches!(result, Err(StoreError::Serialization(_))));
}

#[test]
fn test_catch_up_unregistered_projection() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(matches!(
        store.catch_up_projection("missing"),
        Err(StoreError::ProjectionNotRegistered(name)) if name == "missing"
    ));
}

// --- Store Errors ---

#[test]
fn test_open_nonexistent_store() {
    let dir = TempDir::new().unwrap();

    let result = Store::open(StoreConfig::new(dir.path().join("nonexistent")));
    assert!(result.is_err());

    let mut config = StoreConfig::new(dir.path().join("nonexistent"));
    config.create_if_missing = false;
    assert!(matches!(
        Store::open_or_create(config),
        Err(StoreError::NotInitialized)
    ));
}

#[test]
fn test_concurrent_store_access() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path().join("store"));

    let _store1 = Store::create(config.clone()).unwrap();

    // Second store should fail with lock error
    let result = Store::open(config);
    assert!(matches!(result, Err(StoreError::Locked)));
}

#[test]
fn test_corrupted_manifest() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path().join("store"));
    drop(Store::create(config.clone()).unwrap());

    std::fs::write(dir.path().join("store").join("MANIFEST"), b"JUNK\x01").unwrap();
    assert!(matches!(
        Store::open(config),
        Err(StoreError::InvalidFormat(_))
    ));
}

#[test]
fn test_corruption_before_tail_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path().join("store"));
    {
        let store = Store::create(config.clone()).unwrap();
        store.append(RecordInput::task("t", "a", json!({}))).unwrap();
        store.append(RecordInput::task("t", "b", json!({}))).unwrap();
    }

    // Flip a byte inside the first frame's body; the second frame is intact.
    let log = dir.path().join("store").join("records.log");
    let mut bytes = std::fs::read(&log).unwrap();
    bytes[5 + 4 + 2] ^= 0xFF;
    std::fs::write(&log, &bytes).unwrap();

    assert!(matches!(
        Store::open(config),
        Err(StoreError::ChecksumMismatch { .. })
    ));
}

// --- Boundary Conditions ---

#[test]
fn test_empty_payload() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let record = store
        .append(RecordInput::task("t", "k", serde_json::Value::Null))
        .unwrap();
    assert_eq!(store.get_record(record.id).unwrap().payload, serde_json::Value::Null);
}

#[test]
fn test_unicode_topics() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let handle = store.subscribe_channel("заказы.*", 4);

    store
        .publish("заказы.新しい", "created", json!({ "名前": "テスト" }))
        .unwrap();
    assert!(handle.try_recv().is_ok());

    let claimed = store
        .claim(&ClaimRequest::new("w1").topic("заказы.新しい"))
        .unwrap()
        .unwrap();
    assert_eq!(claimed.payload["名前"], "テスト");
}
