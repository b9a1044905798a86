//! Concurrent access from many threads sharing one store.

use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use workstream::{
    ClaimRequest, Notification, RecordInput, RecordStatus, Sequence, Store, StoreConfig,
};

const THREADS: usize = 8;

fn shared_store(dir: &TempDir) -> Arc<Store> {
    Arc::new(
        Store::create(StoreConfig::new(dir.path().join("store")).with_sync_interval(100)).unwrap(),
    )
}

/// Run `f(thread_index)` on `THREADS` threads released together.
fn in_parallel<T, F>(f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f(i)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_concurrent_claims_never_share_a_record() {
    let dir = TempDir::new().unwrap();
    let store = shared_store(&dir);
    let inputs = (0..2_000)
        .map(|n| RecordInput::task("jobs", "n", json!({ "n": n })))
        .collect();
    store.bulk_append(inputs).unwrap();

    let claimed = {
        let store = Arc::clone(&store);
        in_parallel(move |i| {
            let request = ClaimRequest::new(format!("w{i}"));
            let mut mine = Vec::new();
            while let Some(record) = store.claim(&request).unwrap() {
                assert_eq!(record.lease_owner.as_deref(), Some(request.worker_id.as_str()));
                mine.push(record.id);
            }
            mine
        })
    };

    let all: Vec<_> = claimed.into_iter().flatten().collect();
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 2_000);
    assert_eq!(unique.len(), 2_000);
    assert_eq!(store.metrics().leased, 2_000);
}

#[test]
fn test_concurrent_appends_get_distinct_contiguous_sequences() {
    let dir = TempDir::new().unwrap();
    let store = shared_store(&dir);

    let per_thread = {
        let store = Arc::clone(&store);
        in_parallel(move |i| {
            let mut sequences = Vec::new();
            for n in 0..250 {
                let record = store
                    .append(RecordInput::task(format!("t{i}"), "n", json!({ "n": n })))
                    .unwrap();
                sequences.push(record.sequence.0);
            }
            sequences
        })
    };

    // Each thread observes its own sequences increasing.
    for sequences in &per_thread {
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    let mut all: Vec<u64> = per_thread.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<u64> = (1..=(THREADS as u64 * 250)).collect();
    assert_eq!(all, expected);
    assert_eq!(store.head(), Sequence(THREADS as u64 * 250));
}

#[test]
fn test_concurrent_events_on_one_aggregate() {
    let dir = TempDir::new().unwrap();
    let store = shared_store(&dir);

    {
        let store = Arc::clone(&store);
        in_parallel(move |i| {
            for n in 0..50 {
                store
                    .append_event("acc-1", "account", "touched", json!({ "thread": i, "n": n }))
                    .unwrap();
            }
        });
    }

    let events = store.get_aggregate_events("acc-1", 0);
    assert_eq!(events.len(), THREADS * 50);
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.aggregate_version, Some(index as u64 + 1));
    }
    // Versions follow the global order.
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn test_subscriber_sees_every_concurrent_append() {
    let dir = TempDir::new().unwrap();
    let store = shared_store(&dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        store.subscribe("*", move |notification: &Notification| {
            if let Notification::RecordAppended { record } = notification {
                seen.lock().unwrap().push(record.sequence);
            }
        });
    }

    {
        let store = Arc::clone(&store);
        in_parallel(move |i| {
            for n in 0..100 {
                store
                    .publish(format!("chan.{i}"), "tick", json!({ "n": n }))
                    .unwrap();
            }
        });
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), THREADS * 100);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), THREADS * 100);
}

#[test]
fn test_expired_lease_is_reclaimed_by_another_worker() {
    let dir = TempDir::new().unwrap();
    let store = shared_store(&dir);
    let record = store
        .append(RecordInput::task("jobs", "slow", json!({})))
        .unwrap();

    let first = store
        .claim(&ClaimRequest::new("w1").lease(Duration::from_millis(200)))
        .unwrap()
        .unwrap();
    assert_eq!(first.id, record.id);
    assert!(store.claim(&ClaimRequest::new("w2")).unwrap().is_none());

    thread::sleep(Duration::from_millis(300));
    let second = store.claim(&ClaimRequest::new("w2")).unwrap().unwrap();
    assert_eq!(second.id, record.id);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.lease_owner.as_deref(), Some("w2"));

    // The first worker no longer holds the lease.
    assert!(store.renew_lease(record.id, "w1", Duration::from_secs(1)).is_err());
    store.complete(record.id, None).unwrap();
    assert_eq!(
        store.get_record(record.id).unwrap().status,
        RecordStatus::Completed
    );
}
