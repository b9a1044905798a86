//! Property tests for claim ordering and retry bounds.

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use workstream::{ClaimRequest, RecordInput, RecordStatus, Store, StoreConfig};

fn test_store(dir: &TempDir) -> Store {
    Store::create(StoreConfig::new(dir.path().join("store")).with_sync_interval(1000)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn should_claim_by_priority_then_sequence(priorities in prop::collection::vec(-3i32..=3, 1..40)) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let inputs = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| RecordInput::task("t", "n", json!({ "i": i })).with_priority(*p))
            .collect();
        store.bulk_append(inputs).unwrap();

        let request = ClaimRequest::new("w1");
        let claimed: Vec<(i32, u64)> = std::iter::from_fn(|| store.claim(&request).unwrap())
            .map(|r| (r.priority, r.sequence.0))
            .collect();

        let mut expected: Vec<(i32, u64)> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, i as u64 + 1))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        prop_assert_eq!(claimed, expected);
    }

    #[test]
    fn should_never_exceed_max_attempts(max_attempts in 1u32..6, failures in 0u32..8) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let record = store
            .append(RecordInput::task("t", "flaky", json!({})).with_max_attempts(max_attempts))
            .unwrap();

        let request = ClaimRequest::new("w1");
        let mut claims = 0;
        while let Some(claimed) = store.claim(&request).unwrap() {
            claims += 1;
            prop_assert!(claimed.attempts <= max_attempts);
            if claims <= failures {
                store.fail(claimed.id, "boom").unwrap();
            } else {
                store.complete(claimed.id, None).unwrap();
            }
        }

        let record = store.get_record(record.id).unwrap();
        prop_assert!(record.attempts <= max_attempts);
        if failures >= max_attempts {
            prop_assert_eq!(record.status, RecordStatus::Failed);
            prop_assert_eq!(claims, max_attempts);
        } else {
            prop_assert_eq!(record.status, RecordStatus::Completed);
            prop_assert_eq!(claims, failures + 1);
        }
    }
}
