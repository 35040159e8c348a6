//! End-to-end pipeline tests against the in-memory store.
//!
//! These cover the full read-then-write sequence:
//! 1. Documents stream out of the store and are keyed
//! 2. The write phase only starts after the cursor is released
//! 3. Bulk updates go out in bounded, ordered batches
//! 4. Failures in either phase stop the run with the right error

use std::sync::Arc;
use std::time::Duration;

use rekey_core::{
    InMemoryStore, KeyDeriver, Pipeline, PipelineConfig, PipelineError, PhaseState, StoreEvent,
};
use serde_json::{json, Value};

fn object_id_hex(i: u64) -> String {
    format!("64f1a2b3{:016x}", i * 7919)
}

/// Documents shaped like the aggregation output: `_id` plus its hex form.
fn documents(n: u64) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"_id": i, "hex": object_id_hex(i), "Day": 20230902}))
        .collect()
}

fn test_config(batch_size: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.write.batch_size = batch_size;
    config.read.prefetch = 64;
    config.progress.supervisor_interval_ms = 25;
    config
}

#[tokio::test]
async fn test_reference_scenario_12345_records() {
    let store = Arc::new(InMemoryStore::new(documents(12_345)));
    let pipeline = Pipeline::new(store.clone(), test_config(5000)).unwrap();

    let report = pipeline.run().await.unwrap();

    assert_eq!(report.records_read, 12_345);
    let sizes: Vec<usize> = report.write.batches.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![5000, 5000, 2345]);
    assert_eq!(store.bulk_call_sizes(), vec![5000, 5000, 2345]);

    let per_batch: u64 = report.write.batches.iter().map(|b| b.modified).sum();
    assert_eq!(report.write.total_modified(), per_batch);
    assert_eq!(report.write.total_modified(), 12_345);

    let deriver = KeyDeriver::default();
    for i in [0u64, 1, 4999, 5000, 12_344] {
        let doc = store.document(&json!(i)).unwrap();
        let expected = deriver.derive(&object_id_hex(i)).unwrap();
        assert_eq!(doc["key"], json!(expected), "document {}", i);
    }
}

#[tokio::test]
async fn test_every_document_updated_exactly_once() {
    let store = Arc::new(InMemoryStore::new(documents(997)));
    let report = Pipeline::new(store.clone(), test_config(100))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.write.records_sent(), 997);
    assert_eq!(report.write.total_matched(), 997);
    for i in 0..997u64 {
        let key = &store.document(&json!(i)).unwrap()["key"];
        assert!(key.as_u64().unwrap() < 43);
    }
}

#[tokio::test(start_paused = true)]
async fn test_no_writes_before_read_phase_ends() {
    let store = Arc::new(
        InMemoryStore::new(documents(40)).with_read_delay(Duration::from_millis(50)),
    );
    let pipeline = Pipeline::new(store.clone(), test_config(16)).unwrap();

    let run = tokio::spawn(async move { pipeline.run().await });

    // The read phase needs 40 * 50ms = 2s; stop well short of that.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.bulk_call_sizes().is_empty());
    assert!(!store.cursor_closed());

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.write.batches.len(), 3);

    let events = store.events();
    let closed_at = events
        .iter()
        .position(|e| matches!(e, StoreEvent::CursorClosed { delivered: 40 }))
        .expect("cursor closed after delivering every document");
    let first_write = events
        .iter()
        .position(|e| matches!(e, StoreEvent::BulkWrite { .. }))
        .unwrap();
    assert!(closed_at < first_write);
    assert_eq!(events[0], StoreEvent::CursorOpened);
}

#[tokio::test]
async fn test_failed_batch_stops_write_phase() {
    let store = Arc::new(InMemoryStore::new(documents(40)).fail_bulk_call(2));
    let (tx, rx) = tokio::sync::watch::channel(PhaseState::Reading);
    let pipeline = Pipeline::new(store.clone(), test_config(10))
        .unwrap()
        .with_phase_observer(tx);

    let err = pipeline.run().await.unwrap_err();

    match err {
        PipelineError::Mutation {
            batch_index,
            batches_applied,
            records_modified,
            ref message,
        } => {
            assert_eq!(batch_index, 2);
            assert_eq!(batches_applied, 2);
            assert_eq!(records_modified, 20);
            assert!(message.contains("injected failure"));
        }
        ref other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.phase(), "write");
    assert_eq!(*rx.borrow(), PhaseState::Failed);

    // Batches 0 and 1 stay applied, batch 3 was never attempted.
    assert_eq!(store.bulk_call_sizes(), vec![10, 10, 10]);
    assert!(store.document(&json!(19)).unwrap().get("key").is_some());
    assert!(store.document(&json!(20)).unwrap().get("key").is_none());
    assert!(store.document(&json!(39)).unwrap().get("key").is_none());
}

#[tokio::test]
async fn test_empty_read_phase_reaches_done() {
    let store = Arc::new(InMemoryStore::new(vec![]));
    let (tx, rx) = tokio::sync::watch::channel(PhaseState::Reading);
    let pipeline = Pipeline::new(store.clone(), test_config(5000))
        .unwrap()
        .with_phase_observer(tx);

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run())
        .await
        .expect("empty run must not hang")
        .unwrap();

    assert_eq!(report.records_read, 0);
    assert!(report.write.batches.is_empty());
    assert!(store.bulk_call_sizes().is_empty());
    assert_eq!(*rx.borrow(), PhaseState::Done);
}

#[tokio::test]
async fn test_malformed_identifier_prevents_all_writes() {
    let mut docs = documents(30);
    docs[12] = json!({"_id": 12, "hex": "64f1zz"});
    let store = Arc::new(InMemoryStore::new(docs));

    let err = Pipeline::new(store.clone(), test_config(5))
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::MalformedIdentifier { record: Some(12), .. }
    ));
    assert_eq!(err.phase(), "read");
    assert!(store.bulk_call_sizes().is_empty());
    assert!(store.cursor_closed());
}

#[tokio::test]
async fn test_query_failure_prevents_all_writes() {
    let store = Arc::new(InMemoryStore::new(documents(5)).fail_aggregate("$toString not allowed"));

    let err = Pipeline::new(store.clone(), test_config(5))
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::QueryExecution(_)));
    assert!(store.bulk_call_sizes().is_empty());
}

#[tokio::test]
async fn test_cursor_failure_prevents_all_writes() {
    let store = Arc::new(InMemoryStore::new(documents(50)).fail_stream_after(25));

    let err = Pipeline::new(store.clone(), test_config(5))
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::QueryExecution(_)));
    assert!(store.bulk_call_sizes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_read_phase() {
    let store = Arc::new(
        InMemoryStore::new(documents(100)).with_read_delay(Duration::from_millis(10)),
    );
    let pipeline = Pipeline::new(store.clone(), test_config(10)).unwrap();
    let token = pipeline.cancellation_token();

    let run = tokio::spawn(async move { pipeline.run().await });
    tokio::time::sleep(Duration::from_millis(305)).await;
    token.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(_)));
    assert!(store.bulk_call_sizes().is_empty());
    assert!(store.cursor_closed());
}
