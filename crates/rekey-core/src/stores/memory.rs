//! In-memory document store.
//!
//! Keeps documents as JSON objects and serves them back in insertion order.
//! The aggregation pipeline is accepted but not interpreted, so fixtures must
//! already carry the hex field. Bulk updates apply `$set` semantics: a
//! document counts as modified only when the field value actually changes.
//!
//! Faults can be injected on the aggregate call, part-way through the cursor,
//! or on the k-th bulk call, and every store interaction is recorded as a
//! [`StoreEvent`] so tests can check read/write ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::traits::{
    AggregateRequest, BulkWriteOutcome, DocumentStore, DocumentStream, SourceDocument,
    UpdateOperation,
};

/// Something that happened against the store, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    CursorOpened,
    CursorClosed { delivered: usize },
    BulkWrite { call: usize, operations: usize },
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Map<String, Value>>,
    by_id: HashMap<String, usize>,
}

/// Releases the cursor (records `CursorClosed`) when the stream is dropped.
struct CursorGuard {
    events: Arc<Mutex<Vec<StoreEvent>>>,
    open: Arc<AtomicBool>,
    delivered: usize,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.events).push(StoreEvent::CursorClosed {
            delivered: self.delivered,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct InMemoryStore {
    name: String,
    id_field: String,
    collection: Mutex<Collection>,
    read_delay: Option<Duration>,
    write_delay: Option<Duration>,
    aggregate_failure: Option<String>,
    stream_failure_after: Option<usize>,
    failing_bulk_call: Option<usize>,
    bulk_calls: AtomicUsize,
    cursor_open: Arc<AtomicBool>,
    events: Arc<Mutex<Vec<StoreEvent>>>,
    requests: Mutex<Vec<AggregateRequest>>,
}

impl InMemoryStore {
    /// Create a store holding `documents`, identified by `_id`.
    ///
    /// Values that are not JSON objects are skipped.
    pub fn new(documents: Vec<Value>) -> Self {
        Self::with_id_field(documents, "_id")
    }

    pub fn with_id_field(documents: Vec<Value>, id_field: &str) -> Self {
        let mut collection = Collection::default();
        for doc in documents {
            if let Value::Object(map) = doc {
                if let Some(id) = map.get(id_field) {
                    collection
                        .by_id
                        .insert(id.to_string(), collection.documents.len());
                }
                collection.documents.push(map);
            }
        }
        Self {
            name: "in-memory".to_string(),
            id_field: id_field.to_string(),
            collection: Mutex::new(collection),
            read_delay: None,
            write_delay: None,
            aggregate_failure: None,
            stream_failure_after: None,
            failing_bulk_call: None,
            bulk_calls: AtomicUsize::new(0),
            cursor_open: Arc::new(AtomicBool::new(false)),
            events: Arc::new(Mutex::new(Vec::new())),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before yielding each document.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Sleep inside each bulk call before applying it.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Make the aggregate call itself fail.
    pub fn fail_aggregate(mut self, message: &str) -> Self {
        self.aggregate_failure = Some(message.to_string());
        self
    }

    /// Yield an error once `n` documents have been delivered.
    pub fn fail_stream_after(mut self, n: usize) -> Self {
        self.stream_failure_after = Some(n);
        self
    }

    /// Fail the bulk call with zero-based index `call`.
    pub fn fail_bulk_call(mut self, call: usize) -> Self {
        self.failing_bulk_call = Some(call);
        self
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        lock(&self.events).clone()
    }

    /// Operation counts of every bulk call attempted, in order.
    pub fn bulk_call_sizes(&self) -> Vec<usize> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                StoreEvent::BulkWrite { operations, .. } => Some(*operations),
                _ => None,
            })
            .collect()
    }

    /// Aggregate requests received, in order.
    pub fn aggregate_requests(&self) -> Vec<AggregateRequest> {
        lock(&self.requests).clone()
    }

    /// True once a cursor was opened and has since been released.
    pub fn cursor_closed(&self) -> bool {
        !self.cursor_open.load(Ordering::SeqCst)
            && lock(&self.events)
                .iter()
                .any(|e| matches!(e, StoreEvent::CursorClosed { .. }))
    }

    /// Current contents of the document with identifier `id`.
    pub fn document(&self, id: &Value) -> Option<Value> {
        let collection = lock(&self.collection);
        collection
            .by_id
            .get(&id.to_string())
            .map(|&pos| Value::Object(collection.documents[pos].clone()))
    }

    pub fn len(&self) -> usize {
        lock(&self.collection).documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<DocumentStream> {
        lock(&self.requests).push(request.clone());
        if let Some(message) = &self.aggregate_failure {
            return Err(PipelineError::QueryExecution(message.clone()));
        }

        let snapshot: Vec<Map<String, Value>> = lock(&self.collection).documents.clone();
        self.cursor_open.store(true, Ordering::SeqCst);
        lock(&self.events).push(StoreEvent::CursorOpened);

        let guard = CursorGuard {
            events: self.events.clone(),
            open: self.cursor_open.clone(),
            delivered: 0,
        };
        let delay = self.read_delay;
        let fail_at = self.stream_failure_after;

        let stream = futures::stream::unfold(
            (snapshot.into_iter(), guard),
            move |(mut docs, mut guard)| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if fail_at == Some(guard.delivered) {
                    guard.delivered += 1;
                    let err = PipelineError::QueryExecution(format!(
                        "cursor failed at document {}",
                        guard.delivered - 1
                    ));
                    return Some((Err(err), (docs, guard)));
                }
                let doc = docs.next()?;
                guard.delivered += 1;
                Some((Ok(SourceDocument(doc)), (docs, guard)))
            },
        );
        Ok(stream.boxed())
    }

    async fn bulk_update(
        &self,
        field: &str,
        operations: &[UpdateOperation],
    ) -> Result<BulkWriteOutcome> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.events).push(StoreEvent::BulkWrite {
            call,
            operations: operations.len(),
        });

        if self.failing_bulk_call == Some(call) {
            return Err(PipelineError::Connection(format!(
                "injected failure on bulk call {}",
                call
            )));
        }

        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut collection = lock(&self.collection);
        let mut outcome = BulkWriteOutcome::default();
        for op in operations {
            let Some(&pos) = collection.by_id.get(&op.id.0.to_string()) else {
                continue;
            };
            outcome.matched_count += 1;
            let value = Value::from(op.key);
            let doc = &mut collection.documents[pos];
            if doc.get(field) != Some(&value) {
                doc.insert(field.to_string(), value);
                outcome.modified_count += 1;
            }
        }
        Ok(outcome)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
