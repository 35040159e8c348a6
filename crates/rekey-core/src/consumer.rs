//! Read phase: stream documents out of the store and derive their keys.
//!
//! ```text
//! store.aggregate() ──▶ cursor task ──mpsc(prefetch)──▶ derive loop ──▶ RecordBuffer
//!                                                                 │
//!                                                    CompletionSignal::complete()
//! ```
//!
//! The cursor runs in its own task and reads ahead by at most `prefetch`
//! documents. The derive loop owns the buffer; once the cursor is exhausted
//! and its task has ended, the buffer is handed to the phase coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::{DerivedRecord, RecordBuffer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::key::KeyDeriver;
use crate::phase::CompletionSignal;
use crate::traits::{AggregateRequest, DocumentStore, DocumentStream, SourceDocument};

/// Map any store-side read failure to `QueryExecution`.
fn query_error(e: PipelineError) -> PipelineError {
    match e {
        e @ (PipelineError::QueryExecution(_) | PipelineError::Cancelled(_)) => e,
        other => PipelineError::QueryExecution(other.to_string()),
    }
}

/// Drives the read phase against a document store.
pub struct StreamConsumer {
    store: Arc<dyn DocumentStore>,
    request: AggregateRequest,
    deriver: KeyDeriver,
    id_field: String,
    hex_field: String,
    prefetch: usize,
    log_every: u64,
    records_read: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl StreamConsumer {
    /// Create a consumer with default field names (`_id`, `hex`).
    pub fn new(store: Arc<dyn DocumentStore>, request: AggregateRequest, deriver: KeyDeriver) -> Self {
        Self {
            store,
            request,
            deriver,
            id_field: "_id".to_string(),
            hex_field: "hex".to_string(),
            prefetch: 10_000,
            log_every: 1000,
            records_read: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Build a consumer from a validated configuration.
    pub fn from_config(store: Arc<dyn DocumentStore>, config: &PipelineConfig) -> Result<Self> {
        let request = AggregateRequest {
            pipeline: config.query.stages(),
            allow_disk_use: config.query.allow_disk_use,
            batch_size: config.query.cursor_batch_size,
        };
        let deriver = KeyDeriver::new(config.key.modulus)?;
        Ok(Self::new(store, request, deriver)
            .with_fields(&config.query.id_field, &config.query.hex_field)
            .with_prefetch(config.read.prefetch)
            .with_log_every(config.progress.log_every))
    }

    pub fn with_fields(mut self, id_field: &str, hex_field: &str) -> Self {
        self.id_field = id_field.to_string();
        self.hex_field = hex_field.to_string();
        self
    }

    /// Bounded to `[1, Semaphore::MAX_PERMITS]`, the range tokio channels accept.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    /// Share a counter of records consumed so far.
    pub fn with_progress(mut self, records_read: Arc<AtomicU64>) -> Self {
        self.records_read = records_read;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the read phase to completion and hand the buffer to `signal`.
    ///
    /// Returns the number of records read. Any error aborts the whole read
    /// phase; the signal is then dropped without completing.
    pub async fn run(self, signal: CompletionSignal) -> Result<u64> {
        info!(store = self.store.name(), "starting the aggregation");
        let stream = self.store.aggregate(&self.request).await.map_err(query_error)?;

        let (tx, mut rx) = mpsc::channel(self.prefetch);
        let cursor = tokio::spawn(forward_cursor(stream, tx, self.cancel.clone()));

        let mut buffer = RecordBuffer::new();
        let outcome = self.drain(&mut rx, &mut buffer).await;
        drop(rx);

        match outcome {
            Ok(()) => {
                cursor
                    .await
                    .map_err(|e| PipelineError::Runtime(format!("cursor task failed: {}", e)))?;
            }
            Err(e) => {
                cursor.abort();
                let _ = cursor.await;
                return Err(e);
            }
        }

        let records = signal.complete(buffer)?;
        info!(records, "read phase complete");
        Ok(records as u64)
    }

    async fn drain(
        &self,
        rx: &mut mpsc::Receiver<Result<SourceDocument>>,
        buffer: &mut RecordBuffer,
    ) -> Result<()> {
        let mut index: u64 = 0;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(PipelineError::Cancelled(format!(
                        "read phase cancelled at record {}",
                        index
                    )));
                }
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                return Ok(());
            };
            let doc = item.map_err(|e| match query_error(e) {
                PipelineError::QueryExecution(message) => PipelineError::QueryExecution(format!(
                    "cursor failed at record {}: {}",
                    index, message
                )),
                other => other,
            })?;

            if index % self.log_every == 0 {
                info!(record = index, "At record {}", index);
            }

            let record = self.derive_record(&doc).map_err(|e| e.at_record(index))?;
            buffer.push(record);
            index += 1;
            self.records_read.store(index, Ordering::Relaxed);
        }
    }

    fn derive_record(&self, doc: &SourceDocument) -> Result<DerivedRecord> {
        let id = doc.id(&self.id_field).ok_or_else(|| {
            PipelineError::malformed("", format!("document has no '{}' field", self.id_field))
        })?;
        let hex = doc.str_field(&self.hex_field).ok_or_else(|| {
            let raw = doc.get(&self.hex_field).map(|v| v.to_string()).unwrap_or_default();
            PipelineError::malformed(raw, format!("missing or non-string '{}' field", self.hex_field))
        })?;
        let key = self.deriver.derive(hex)?;
        Ok(DerivedRecord::new(id, key))
    }
}

/// Pull documents off the cursor into the bounded channel.
///
/// Stops after the first error, when the receiver goes away, or on
/// cancellation. The cursor is released when this returns.
async fn forward_cursor(
    mut stream: DocumentStream,
    tx: mpsc::Sender<Result<SourceDocument>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(item) = next else {
            debug!("cursor exhausted");
            break;
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}
