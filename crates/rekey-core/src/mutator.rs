//! Write phase: replay the frozen buffer as chunked bulk updates.
//!
//! Batches go out strictly one at a time, in buffer order. A failed call is
//! not retried; it ends the write phase, and batches not yet sent are
//! abandoned. Batches that already succeeded stay applied.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::DerivedRecord;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::traits::{DocumentStore, UpdateOperation};

/// A contiguous slice of the buffer sent as one bulk request.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    /// Zero-based position of this batch in the write phase.
    pub index: usize,
    pub records: &'a [DerivedRecord],
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn operations(&self) -> Vec<UpdateOperation> {
        self.records.iter().map(DerivedRecord::to_update).collect()
    }
}

/// Split `records` into batches of at most `batch_size`, in order.
///
/// Every batch but the last holds exactly `batch_size` records; an empty
/// input yields no batches.
pub fn partition(
    records: &[DerivedRecord],
    batch_size: NonZeroUsize,
) -> impl Iterator<Item = Batch<'_>> {
    records
        .chunks(batch_size.get())
        .enumerate()
        .map(|(index, records)| Batch { index, records })
}

/// Result of one bulk call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub size: usize,
    pub matched: u64,
    pub modified: u64,
}

/// Per-batch results of a completed write phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub batches: Vec<BatchOutcome>,
}

impl WriteSummary {
    pub fn total_modified(&self) -> u64 {
        self.batches.iter().map(|b| b.modified).sum()
    }

    pub fn total_matched(&self) -> u64 {
        self.batches.iter().map(|b| b.matched).sum()
    }

    pub fn records_sent(&self) -> usize {
        self.batches.iter().map(|b| b.size).sum()
    }
}

/// Issues bulk updates for a frozen buffer.
pub struct BatchMutator {
    store: Arc<dyn DocumentStore>,
    field: String,
    batch_size: NonZeroUsize,
    cancel: CancellationToken,
}

impl BatchMutator {
    pub fn new(store: Arc<dyn DocumentStore>, field: &str, batch_size: usize) -> Result<Self> {
        let batch_size = NonZeroUsize::new(batch_size).ok_or_else(|| {
            PipelineError::Config("batch size must be greater than 0".to_string())
        })?;
        Ok(Self {
            store,
            field: field.to_string(),
            batch_size,
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &PipelineConfig) -> Result<Self> {
        Self::new(store, &config.key.field, config.write.batch_size)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    /// Send every batch of `records` and collect the outcomes.
    ///
    /// On failure the returned `Mutation` error names the failing batch and
    /// how many batches (and modified records) were applied before it.
    pub async fn run(&self, records: &[DerivedRecord]) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();

        for batch in partition(records, self.batch_size) {
            let operations = batch.operations();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(PipelineError::Cancelled(format!(
                    "write phase cancelled at batch {} ({} batches applied)",
                    batch.index,
                    summary.batches.len()
                ))),
                result = self.store.bulk_update(&self.field, &operations) => result,
            };

            match result {
                Ok(outcome) => {
                    info!(
                        batch = batch.index,
                        size = batch.len(),
                        matched = outcome.matched_count,
                        modified = outcome.modified_count,
                        "{} records updated",
                        outcome.modified_count
                    );
                    summary.batches.push(BatchOutcome {
                        index: batch.index,
                        size: batch.len(),
                        matched: outcome.matched_count,
                        modified: outcome.modified_count,
                    });
                }
                Err(e @ PipelineError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    error!(batch = batch.index, size = batch.len(), error = %e, "bulk update failed");
                    let message = match e {
                        PipelineError::Mutation { message, .. } => message,
                        other => other.to_string(),
                    };
                    return Err(PipelineError::Mutation {
                        batch_index: batch.index,
                        batches_applied: summary.batches.len(),
                        records_modified: summary.total_modified(),
                        message,
                    });
                }
            }
        }

        info!(
            batches = summary.batches.len(),
            records = summary.records_sent(),
            modified = summary.total_modified(),
            "write phase complete"
        );
        Ok(summary)
    }
}
