//! In-memory record buffer filled by the read phase.
//!
//! `RecordBuffer` is append-only and owned by the consumer. `freeze` turns it
//! into a `FrozenBuffer`, which is immutable and shareable; that is the only
//! form the write phase ever sees. The whole read phase has to fit in memory
//! before any write begins.

use std::ops::Deref;
use std::sync::Arc;

use crate::traits::{DocumentId, UpdateOperation};

/// A document identifier paired with its derived key.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRecord {
    pub id: DocumentId,
    pub key: u32,
}

impl DerivedRecord {
    pub fn new(id: DocumentId, key: u32) -> Self {
        Self { id, key }
    }

    pub fn to_update(&self) -> UpdateOperation {
        UpdateOperation {
            id: self.id.clone(),
            key: self.key,
        }
    }
}

/// Ordered, append-only accumulator for the read phase.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    records: Vec<DerivedRecord>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: DerivedRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// End the append phase. The returned buffer cannot be modified.
    pub fn freeze(self) -> FrozenBuffer {
        FrozenBuffer {
            records: Arc::from(self.records),
        }
    }
}

/// Read-only view of a completed read phase. Clones share storage.
#[derive(Debug, Clone)]
pub struct FrozenBuffer {
    records: Arc<[DerivedRecord]>,
}

impl FrozenBuffer {
    pub fn empty() -> Self {
        RecordBuffer::new().freeze()
    }
}

impl Deref for FrozenBuffer {
    type Target = [DerivedRecord];

    fn deref(&self) -> &[DerivedRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(i: u64) -> DerivedRecord {
        DerivedRecord::new(DocumentId(json!(i)), (i % 43) as u32)
    }

    #[test]
    fn test_push_preserves_order() {
        let mut buffer = RecordBuffer::new();
        for i in 0..10 {
            buffer.push(record(i));
        }
        assert_eq!(buffer.len(), 10);

        let frozen = buffer.freeze();
        let ids: Vec<_> = frozen.iter().map(|r| r.id.clone()).collect();
        let expected: Vec<_> = (0..10).map(|i| DocumentId(json!(i))).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = RecordBuffer::with_capacity(16);
        assert!(buffer.is_empty());
        let frozen = buffer.freeze();
        assert!(frozen.is_empty());
        assert!(FrozenBuffer::empty().is_empty());
    }

    #[test]
    fn test_frozen_clones_share_storage() {
        let mut buffer = RecordBuffer::new();
        buffer.push(record(1));
        let a = buffer.freeze();
        let b = a.clone();
        assert!(std::ptr::eq(a.as_ptr(), b.as_ptr()));
    }

    #[test]
    fn test_to_update() {
        let op = record(44).to_update();
        assert_eq!(op.id, DocumentId(json!(44)));
        assert_eq!(op.key, 1);
    }
}
