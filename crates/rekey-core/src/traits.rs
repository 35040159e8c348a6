//! The document store seam and the records exchanged across it.
//!
//! The pipeline never talks to a concrete store directly: it receives a
//! `DocumentStore` at construction time and uses exactly two operations,
//! `aggregate` for the read phase and `bulk_update` for the write phase.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Store-assigned document identifier, kept opaque.
///
/// The pipeline only copies identifiers from read results into update
/// filters, so any JSON value the store hands out is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Value);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document returned by the read-phase aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceDocument(pub Map<String, Value>);

impl SourceDocument {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The identifier stored under `field`, if present.
    pub fn id(&self, field: &str) -> Option<DocumentId> {
        self.0.get(field).cloned().map(DocumentId)
    }

    /// The string stored under `field`, if present and a string.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }
}

impl TryFrom<Value> for SourceDocument {
    type Error = crate::error::PipelineError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(SourceDocument(map)),
            other => Err(crate::error::PipelineError::Serialization(format!(
                "expected a JSON object document, got {}",
                other
            ))),
        }
    }
}

/// A point update: set the configured key field to `key` on the document
/// whose identifier equals `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    pub id: DocumentId,
    pub key: u32,
}

/// Read-phase request. `pipeline` is passed through to the store untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub pipeline: Vec<Value>,
    /// Let the store spill large intermediate results to disk.
    pub allow_disk_use: bool,
    /// Client-side cursor page size hint.
    pub batch_size: u32,
}

/// Counts returned by one bulk-mutation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteOutcome {
    /// Documents whose identifier matched an operation.
    pub matched_count: u64,
    /// Documents actually changed. Can be lower than the operation count
    /// when identifiers no longer match or the value was already set.
    pub modified_count: u64,
}

/// Lazy sequence of documents produced by `aggregate`.
///
/// Dropping the stream releases the underlying cursor.
pub type DocumentStream = BoxStream<'static, Result<SourceDocument>>;

/// Trait that every document store backend implements.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Submit an aggregation and return its results as a stream.
    ///
    /// Errors here, or yielded by the stream, are read-phase failures.
    async fn aggregate(&self, request: &AggregateRequest) -> Result<DocumentStream>;

    /// Apply `operations` in order as one bulk request, each setting
    /// `field` on the matching document.
    async fn bulk_update(&self, field: &str, operations: &[UpdateOperation])
        -> Result<BulkWriteOutcome>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}
