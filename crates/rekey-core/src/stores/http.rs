//! HTTP document store.
//!
//! Talks to a store gateway over two JSON endpoints.
//!
//! ## `POST {url}/aggregate`
//!
//! ```text
//! {"database": "...", "collection": "...", "pipeline": [...], "allowDiskUse": true, "batchSize": 1000}
//! ```
//!
//! The response body is NDJSON, one document per line, and is consumed
//! incrementally so the whole result set is never held as one body.
//!
//! ## `POST {url}/bulk-write`
//!
//! ```text
//! {"database": "...", "collection": "...", "ordered": true,
//!  "operations": [{"updateOne": {"filter": {"_id": ...}, "update": {"$set": {"key": 7}}}}]}
//! ```
//!
//! responding with `{"matchedCount": n, "modifiedCount": m}`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::traits::{
    AggregateRequest, BulkWriteOutcome, DocumentStore, DocumentStream, SourceDocument,
    UpdateOperation,
};

/// Longest NDJSON line accepted from the aggregate endpoint.
const MAX_DOCUMENT_LINE: usize = 16 * 1024 * 1024;

/// Document store reached through an HTTP gateway.
pub struct HttpDocumentStore {
    name: String,
    base_url: String,
    database: String,
    collection: String,
    id_field: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HttpDocumentStore {
    /// Build a store and its HTTP client from configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(config, client))
    }

    /// Create with an injected reqwest client.
    pub fn with_client(config: &PipelineConfig, client: reqwest::Client) -> Self {
        Self {
            name: format!("http:{}/{}", config.store.database, config.store.collection),
            base_url: config.store.url.trim_end_matches('/').to_string(),
            database: config.store.database.clone(),
            collection: config.store.collection.clone(),
            id_field: config.query.id_field.clone(),
            request_timeout: config.store.request_timeout(),
            client,
        }
    }

    /// Build the JSON body for a bulk-write request.
    pub fn build_bulk_body(&self, field: &str, operations: &[UpdateOperation]) -> Value {
        let operations: Vec<Value> = operations
            .iter()
            .map(|op| {
                json!({
                    "updateOne": {
                        "filter": { self.id_field.as_str(): op.id },
                        "update": { "$set": { field: op.key } }
                    }
                })
            })
            .collect();
        json!({
            "database": self.database,
            "collection": self.collection,
            "ordered": true,
            "operations": operations,
        })
    }

    fn build_aggregate_body(&self, request: &AggregateRequest) -> Value {
        json!({
            "database": self.database,
            "collection": self.collection,
            "pipeline": request.pipeline,
            "allowDiskUse": request.allow_disk_use,
            "batchSize": request.batch_size,
        })
    }
}

fn parse_document_line(line: &str) -> Result<SourceDocument> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| PipelineError::QueryExecution(format!("invalid document line: {}", e)))?;
    SourceDocument::try_from(value).map_err(|e| PipelineError::QueryExecution(e.to_string()))
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<DocumentStream> {
        let url = format!("{}/aggregate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.build_aggregate_body(request))
            .send()
            .await
            .map_err(|e| PipelineError::QueryExecution(format!("aggregate request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::QueryExecution(format!(
                "aggregate returned {}: {}",
                status, body_text
            )));
        }

        let bytes = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_DOCUMENT_LINE),
        );

        let documents = lines.filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(parse_document_line(&line)),
                Err(e) => Some(Err(PipelineError::QueryExecution(format!(
                    "cursor stream failed: {}",
                    e
                )))),
            }
        });
        Ok(documents.boxed())
    }

    async fn bulk_update(
        &self,
        field: &str,
        operations: &[UpdateOperation],
    ) -> Result<BulkWriteOutcome> {
        if operations.is_empty() {
            return Ok(BulkWriteOutcome::default());
        }

        let url = format!("{}/bulk-write", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&self.build_bulk_body(field, operations))
            .send()
            .await
            .map_err(|e| PipelineError::Connection(format!("bulk-write request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Connection(format!(
                "bulk-write returned {}: {}",
                status, body_text
            )));
        }

        let outcome: BulkWriteOutcome = response.json().await.map_err(|e| {
            PipelineError::Serialization(format!("failed to parse bulk-write response: {}", e))
        })?;

        debug!(
            store = %self.name,
            operations = operations.len(),
            modified = outcome.modified_count,
            "bulk-write acknowledged"
        );
        Ok(outcome)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
