//! Rekey Core
//!
//! Streams documents out of a query-backed document store, derives a small
//! integer key for each one from a hexadecimal identifier field, and writes
//! the keys back with chunked bulk updates.
//!
//! The store cannot reliably serve a live read cursor while the same
//! collection is being written, so a run is split into two strictly ordered
//! phases: a read phase that buffers every derived record in memory, and a
//! write phase that replays them as bulk mutations.
//!
//! ## Architecture
//!
//! - **Key**: `KeyDeriver` turns a hex string into a key in `[0, modulus)`.
//! - **Buffer**: `RecordBuffer` collects derived records; `FrozenBuffer` is
//!   its read-only form.
//! - **Consumer**: `StreamConsumer` drives the aggregation cursor.
//! - **Phase**: `PhaseCoordinator` gates the write phase on read completion.
//! - **Mutator**: `BatchMutator` sends the buffer in sequential batches.
//! - **Runtime**: `Pipeline` wires the above into one run.
//! - **Stores**: `HttpDocumentStore` and `InMemoryStore` implement the
//!   `DocumentStore` seam.

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod key;
pub mod mutator;
pub mod phase;
pub mod runtime;
pub mod stores;
pub mod traits;

pub use buffer::{DerivedRecord, FrozenBuffer, RecordBuffer};
pub use config::PipelineConfig;
pub use consumer::StreamConsumer;
pub use error::{PipelineError, Result};
pub use key::KeyDeriver;
pub use mutator::{partition, Batch, BatchMutator, BatchOutcome, WriteSummary};
pub use phase::{CompletionSignal, PhaseCoordinator, PhaseState};
pub use runtime::{Pipeline, RunReport};
pub use stores::{HttpDocumentStore, InMemoryStore, StoreEvent};
pub use traits::{
    AggregateRequest, BulkWriteOutcome, DocumentId, DocumentStore, DocumentStream,
    SourceDocument, UpdateOperation,
};
