//! Document store implementations.
//!
//! - [`http::HttpDocumentStore`] talks to a store gateway over HTTP.
//! - [`memory::InMemoryStore`] keeps documents in process, with fault
//!   injection hooks for exercising failure paths.

pub mod http;
pub mod memory;

pub use http::HttpDocumentStore;
pub use memory::{InMemoryStore, StoreEvent};
