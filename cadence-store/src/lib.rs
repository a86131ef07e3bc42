//! Cadence store - reactive values and the replicated store contract
//!
//! This crate defines the storage side of the cadence runtime:
//!
//! - `ReactiveStore<T>`: a value plus subscriber list, the unit of
//!   reactivity everything above it is built from
//! - `ReplicatedStore`: the contract the runtime needs from a replicated
//!   backend (append-only logs, mutable documents, record collections)
//! - `MemoryStore`: a single-process implementation of that contract
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ReplicatedStore                      │
//! │                                                        │
//! │   logs          documents          collections          │
//! │   inbox/a  ──►  config/a           spark/{id}           │
//! │   inbox/b       context/a          todos/{id}           │
//! │                                                        │
//! │           read(source, query) ─► ReactiveStore          │
//! └───────────────────────────┬────────────────────────────┘
//!                             │ set() on every change
//!                             ▼
//!                  subscribers (runtime callbacks)
//! ```
//!
//! Reads are live: `read` returns a `ReactiveStore` that the backend keeps
//! updated until its last subscriber detaches. Writes are durable once the
//! returned future resolves. Merge and conflict resolution between replicas
//! are the backend's responsibility.

mod memory;
mod reactive;

pub use memory::{MemoryStore, StoreStats};
pub use reactive::{ReactiveStore, Unsubscribe, WeakReactiveStore};

use async_trait::async_trait;
use cadence_types::{Map, Query, Sequence, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document '{0}' is not an object")]
    NotAnObject(String),

    #[error("log '{log}' has no entry {sequence}")]
    EntryNotFound { log: String, sequence: Sequence },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What a live read observes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A mutable document; reads as an object, or null if missing
    Document(String),
    /// A record collection; reads according to the query
    Collection(String),
    /// An append-only log; reads as an array of entries
    Log(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Document(id) => write!(f, "doc:{}", id),
            Source::Collection(name) => write!(f, "collection:{}", name),
            Source::Log(id) => write!(f, "log:{}", id),
        }
    }
}

/// One entry of an append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: Sequence,
    pub value: Value,
    #[serde(default)]
    pub processed: bool,
}

/// Contract of the replicated log/document backend
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Open a live read
    ///
    /// The returned store holds the current value and is updated whenever
    /// the observed data changes. Document and log sources ignore the
    /// query.
    fn read(&self, source: &Source, query: &Query) -> ReactiveStore<Value>;

    /// Fresh snapshot of a document
    async fn get(&self, document: &str) -> Result<Option<Map>>;

    /// Merge keys into a document (shallow overwrite, one change event)
    async fn merge(&self, document: &str, patch: Map) -> Result<()>;

    /// Set a single document key
    async fn update(&self, document: &str, key: &str, value: Value) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.merge(document, patch).await
    }

    /// Append to a log, returning the assigned sequence
    async fn append(&self, log: &str, entry: Value) -> Result<Sequence>;

    /// All entries of a log in sequence order
    async fn entries(&self, log: &str) -> Result<Vec<LogEntry>>;

    /// Flag a log entry as processed
    async fn mark_processed(&self, log: &str, sequence: Sequence) -> Result<()>;

    /// Insert or replace a collection record
    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()>;

    /// Remove a collection record
    async fn remove(&self, collection: &str, id: &str) -> Result<Option<Value>>;
}
