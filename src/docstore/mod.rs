//! Document store abstraction.
//!
//! The production deployment backs this with a hosted document database; the
//! core only relies on the narrow contract below: single-document linearizable
//! transactions, at-least-once change delivery, and server-side write
//! timestamps. `MemoryDocumentStore` implements the full contract for tests
//! and for single-process deployments.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::Result;

pub use memory::MemoryDocumentStore;

/// A stored document plus its server-assigned update time. The update time
/// is the dedup key consumers use with at-least-once change delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One committed change on a watched collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: String,
    pub document: Document,
}

/// Outcome of a transactional read-modify-write closure.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome {
    /// Leave the document untouched and report the transaction as aborted.
    Abort,
    /// Replace (or create) the document with this value.
    Set(Value),
    /// Delete the document if it exists.
    Delete,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Create or replace; the store stamps the update time.
    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<()>;

    /// Shallow-merge top-level fields into an existing document, creating it
    /// when absent.
    async fn merge(&self, collection: &str, id: &str, data: Value) -> Result<()>;

    /// Deleting a non-existent document is a no-op.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    /// Linearizable single-document read-modify-write. The closure observes
    /// the current value (None when absent) and decides the outcome. Returns
    /// true when the transaction committed a write, false on `Abort`.
    async fn modify(
        &self,
        collection: &str,
        id: &str,
        mutate: &(dyn for<'a> Fn(Option<&'a Value>) -> TxnOutcome + Send + Sync),
    ) -> Result<bool>;

    /// Subscribe to a collection's change stream. Delivery is at-least-once;
    /// a lagging subscriber must resubscribe and reconcile via `list`.
    fn watch(&self, collection: &str) -> tokio::sync::broadcast::Receiver<ChangeEvent>;
}

/// Convenience: decode a document into a typed value, reporting the
/// collection and id on failure.
pub fn decode<T: serde::de::DeserializeOwned>(
    collection: &str,
    doc: &Document,
) -> Result<T> {
    serde_json::from_value(doc.data.clone()).map_err(|e| {
        crate::domain::CoreError::InvalidDocument {
            collection: collection.to_string(),
            id: doc.id.clone(),
            reason: e.to_string(),
        }
    })
}
