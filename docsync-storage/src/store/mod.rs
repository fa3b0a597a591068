//! Document store client contract.
//!
//! The store is a collection-keyed document service with point lookups and a
//! resumable change feed. It knows nothing about caching.

pub mod memory;

pub use memory::{InMemoryDocumentStore, StoreStatsSnapshot};

use std::pin::Pin;

use async_trait::async_trait;
use docsync_core::{
    ChangeEvent, Document, DocumentKey, ResumeToken, StoreError, Version, VersionedDocument,
};
use futures_util::Stream;

/// Result type alias for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Lazy, ordered, unbounded sequence of change events.
///
/// The stream ends after yielding an error. [`StoreError::FeedExpired`] means the
/// position can no longer be resumed; anything else is a connection-level
/// failure and the caller reconnects from its last checkpoint.
pub type ChangeStream = Pin<Box<dyn Stream<Item = StoreResult<ChangeEvent>> + Send>>;

/// Result of a conditional create.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The document did not exist and was written at this version.
    Inserted(Version),
    /// Another writer got there first; this is what they stored.
    Existing(VersionedDocument),
}

/// Document store client.
///
/// Implementations must be thread-safe. Every write assigns a version that is
/// strictly greater than any version previously assigned to the same key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point lookup. `Ok(None)` means the document does not exist.
    async fn get(&self, key: &DocumentKey) -> StoreResult<Option<VersionedDocument>>;

    /// Create or replace a document, returning the version written.
    async fn upsert(&self, key: &DocumentKey, document: &Document) -> StoreResult<Version>;

    /// Create a document only if no document exists under `key`.
    async fn insert_if_absent(
        &self,
        key: &DocumentKey,
        document: &Document,
    ) -> StoreResult<InsertOutcome>;

    /// Delete a document.
    ///
    /// Returns the version assigned to the deletion, or `None` if nothing
    /// existed under `key`.
    async fn delete(&self, key: &DocumentKey) -> StoreResult<Option<Version>>;

    /// Ids of every document in a collection.
    async fn list_ids(&self, collection: &str) -> StoreResult<Vec<String>>;

    /// Open a change feed on a collection.
    ///
    /// With `from = None` the feed starts at "now". With a token, events after
    /// that position are delivered first; if the position is no longer
    /// retained the call (or the first stream item) is
    /// [`StoreError::FeedExpired`].
    async fn watch(&self, collection: &str, from: Option<&ResumeToken>)
        -> StoreResult<ChangeStream>;
}
