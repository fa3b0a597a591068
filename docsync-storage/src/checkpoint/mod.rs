//! Resume checkpoint persistence.
//!
//! A checkpoint records the last change-feed position whose events were fully
//! applied to the cache. It only counts once durably stored; if the process dies
//! between applying events and saving, those events are redelivered on
//! reconnect, which is harmless because cache refresh is idempotent.

pub mod document;
pub mod lmdb;

pub use document::DocumentResumeTokenStore;
pub use lmdb::LmdbResumeTokenStore;

use std::collections::HashMap;

use async_trait::async_trait;
use docsync_core::{CheckpointError, ResumeCheckpoint};
use tokio::sync::RwLock;

/// Durable record of feed positions, one per watched collection.
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    /// Last saved checkpoint for a collection, if any.
    async fn load(&self, collection: &str) -> Result<Option<ResumeCheckpoint>, CheckpointError>;

    /// Persist a checkpoint, replacing the previous one for its collection.
    async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<(), CheckpointError>;

    /// Forget the checkpoint for a collection (used when a token expires).
    async fn clear(&self, collection: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store.
///
/// Survives reconnects but not restarts; a restart then begins with a full
/// reconcile, which is always correct.
#[derive(Debug, Default)]
pub struct InMemoryResumeTokenStore {
    checkpoints: RwLock<HashMap<String, ResumeCheckpoint>>,
}

impl InMemoryResumeTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeTokenStore for InMemoryResumeTokenStore {
    async fn load(&self, collection: &str) -> Result<Option<ResumeCheckpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(collection).cloned())
    }

    async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.collection.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::ResumeToken;

    #[tokio::test]
    async fn test_in_memory_save_load_clear() {
        let store = InMemoryResumeTokenStore::new();
        assert!(store.load("cfg").await.unwrap().is_none());

        let checkpoint = ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![1, 2, 3]));
        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.load("cfg").await.unwrap(), Some(checkpoint));
        assert!(store.load("other").await.unwrap().is_none());

        store.clear("cfg").await.unwrap();
        assert!(store.load("cfg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_save_replaces() {
        let store = InMemoryResumeTokenStore::new();
        store
            .save(&ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![1])))
            .await
            .unwrap();
        store
            .save(&ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![2])))
            .await
            .unwrap();

        let loaded = store.load("cfg").await.unwrap().unwrap();
        assert_eq!(loaded.token, ResumeToken::from_bytes(vec![2]));
    }
}
