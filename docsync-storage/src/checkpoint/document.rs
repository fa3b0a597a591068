//! Checkpoints stored in the document database itself.
//!
//! Each watched collection gets one document under a well-known collection
//! (`_docsync_checkpoints` by default) whose id is the watched collection name.
//! The checkpoint collection must not itself be watched.

use std::sync::Arc;

use async_trait::async_trait;
use docsync_core::{CheckpointError, Document, DocumentKey, ResumeCheckpoint};

use super::ResumeTokenStore;
use crate::store::DocumentStore;

pub struct DocumentResumeTokenStore {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl DocumentResumeTokenStore {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    fn key(&self, watched: &str) -> DocumentKey {
        DocumentKey::new(self.collection.clone(), watched)
    }
}

#[async_trait]
impl ResumeTokenStore for DocumentResumeTokenStore {
    async fn load(&self, collection: &str) -> Result<Option<ResumeCheckpoint>, CheckpointError> {
        let found = self
            .store
            .get(&self.key(collection))
            .await
            .map_err(|e| CheckpointError::Read {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;

        match found {
            Some(versioned) => serde_json::from_value(versioned.document.into_value())
                .map(Some)
                .map_err(|e| CheckpointError::Encode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<(), CheckpointError> {
        let value =
            serde_json::to_value(checkpoint).map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let document = Document::from_value(value)
            .ok_or_else(|| CheckpointError::Encode("checkpoint is not an object".to_string()))?;

        self.store
            .upsert(&self.key(&checkpoint.collection), &document)
            .await
            .map_err(|e| CheckpointError::Write {
                collection: checkpoint.collection.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), CheckpointError> {
        self.store
            .delete(&self.key(collection))
            .await
            .map_err(|e| CheckpointError::Write {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use docsync_core::ResumeToken;

    #[tokio::test]
    async fn test_round_trips_through_document_store() {
        let backing = InMemoryDocumentStore::new();
        let store = DocumentResumeTokenStore::new(Arc::new(backing.clone()), "_checkpoints");
        let checkpoint = ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![4, 2]));

        store.save(&checkpoint).await.unwrap();

        assert_eq!(store.load("cfg").await.unwrap(), Some(checkpoint));
        assert_eq!(backing.list_ids("_checkpoints").await.unwrap(), vec!["cfg"]);

        store.clear("cfg").await.unwrap();
        assert!(store.load("cfg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_checkpoint_error() {
        let backing = InMemoryDocumentStore::new();
        let store = DocumentResumeTokenStore::new(Arc::new(backing.clone()), "_checkpoints");
        backing.set_unavailable(true);

        let result = store.load("cfg").await;
        assert!(matches!(result, Err(CheckpointError::Read { .. })));
    }
}
