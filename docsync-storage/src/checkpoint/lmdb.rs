//! LMDB-backed checkpoint store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Every save is a committed
//! write transaction, so a checkpoint that `save` returned `Ok` for survives a
//! crash.
//!
//! Layout: one named database `checkpoints`, keyed by collection name, values
//! are JSON-encoded [`ResumeCheckpoint`]s.

use std::path::Path;

use async_trait::async_trait;
use docsync_core::{CheckpointError, ResumeCheckpoint};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use super::ResumeTokenStore;

const DATABASE_NAME: &str = "checkpoints";

/// Local-disk checkpoint store.
///
/// # Example
///
/// ```ignore
/// let store = LmdbResumeTokenStore::new("/var/lib/app/docsync", 1)?;
/// store.save(&ResumeCheckpoint::new("cfg", token)).await?;
/// ```
pub struct LmdbResumeTokenStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbResumeTokenStore {
    /// Open (or create) a checkpoint store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - The LMDB environment cannot be opened
    /// - The checkpoint database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(&path).map_err(|e| CheckpointError::Open(e.to_string()))?;

        // SAFETY: the environment is opened once per path by this process and
        // never through another handle while this one is alive.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.max(1) * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| CheckpointError::Open(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| CheckpointError::Open(e.to_string()))?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(DATABASE_NAME))
            .map_err(|e| CheckpointError::Open(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| CheckpointError::Open(e.to_string()))?;

        Ok(Self { env, db })
    }
}

#[async_trait]
impl ResumeTokenStore for LmdbResumeTokenStore {
    async fn load(&self, collection: &str) -> Result<Option<ResumeCheckpoint>, CheckpointError> {
        let read_error = |reason: String| CheckpointError::Read {
            collection: collection.to_string(),
            reason,
        };

        let rtxn = self.env.read_txn().map_err(|e| read_error(e.to_string()))?;
        match self.db.get(&rtxn, collection) {
            Ok(Some(bytes)) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| CheckpointError::Encode(e.to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(read_error(e.to_string())),
        }
    }

    async fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<(), CheckpointError> {
        let write_error = |reason: String| CheckpointError::Write {
            collection: checkpoint.collection.clone(),
            reason,
        };

        let bytes =
            serde_json::to_vec(checkpoint).map_err(|e| CheckpointError::Encode(e.to_string()))?;

        let mut wtxn = self.env.write_txn().map_err(|e| write_error(e.to_string()))?;
        self.db
            .put(&mut wtxn, &checkpoint.collection, &bytes)
            .map_err(|e| write_error(e.to_string()))?;
        wtxn.commit().map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), CheckpointError> {
        let write_error = |reason: String| CheckpointError::Write {
            collection: collection.to_string(),
            reason,
        };

        let mut wtxn = self.env.write_txn().map_err(|e| write_error(e.to_string()))?;
        self.db
            .delete(&mut wtxn, collection)
            .map_err(|e| write_error(e.to_string()))?;
        wtxn.commit().map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::ResumeToken;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbResumeTokenStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbResumeTokenStore::new(temp_dir.path(), 1).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp_dir) = create_test_store();
        let checkpoint = ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![0, 0, 7]));

        store.save(&checkpoint).await.expect("save should succeed");
        let loaded = store.load("cfg").await.expect("load should succeed");

        assert_eq!(loaded, Some(checkpoint));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let (store, _temp_dir) = create_test_store();
        assert!(store.load("cfg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _temp_dir) = create_test_store();
        store
            .save(&ResumeCheckpoint::new("cfg", ResumeToken::from_bytes(vec![1])))
            .await
            .unwrap();

        store.clear("cfg").await.unwrap();
        assert!(store.load("cfg").await.unwrap().is_none());

        // Clearing an absent checkpoint is not an error.
        store.clear("cfg").await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = ResumeCheckpoint::new("messages", ResumeToken::from_bytes(vec![9; 8]));

        {
            let store = LmdbResumeTokenStore::new(temp_dir.path(), 1).unwrap();
            store.save(&checkpoint).await.unwrap();
        }

        let reopened = LmdbResumeTokenStore::new(temp_dir.path(), 1).unwrap();
        assert_eq!(reopened.load("messages").await.unwrap(), Some(checkpoint));
    }
}
