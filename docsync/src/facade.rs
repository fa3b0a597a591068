//! Config Facade
//!
//! The public read/write surface. Reads go through the coherent cache; writes
//! go through to the store and update the cache optimistically so the writer
//! reads its own value immediately.
//!
//! # Failure semantics
//!
//! - `NotFound` is `Ok(None)`, never an error.
//! - A read that cannot reach the store serves the last known value when one
//!   is cached, and fails otherwise. Defaults are only ever produced by
//!   [`ConfigFacade::get_or_generate`].
//! - Every error carries the failing [`Operation`] and key.

use std::sync::Arc;

use docsync_core::{
    Document, DocumentKey, ErrorKind, Operation, StoreError, SyncError, SyncResult, Version,
    VersionedDocument,
};
use docsync_storage::{
    CacheEntry, CacheRead, CacheStats, CoherentCache, DocumentStore, InsertOutcome, StoreResult,
};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{DocumentCodec, SerdeCodec};

/// Documents fetched concurrently by [`ConfigFacade::preload`].
const PRELOAD_CONCURRENCY: usize = 16;

type Loader =
    Box<dyn FnOnce() -> BoxFuture<'static, StoreResult<Option<VersionedDocument>>> + Send>;

async fn join_write<T>(task: JoinHandle<StoreResult<T>>) -> StoreResult<T> {
    task.await
        .unwrap_or_else(|e| Err(StoreError::unavailable(format!("write task failed: {}", e))))
}

/// Cached, coherent access to configuration documents.
///
/// Cheap to clone; clones share the cache and the store client.
#[derive(Clone)]
pub struct ConfigFacade {
    store: Arc<dyn DocumentStore>,
    cache: CoherentCache,
}

impl ConfigFacade {
    pub fn new(store: Arc<dyn DocumentStore>, cache: CoherentCache) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &CoherentCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Cached entry for `key` without triggering a load.
    pub fn peek(&self, key: &DocumentKey) -> Option<CacheEntry> {
        self.cache.peek(key)
    }

    fn loader(&self, key: &DocumentKey) -> Loader {
        let store = Arc::clone(&self.store);
        let key = key.clone();
        Box::new(move || Box::pin(async move { store.get(&key).await }))
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a document. `Ok(None)` if it does not exist.
    pub async fn get(&self, key: &DocumentKey) -> SyncResult<Option<Arc<Document>>> {
        self.read(key)
            .await
            .map(|read| read.map(CacheRead::into_value))
    }

    /// Read a document along with how fresh the cached copy is.
    pub async fn read(&self, key: &DocumentKey) -> SyncResult<Option<CacheRead<Arc<Document>>>> {
        match self.cache.read_through(key, self.loader(key)).await {
            Ok(read) => Ok(read),
            Err(error) => self.last_known(key, error, Operation::Get),
        }
    }

    /// Fall back to whatever is cached when the store cannot be reached.
    fn last_known(
        &self,
        key: &DocumentKey,
        error: StoreError,
        operation: Operation,
    ) -> SyncResult<Option<CacheRead<Arc<Document>>>> {
        let retryable = error.kind() == ErrorKind::Unavailable;
        match self.cache.peek(key) {
            Some(CacheEntry {
                value: Some(value),
                version,
                state,
                age,
                loading,
                ..
            }) if retryable => {
                warn!(key = %key, error = %error, "Store unreachable, serving last known value");
                Ok(Some(CacheRead::from_cache(value, version, state, age, loading)))
            }
            _ => Err(SyncError::from(error).context(operation, key)),
        }
    }

    /// Read a document, creating it from `default_factory` if it does not exist.
    ///
    /// Creation is conditional: if another process creates the document first,
    /// its document is adopted and the generated default is discarded.
    pub async fn get_or_generate<F>(
        &self,
        key: &DocumentKey,
        default_factory: F,
    ) -> SyncResult<Arc<Document>>
    where
        F: FnOnce() -> Document,
    {
        self.get_or_generate_with(key, || Ok(default_factory()))
            .await
    }

    async fn get_or_generate_with<F>(
        &self,
        key: &DocumentKey,
        default_factory: F,
    ) -> SyncResult<Arc<Document>>
    where
        F: FnOnce() -> SyncResult<Document>,
    {
        let existing = match self.cache.read_through(key, self.loader(key)).await {
            Ok(read) => read,
            Err(error) => self.last_known(key, error, Operation::GetOrGenerate)?,
        };
        if let Some(read) = existing {
            return Ok(read.into_value());
        }

        let default = default_factory().map_err(|e| e.context(Operation::GetOrGenerate, key))?;
        let outcome = self
            .store
            .insert_if_absent(key, &default)
            .await
            .map_err(|e| SyncError::from(e).context(Operation::GetOrGenerate, key))?;

        let (document, version) = match outcome {
            InsertOutcome::Inserted(version) => {
                info!(key = %key, version, "Generated default document");
                (default, version)
            }
            InsertOutcome::Existing(winner) => {
                debug!(key = %key, version = winner.version, "Adopting document created concurrently");
                (winner.document, winner.version)
            }
        };

        self.cache.put(key, document.clone(), version);
        // The feed may already have delivered something newer.
        Ok(self
            .cache
            .peek(key)
            .and_then(|entry| entry.value)
            .unwrap_or_else(|| Arc::new(document)))
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write a document through to the store, returning the version written.
    ///
    /// The cache is updated before the store confirms, so concurrent readers in
    /// this process see the new value at once. Saves to the same key are
    /// serialized. If the write fails the previous value is restored as stale
    /// (or the entry dropped), so the next read fetches the store's truth.
    ///
    /// The write and its cache bookkeeping run on their own task: a caller
    /// that stops waiting does not leave an unconfirmed value behind.
    pub async fn save(&self, key: &DocumentKey, document: Document) -> SyncResult<Version> {
        let write = self.cache.pending().begin(key).await;
        let snapshot = self.cache.optimistic_put(key, document.clone());

        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let target = key.clone();
        let completion = tokio::spawn(async move {
            let result = store.upsert(&target, &document).await;
            match &result {
                Ok(version) => {
                    cache.put(&target, document, *version);
                    if write.finish(*version) {
                        debug!(key = %target, version, "Newer write landed during save, invalidating");
                        cache.invalidate(&target);
                    }
                }
                Err(error) => {
                    cache.rollback(&target, snapshot);
                    drop(write);
                    warn!(key = %target, error = %error, "Save failed, cached value rolled back");
                }
            }
            result
        });

        join_write(completion)
            .await
            .map_err(|e| SyncError::from(e).context(Operation::Save, key))
    }

    /// Delete a document. Returns whether it existed.
    ///
    /// Like [`save`](Self::save), completes on its own task. A write from
    /// elsewhere that lands after the delete invalidates the entry instead of
    /// leaving it absent.
    pub async fn delete(&self, key: &DocumentKey) -> SyncResult<bool> {
        let write = self.cache.pending().begin(key).await;

        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let target = key.clone();
        let completion = tokio::spawn(async move {
            let result = store.delete(&target).await;
            match &result {
                Ok(deleted) => {
                    cache.mark_absent(&target, *deleted);
                    // Our own delete event carries `deleted`; anything above it came later.
                    if write.finish(deleted.unwrap_or(0)) {
                        debug!(key = %target, "Document written again during delete, invalidating");
                        cache.invalidate(&target);
                    }
                }
                Err(_) => {
                    if write.finish(0) {
                        cache.invalidate(&target);
                    }
                }
            }
            result
        });

        join_write(completion)
            .await
            .map(|deleted| deleted.is_some())
            .map_err(|e| SyncError::from(e).context(Operation::Delete, key))
    }

    // ========================================================================
    // EXPLICIT REFRESH
    // ========================================================================

    /// Re-fetch one document now, after an out-of-band edit.
    pub async fn reload(&self, key: &DocumentKey) -> SyncResult<Option<Arc<Document>>> {
        self.cache.invalidate(key);
        self.cache
            .reload(key, self.loader(key))
            .await
            .map_err(|e| SyncError::from(e).context(Operation::Reload, key))
    }

    /// Mark every cached document stale; each is re-fetched on its next read.
    ///
    /// Returns the number of entries invalidated.
    pub fn reload_all(&self) -> usize {
        let invalidated = self.cache.invalidate_all();
        info!(invalidated, "Invalidated all cached documents");
        invalidated
    }

    /// Like [`reload_all`](Self::reload_all), for one collection.
    pub fn reload_collection(&self, collection: &str) -> usize {
        let invalidated = self.cache.invalidate_collection(collection);
        info!(collection, invalidated, "Invalidated cached collection");
        invalidated
    }

    /// Warm the cache with every document in `collection`.
    ///
    /// Documents that fail to load are skipped and logged. Returns how many
    /// documents are cached afterwards.
    pub async fn preload(&self, collection: &str) -> SyncResult<usize> {
        let ids = self.store.list_ids(collection).await.map_err(|e| {
            SyncError::from(e).context(Operation::Preload, &DocumentKey::new(collection, "*"))
        })?;

        let results: Vec<(DocumentKey, StoreResult<bool>)> = futures_util::stream::iter(ids)
            .map(|id| {
                let key = DocumentKey::new(collection, id);
                let loader = self.loader(&key);
                async move {
                    let loaded = self.cache.read_through(&key, loader).await;
                    (key, loaded.map(|read| read.is_some()))
                }
            })
            .buffer_unordered(PRELOAD_CONCURRENCY)
            .collect()
            .await;

        let mut cached = 0;
        for (key, result) in results {
            match result {
                Ok(true) => cached += 1,
                Ok(false) => {}
                Err(error) => warn!(key = %key, error = %error, "Preload skipped document"),
            }
        }
        info!(collection, cached, "Preloaded collection");
        Ok(cached)
    }

    // ========================================================================
    // TYPED ACCESS
    // ========================================================================

    pub async fn get_typed<T>(&self, key: &DocumentKey) -> SyncResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.get(key).await? {
            Some(document) => SerdeCodec
                .decode(&document)
                .map(Some)
                .map_err(|e| SyncError::from(e).context(Operation::Get, key)),
            None => Ok(None),
        }
    }

    pub async fn get_or_generate_typed<T, F>(
        &self,
        key: &DocumentKey,
        default_factory: F,
    ) -> SyncResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let document = self
            .get_or_generate_with(key, || {
                SerdeCodec
                    .encode(&default_factory())
                    .map_err(SyncError::from)
            })
            .await?;
        SerdeCodec
            .decode(&document)
            .map_err(|e| SyncError::from(e).context(Operation::GetOrGenerate, key))
    }

    pub async fn save_typed<T>(&self, key: &DocumentKey, value: &T) -> SyncResult<Version>
    where
        T: Serialize + DeserializeOwned,
    {
        let document = SerdeCodec
            .encode(value)
            .map_err(|e| SyncError::from(e).context(Operation::Save, key))?;
        self.save(key, document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::CacheOptions;
    use docsync_storage::{CacheState, InMemoryDocumentStore};
    use docsync_test_utils::assertions::{assert_kind, eventually};
    use docsync_test_utils::generators;
    use proptest::prelude::*;
    use serde::Deserialize;
    use std::time::Duration;

    fn facade() -> (InMemoryDocumentStore, ConfigFacade) {
        let store = InMemoryDocumentStore::new();
        let facade = ConfigFacade::new(
            Arc::new(store.clone()),
            CoherentCache::new(CacheOptions::default()),
        );
        (store, facade)
    }

    fn key() -> DocumentKey {
        DocumentKey::new("cfg", "server-1")
    }

    fn max_players(document: &Document) -> Option<u64> {
        document.get("maxPlayers").and_then(|v| v.as_u64())
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ServerSettings {
        max_players: u32,
    }

    impl Default for ServerSettings {
        fn default() -> Self {
            Self { max_players: 100 }
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_, facade) = facade();
        assert!(facade.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_get_reads_own_write_without_store() {
        let (store, facade) = facade();
        facade
            .save(&key(), Document::new().with("maxPlayers", 200))
            .await
            .unwrap();

        let document = facade.get(&key()).await.unwrap().unwrap();
        assert_eq!(max_players(&document), Some(200));
        assert_eq!(store.get_count(&key()), 0);
    }

    #[tokio::test]
    async fn test_save_records_store_version() {
        let (_, facade) = facade();
        let version = facade.save(&key(), Document::new()).await.unwrap();
        let entry = facade.peek(&key()).unwrap();
        assert_eq!(entry.version, Some(version));
        assert_eq!(entry.state, CacheState::Fresh);
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_to_stale() {
        let (store, facade) = facade();
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        facade.get(&key()).await.unwrap();

        store.set_reject_writes(true);
        let result = facade
            .save(&key(), Document::new().with("maxPlayers", 999))
            .await;
        assert_kind(&result, ErrorKind::Rejected);
        assert_eq!(result.unwrap_err().key(), Some(&key()));

        let entry = facade.peek(&key()).unwrap();
        assert_eq!(entry.state, CacheState::Stale);
        assert_eq!(max_players(&entry.value.unwrap()), Some(100));
        assert!(!facade.cache().pending().is_pending(&key()));
    }

    #[tokio::test]
    async fn test_abandoned_save_still_confirms() {
        let (store, facade) = facade();
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        facade.get(&key()).await.unwrap();

        store.set_latency(Duration::from_millis(200));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            facade.save(&key(), Document::new().with("maxPlayers", 999)),
        )
        .await;
        assert!(abandoned.is_err());

        eventually(|| !facade.cache().pending().is_pending(&key()), Duration::from_secs(5)).await;
        store.set_latency(Duration::ZERO);
        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(max_players(&stored.document), Some(999));

        let entry = facade.peek(&key()).unwrap();
        assert_eq!(entry.version, Some(stored.version));
        assert_eq!(entry.state, CacheState::Fresh);
    }

    #[tokio::test]
    async fn test_abandoned_failing_save_rolls_back() {
        let (store, facade) = facade();
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        facade.get(&key()).await.unwrap();

        store.set_latency(Duration::from_millis(200));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            facade.save(&key(), Document::new().with("maxPlayers", 999)),
        )
        .await;
        assert!(abandoned.is_err());
        store.set_reject_writes(true);

        eventually(|| !facade.cache().pending().is_pending(&key()), Duration::from_secs(5)).await;
        let entry = facade.peek(&key()).unwrap();
        assert_eq!(entry.state, CacheState::Stale);
        assert_eq!(max_players(&entry.value.unwrap()), Some(100));
    }

    #[tokio::test]
    async fn test_failed_first_save_leaves_nothing_cached() {
        let (store, facade) = facade();
        store.set_unavailable(true);

        let err = facade.save(&key(), Document::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(facade.peek(&key()).is_none());
    }

    #[tokio::test]
    async fn test_get_or_generate_creates_default_once() {
        let (store, facade) = facade();
        let created = facade
            .get_or_generate(&key(), || Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        assert_eq!(max_players(&created), Some(100));

        let again = facade
            .get_or_generate(&key(), || Document::new().with("maxPlayers", 1))
            .await
            .unwrap();
        assert_eq!(max_players(&again), Some(100));
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_get_or_generate_adopts_concurrent_winner() {
        let (store, facade) = facade();
        // Cached as absent before the other process creates the document.
        assert!(facade.get(&key()).await.unwrap().is_none());
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 64))
            .await
            .unwrap();

        let adopted = facade
            .get_or_generate(&key(), || Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        assert_eq!(max_players(&adopted), Some(64));

        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(max_players(&stored.document), Some(64));
    }

    #[tokio::test]
    async fn test_get_or_generate_does_not_default_on_outage() {
        let (store, facade) = facade();
        store.set_unavailable(true);

        let result = facade
            .get_or_generate(&key(), || Document::new().with("maxPlayers", 100))
            .await;
        assert_kind(&result, ErrorKind::Unavailable);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("get_or_generate failed for cfg/server-1"));
    }

    #[tokio::test]
    async fn test_stale_value_served_during_outage() {
        let (store, facade) = facade();
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        facade.get(&key()).await.unwrap();

        facade.reload_all();
        store.set_unavailable(true);

        let read = facade.read(&key()).await.unwrap().unwrap();
        assert_eq!(max_players(read.value()), Some(100));
        assert_eq!(read.state(), CacheState::Stale);
    }

    #[tokio::test]
    async fn test_delete_marks_absent() {
        let (store, facade) = facade();
        facade.save(&key(), Document::new()).await.unwrap();

        assert!(facade.delete(&key()).await.unwrap());
        assert!(facade.get(&key()).await.unwrap().is_none());
        assert!(store.get(&key()).await.unwrap().is_none());
        assert!(!facade.delete(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reload_fetches_out_of_band_edit() {
        let (store, facade) = facade();
        facade
            .save(&key(), Document::new().with("maxPlayers", 100))
            .await
            .unwrap();
        store
            .upsert(&key(), &Document::new().with("maxPlayers", 5))
            .await
            .unwrap();

        let reloaded = facade.reload(&key()).await.unwrap().unwrap();
        assert_eq!(max_players(&reloaded), Some(5));
        assert_eq!(store.get_count(&key()), 1);
    }

    #[tokio::test]
    async fn test_preload_warms_collection() {
        let (store, facade) = facade();
        for id in ["a", "b", "c"] {
            store
                .upsert(&DocumentKey::new("cfg", id), &Document::new())
                .await
                .unwrap();
        }
        store
            .upsert(&DocumentKey::new("messages", "en"), &Document::new())
            .await
            .unwrap();

        assert_eq!(facade.preload("cfg").await.unwrap(), 3);
        assert_eq!(facade.cache().keys(Some("cfg")).len(), 3);
        assert!(facade.cache().keys(Some("messages")).is_empty());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let (_, facade) = facade();
        let generated: ServerSettings = facade
            .get_or_generate_typed(&key(), ServerSettings::default)
            .await
            .unwrap();
        assert_eq!(generated.max_players, 100);

        facade
            .save_typed(&key(), &ServerSettings { max_players: 200 })
            .await
            .unwrap();
        let read: Option<ServerSettings> = facade.get_typed(&key()).await.unwrap();
        assert_eq!(read, Some(ServerSettings { max_players: 200 }));
    }

    #[tokio::test]
    async fn test_typed_decode_failure_is_codec_error() {
        let (_, facade) = facade();
        facade
            .save(&key(), Document::new().with("maxPlayers", "many"))
            .await
            .unwrap();

        let result = facade.get_typed::<ServerSettings>(&key()).await;
        assert_kind(&result, ErrorKind::Codec);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_saved_document_reads_back_from_cache(
            key in generators::arb_document_key(),
            document in generators::arb_document(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (store, facade) = facade();
            let read = runtime.block_on(async {
                facade.save(&key, document.clone()).await.unwrap();
                facade.get(&key).await.unwrap()
            });
            prop_assert_eq!(read.as_deref(), Some(&document));
            prop_assert_eq!(store.get_count(&key), 0);
        }
    }
}
