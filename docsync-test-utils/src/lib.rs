//! DOCSYNC Test Utilities
//!
//! Shared test infrastructure for the DOCSYNC workspace:
//! - Proptest generators for keys and documents
//! - A counting, gateable store wrapper for single-flight tests
//! - Fixtures for the settings and message documents used across tests
//! - Assertions on error kinds
//! - Log capture for tests

pub use docsync_core::{
    Document, DocumentKey, ErrorKind, StoreError, SyncError, SyncOptions, SyncResult, Version,
    VersionedDocument,
};
pub use docsync_storage::{DocumentStore, InMemoryDocumentStore, InsertOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::ResumeToken;
use docsync_storage::{ChangeStream, StoreResult};
use tokio::sync::watch;

// ============================================================================
// COUNTING STORE
// ============================================================================

/// Store wrapper that counts point lookups and can hold them at a gate.
///
/// While held, every `get` waits until [`CountingStore::release`] is called,
/// which makes "many readers arrive during one load" deterministic. Write
/// acknowledgements can also be delayed, leaving a window in which the write
/// has landed but the writer has not heard back.
#[derive(Clone)]
pub struct CountingStore {
    inner: Arc<dyn DocumentStore>,
    gets: Arc<AtomicU64>,
    per_key: Arc<Mutex<HashMap<DocumentKey, u64>>>,
    gate: Arc<watch::Sender<bool>>,
    ack_delay_ms: Arc<AtomicU64>,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner,
            gets: Arc::new(AtomicU64::new(0)),
            per_key: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(gate),
            ack_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total `get` calls that reached this wrapper.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn gets_for(&self, key: &DocumentKey) -> u64 {
        self.per_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Make subsequent and in-progress `get` calls wait.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let every waiting `get` through.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Hold back the result of every `upsert` and `delete` for `delay` after
    /// the inner store has applied it.
    pub fn delay_acks(&self, delay: Duration) {
        self.ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn ack<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        let ms = self.ack_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        result
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get(&self, key: &DocumentKey) -> StoreResult<Option<VersionedDocument>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        *self
            .per_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;

        let mut open = self.gate.subscribe();
        // Sender lives in self, so this only ends once the gate opens.
        let _ = open.wait_for(|open| *open).await;
        self.inner.get(key).await
    }

    async fn upsert(&self, key: &DocumentKey, document: &Document) -> StoreResult<Version> {
        let result = self.inner.upsert(key, document).await;
        self.ack(result).await
    }

    async fn insert_if_absent(
        &self,
        key: &DocumentKey,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        self.inner.insert_if_absent(key, document).await
    }

    async fn delete(&self, key: &DocumentKey) -> StoreResult<Option<Version>> {
        let result = self.inner.delete(key).await;
        self.ack(result).await
    }

    async fn list_ids(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.inner.list_ids(collection).await
    }

    async fn watch(
        &self,
        collection: &str,
        from: Option<&ResumeToken>,
    ) -> StoreResult<ChangeStream> {
        self.inner.watch(collection, from).await
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and documents.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    pub fn arb_collection() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    pub fn arb_document_id() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9-]{0,15}"
    }

    pub fn arb_document_key() -> impl Strategy<Value = DocumentKey> {
        (arb_collection(), arb_document_id()).prop_map(|(c, id)| DocumentKey::new(c, id))
    }

    /// Scalar JSON values as they appear in settings documents.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::from),
        ]
    }

    /// Flat document with up to eight scalar fields.
    pub fn arb_document() -> impl Strategy<Value = Document> {
        prop::collection::btree_map("[a-z_]{1,10}", arb_scalar(), 0..8).prop_map(|fields| {
            fields
                .into_iter()
                .fold(Document::new(), |doc, (field, value)| doc.with(field, value))
        })
    }

    pub fn arb_placeholder_name() -> impl Strategy<Value = String> {
        "[A-Za-z_][A-Za-z0-9_.-]{0,11}"
    }

    /// A short sequence of versioned writes with strictly increasing versions.
    pub fn arb_versioned_writes() -> impl Strategy<Value = Vec<(Document, Version)>> {
        prop::collection::vec((arb_document(), 1u64..5), 1..10).prop_map(|steps| {
            let mut version = 0;
            steps
                .into_iter()
                .map(|(doc, step)| {
                    version += step;
                    (doc, version)
                })
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built documents for common scenarios.

    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    /// Typed settings document used to exercise the codec path.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ServerSettings {
        pub name: String,
        pub max_players: u32,
        pub motd: String,
        #[serde(default)]
        pub whitelist: Vec<String>,
    }

    impl Default for ServerSettings {
        fn default() -> Self {
            Self {
                name: "server".to_string(),
                max_players: 100,
                motd: "Welcome!".to_string(),
                whitelist: Vec::new(),
            }
        }
    }

    pub fn settings_key() -> DocumentKey {
        DocumentKey::new("cfg", "server-1")
    }

    pub fn settings(max_players: u32) -> Document {
        Document::new()
            .with("name", "server-1")
            .with("max_players", max_players)
            .with("motd", "Welcome!")
    }

    pub fn messages_key() -> DocumentKey {
        DocumentKey::new("messages", "lobby")
    }

    pub fn messages_en() -> Document {
        Document::from_value(json!({
            "lobby": {
                "welcome": "Welcome, {player}!",
                "rules": ["Be kind to {player}", "No griefing"],
                "players": "{count} of {max} players online"
            }
        }))
        .unwrap_or_default()
    }

    pub fn messages_de() -> Document {
        Document::from_value(json!({
            "lobby": {
                "welcome": "Willkommen, {player}!"
            }
        }))
        .unwrap_or_default()
    }

    /// Write the `en` and `de` lobby message documents.
    pub async fn seed_messages(store: &dyn DocumentStore) -> SyncResult<()> {
        let base = messages_key();
        store.upsert(&base.localized("en"), &messages_en()).await?;
        store.upsert(&base.localized("de"), &messages_de()).await?;
        Ok(())
    }

    /// Options with short timings so feed tests settle quickly.
    pub fn fast_options() -> SyncOptions {
        let mut options = SyncOptions::new("test");
        options.feed.initial_backoff = Duration::from_millis(10);
        options.feed.max_backoff = Duration::from_millis(50);
        options.feed.jitter = Duration::from_millis(1);
        options.feed.max_await = Duration::from_millis(20);
        options
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on DOCSYNC results.

    use super::*;

    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &SyncResult<T>, kind: ErrorKind) {
        match result {
            Err(e) if e.kind() == kind => {}
            other => panic!("Expected {:?} error, got: {:?}", kind, other),
        }
    }

    /// Poll `condition` every 10ms until it holds, failing after `timeout`.
    #[track_caller]
    pub fn eventually<F>(condition: F, timeout: Duration) -> impl std::future::Future<Output = ()>
    where
        F: Fn() -> bool,
    {
        let location = std::panic::Location::caller();
        async move {
            let deadline = tokio::time::Instant::now() + timeout;
            while !condition() {
                if tokio::time::Instant::now() >= deadline {
                    panic!("condition not met within {:?} ({})", timeout, location);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Route `tracing` output to the test harness.
///
/// Honors `RUST_LOG`; defaults to `docsync=debug`. Safe to call from every
/// test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docsync=debug,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_counting_store_counts_and_gates() {
        let inner = InMemoryDocumentStore::new();
        let counting = CountingStore::new(Arc::new(inner));
        let key = fixtures::settings_key();
        counting.upsert(&key, &fixtures::settings(10)).await.unwrap();

        counting.hold();
        let reader = {
            let counting = counting.clone();
            let key = key.clone();
            tokio::spawn(async move { counting.get(&key).await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        counting.release();
        let found = reader.await.unwrap().unwrap();
        assert!(found.is_some());
        assert_eq!(counting.gets(), 1);
        assert_eq!(counting.gets_for(&key), 1);
    }

    #[tokio::test]
    async fn test_seed_messages() {
        let store = InMemoryDocumentStore::new();
        fixtures::seed_messages(&store).await.unwrap();
        let de = store
            .get(&fixtures::messages_key().localized("de"))
            .await
            .unwrap()
            .unwrap();
        assert!(de.document.get_path("lobby.welcome").is_some());
    }

    #[test]
    fn test_fast_options_are_valid() {
        init_tracing();
        assert!(fixtures::fast_options().validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_versioned_writes_strictly_increase(writes in generators::arb_versioned_writes()) {
            for pair in writes.windows(2) {
                prop_assert!(pair[0].1 < pair[1].1);
            }
        }

        #[test]
        fn prop_generated_keys_are_non_empty(key in generators::arb_document_key()) {
            prop_assert!(!key.collection.is_empty());
            prop_assert!(!key.id.is_empty());
        }
    }
}
