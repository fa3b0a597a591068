//! In-process document store with a bounded change journal.
//!
//! Clones share the same underlying state, so several engines built on clones
//! behave like independent processes talking to one database. The journal is
//! bounded per collection: once an event is trimmed, resume tokens older than
//! it expire, exactly like a capped server-side oplog.
//!
//! Fault-injection knobs (unavailability, latency, rejected writes, dropped
//! watchers, journal compaction) exist for tests and demos.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{
    ChangeEvent, Document, DocumentKey, OperationType, ResumeToken, StoreError, Version,
    VersionedDocument,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use super::{ChangeStream, DocumentStore, InsertOutcome, StoreResult};

const DEFAULT_JOURNAL_CAPACITY: usize = 1024;
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Shared in-memory document store.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    journal_capacity: usize,
    unavailable: AtomicBool,
    reject_writes: AtomicBool,
    full_document: AtomicBool,
    latency_ms: AtomicU64,
    disconnects: watch::Sender<u64>,
    gets: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    watches: AtomicU64,
}

#[derive(Default)]
struct State {
    sequence: u64,
    documents: HashMap<DocumentKey, VersionedDocument>,
    journals: HashMap<String, Journal>,
    get_counts: HashMap<DocumentKey, u64>,
}

struct Journal {
    /// Highest sequence trimmed from `events`. Tokens below it are expired.
    floor: u64,
    events: VecDeque<(u64, ChangeEvent)>,
    live: broadcast::Sender<(u64, ChangeEvent)>,
}

impl Journal {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            floor: 0,
            events: VecDeque::new(),
            live,
        }
    }
}

/// Counters for calls that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatsSnapshot {
    pub gets: u64,
    pub writes: u64,
    pub deletes: u64,
    pub watches: u64,
}

enum Step {
    Disconnected,
    Received(Result<(u64, ChangeEvent), RecvError>),
}

fn encode_token(sequence: u64) -> ResumeToken {
    ResumeToken::from_bytes(sequence.to_be_bytes().to_vec())
}

fn decode_token(token: &ResumeToken) -> Option<u64> {
    let bytes: [u8; 8] = token.as_bytes().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    /// Create a store retaining at most `capacity` events per collection.
    pub fn with_journal_capacity(capacity: usize) -> Self {
        let (disconnects, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                journal_capacity: capacity.max(1),
                unavailable: AtomicBool::new(false),
                reject_writes: AtomicBool::new(false),
                full_document: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                disconnects,
                gets: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
                watches: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // FAULT INJECTION
    // ========================================================================

    /// Fail every call with `StoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail every write with `StoreError::Rejected` while set.
    pub fn set_reject_writes(&self, reject: bool) {
        self.inner.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Delay every point operation.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Whether change events carry the post-image of the document.
    pub fn set_full_document(&self, enabled: bool) {
        self.inner.full_document.store(enabled, Ordering::SeqCst);
    }

    /// End every open change stream with a connection error.
    pub fn disconnect_watchers(&self) {
        self.inner.disconnects.send_modify(|generation| *generation += 1);
    }

    /// Discard the retained journal for a collection, expiring all tokens
    /// issued so far.
    pub fn compact_journal(&self, collection: &str) {
        if let Ok(mut state) = self.inner.state.lock() {
            let sequence = state.sequence;
            let journal = state
                .journals
                .entry(collection.to_string())
                .or_insert_with(Journal::new);
            journal.events.clear();
            journal.floor = sequence;
        }
    }

    /// Remove every document of a collection and invalidate its feeds.
    pub fn drop_collection(&self, collection: &str) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.documents.retain(|key, _| key.collection != collection);
            let version = next_version(&mut state);
            let key = DocumentKey::new(collection, "");
            self.record(&mut state, &key, OperationType::Invalidate, None, version);
        }
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            gets: self.inner.gets.load(Ordering::SeqCst),
            writes: self.inner.writes.load(Ordering::SeqCst),
            deletes: self.inner.deletes.load(Ordering::SeqCst),
            watches: self.inner.watches.load(Ordering::SeqCst),
        }
    }

    /// Number of `get` calls that reached the store for one key.
    pub fn get_count(&self, key: &DocumentKey) -> u64 {
        self.inner
            .state
            .lock()
            .map(|state| state.get_counts.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::unavailable("store state lock poisoned"))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("simulated outage"));
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.check_available()?;
        if self.inner.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::rejected("writes are rejected"));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let ms = self.inner.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn record(
        &self,
        state: &mut State,
        key: &DocumentKey,
        operation: OperationType,
        document: Option<&Document>,
        version: Version,
    ) {
        let full_document = if self.inner.full_document.load(Ordering::SeqCst) {
            document.cloned()
        } else {
            None
        };
        let event = ChangeEvent {
            collection: key.collection.clone(),
            id: key.id.clone(),
            operation,
            full_document,
            version: Some(version),
            resume_token: encode_token(version),
        };

        let capacity = self.inner.journal_capacity;
        let journal = state
            .journals
            .entry(key.collection.clone())
            .or_insert_with(Journal::new);
        journal.events.push_back((version, event.clone()));
        while journal.events.len() > capacity {
            if let Some((trimmed, _)) = journal.events.pop_front() {
                journal.floor = trimmed;
            }
        }
        // No receivers is fine: nobody is watching yet.
        let _ = journal.live.send((version, event));
    }
}

fn next_version(state: &mut State) -> Version {
    state.sequence += 1;
    state.sequence
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, key: &DocumentKey) -> StoreResult<Option<VersionedDocument>> {
        self.check_available()?;
        self.simulate_latency().await;
        self.check_available()?;

        self.inner.gets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state()?;
        *state.get_counts.entry(key.clone()).or_insert(0) += 1;
        Ok(state.documents.get(key).cloned())
    }

    async fn upsert(&self, key: &DocumentKey, document: &Document) -> StoreResult<Version> {
        self.check_writable()?;
        self.simulate_latency().await;
        self.check_writable()?;

        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state()?;
        let version = next_version(&mut state);
        let existed = state
            .documents
            .insert(key.clone(), VersionedDocument::new(document.clone(), version))
            .is_some();
        let operation = if existed {
            OperationType::Replace
        } else {
            OperationType::Insert
        };
        self.record(&mut state, key, operation, Some(document), version);
        Ok(version)
    }

    async fn insert_if_absent(
        &self,
        key: &DocumentKey,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        self.check_writable()?;
        self.simulate_latency().await;
        self.check_writable()?;

        let mut state = self.state()?;
        if let Some(existing) = state.documents.get(key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let version = next_version(&mut state);
        state
            .documents
            .insert(key.clone(), VersionedDocument::new(document.clone(), version));
        self.record(&mut state, key, OperationType::Insert, Some(document), version);
        Ok(InsertOutcome::Inserted(version))
    }

    async fn delete(&self, key: &DocumentKey) -> StoreResult<Option<Version>> {
        self.check_writable()?;
        self.simulate_latency().await;
        self.check_writable()?;

        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state()?;
        if state.documents.remove(key).is_none() {
            return Ok(None);
        }
        let version = next_version(&mut state);
        self.record(&mut state, key, OperationType::Delete, None, version);
        Ok(Some(version))
    }

    async fn list_ids(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        self.simulate_latency().await;

        let state = self.state()?;
        let mut ids: Vec<String> = state
            .documents
            .keys()
            .filter(|key| key.collection == collection)
            .map(|key| key.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn watch(
        &self,
        collection: &str,
        from: Option<&ResumeToken>,
    ) -> StoreResult<ChangeStream> {
        self.check_available()?;
        self.inner.watches.fetch_add(1, Ordering::SeqCst);

        let expired = || StoreError::FeedExpired {
            collection: collection.to_string(),
        };

        let (backlog, live, start) = {
            let mut state = self.state()?;
            let current = state.sequence;
            let journal = state
                .journals
                .entry(collection.to_string())
                .or_insert_with(Journal::new);
            let live = journal.live.subscribe();
            match from {
                Some(token) => {
                    let position = decode_token(token).ok_or_else(expired)?;
                    if position < journal.floor || position > current {
                        return Err(expired());
                    }
                    let backlog: Vec<ChangeEvent> = journal
                        .events
                        .iter()
                        .filter(|(sequence, _)| *sequence > position)
                        .map(|(_, event)| event.clone())
                        .collect();
                    (backlog, live, position)
                }
                None => (Vec::new(), live, current),
            }
        };

        let mut disconnect = self.inner.disconnects.subscribe();
        let mut live = live;
        let collection = collection.to_string();

        let stream = async_stream::stream! {
            let mut last = start;
            for event in backlog {
                if let Some(version) = event.version {
                    last = version;
                }
                yield Ok(event);
            }
            loop {
                let step = tokio::select! {
                    _ = disconnect.changed() => Step::Disconnected,
                    received = live.recv() => Step::Received(received),
                };
                match step {
                    Step::Disconnected => {
                        yield Err(StoreError::unavailable(format!(
                            "change stream for {} disconnected",
                            collection
                        )));
                        break;
                    }
                    Step::Received(Ok((sequence, event))) => {
                        if sequence <= last {
                            continue;
                        }
                        last = sequence;
                        let invalidated = event.operation == OperationType::Invalidate;
                        yield Ok(event);
                        if invalidated {
                            break;
                        }
                    }
                    Step::Received(Err(RecvError::Lagged(skipped))) => {
                        yield Err(StoreError::unavailable(format!(
                            "watcher on {} lagged by {} events",
                            collection, skipped
                        )));
                        break;
                    }
                    Step::Received(Err(RecvError::Closed)) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
