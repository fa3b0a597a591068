//! The coherent cache.
//!
//! Entries move between four states:
//!
//! ```text
//!             load ok            ttl / invalidate
//!   (none) ──► LOADING ──► FRESH ─────────────────► STALE
//!                 │          ▲                        │
//!                 │          └──── refresh / put ─────┘
//!                 │ not found
//!                 ▼
//!              ABSENT ── negative ttl ──► (reload on next read)
//! ```
//!
//! Every slot carries an epoch bumped on each write or invalidation. A load
//! records the epoch it started at, so a result landing after a newer write
//! (or after an invalidation) can be recognised and demoted or dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docsync_core::{CacheOptions, Document, DocumentKey, StoreError, Version, VersionedDocument};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pending::PendingWrites;
use super::read::CacheRead;
use super::stats::{CacheCounters, CacheStats};
use crate::store::StoreResult;

/// What a finished load hands to everyone waiting on it.
type Loaded = Option<(Arc<Document>, Option<Version>)>;
type LoadOutcome = Result<Loaded, StoreError>;

/// State of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Value confirmed by the store or the change feed within the TTL.
    Fresh,
    /// Value may be outdated; served while a refresh runs.
    Stale,
    /// Nothing usable cached; a load is in flight.
    Loading,
    /// The store confirmed the document does not exist.
    Absent,
}

/// Read-only view of one entry, for inspection and fallbacks.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: DocumentKey,
    pub value: Option<Arc<Document>>,
    pub version: Option<Version>,
    pub state: CacheState,
    /// Time since the entry was last confirmed.
    pub age: Duration,
    /// Whether a load is in flight for the key.
    pub loading: bool,
}

/// Entry contents captured before an optimistic update, used to roll back a
/// failed save.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    value: Option<Arc<Document>>,
    version: Option<Version>,
}

struct Flight {
    id: u64,
    started_epoch: u64,
    tx: Arc<watch::Sender<Option<LoadOutcome>>>,
}

struct FlightTicket {
    id: u64,
    tx: Arc<watch::Sender<Option<LoadOutcome>>>,
}

struct Slot {
    value: Option<Arc<Document>>,
    version: Option<Version>,
    state: CacheState,
    last_access: Instant,
    last_refresh: Instant,
    epoch: u64,
    flight: Option<Flight>,
}

impl Slot {
    fn loading(now: Instant) -> Self {
        Self {
            value: None,
            version: None,
            state: CacheState::Loading,
            last_access: now,
            last_refresh: now,
            epoch: 0,
            flight: None,
        }
    }

    fn fresh(value: Arc<Document>, version: Option<Version>, now: Instant) -> Self {
        Self {
            value: Some(value),
            version,
            state: CacheState::Fresh,
            ..Self::loading(now)
        }
    }

    fn absent(version: Option<Version>, now: Instant) -> Self {
        Self {
            version,
            state: CacheState::Absent,
            ..Self::loading(now)
        }
    }

    fn loaded(&self) -> Loaded {
        self.value.clone().map(|value| (value, self.version))
    }

    fn touch(&mut self, now: Instant) {
        self.last_refresh = now;
        self.epoch += 1;
    }
}

enum ReadPlan {
    Hit(CacheRead<Arc<Document>>),
    Absent,
    Revalidate(CacheRead<Arc<Document>>, FlightTicket),
    Join(watch::Receiver<Option<LoadOutcome>>),
    Load(FlightTicket),
}

struct Inner {
    slots: DashMap<DocumentKey, Slot>,
    options: CacheOptions,
    pending: PendingWrites,
    counters: CacheCounters,
    next_flight: AtomicU64,
}

/// Process-local cache kept coherent by the change feed and local saves.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Clone)]
pub struct CoherentCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CoherentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentCache")
            .field("entries", &self.inner.slots.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl CoherentCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                options,
                pending: PendingWrites::new(),
                counters: CacheCounters::default(),
                next_flight: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Registry of saves in flight, shared with the change feed.
    pub fn pending(&self) -> &PendingWrites {
        &self.inner.pending
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a key, loading it with `loader` when nothing usable is cached.
    ///
    /// - fresh entries are returned without calling `loader`
    /// - stale entries are returned immediately and refreshed in the background
    /// - absent entries within the negative TTL return `Ok(None)`
    /// - otherwise one load runs and every concurrent reader shares its result
    ///
    /// Loads run on a spawned task, so a caller that gives up does not cancel
    /// the load for the others.
    pub async fn read_through<F, Fut>(
        &self,
        key: &DocumentKey,
        loader: F,
    ) -> StoreResult<Option<CacheRead<Arc<Document>>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<Option<VersionedDocument>>> + Send + 'static,
    {
        let (plan, inserted) = self.plan_read(key);
        if inserted {
            self.enforce_capacity(Some(key));
        }

        match plan {
            ReadPlan::Hit(read) => {
                trace!(key = %key, "cache hit");
                Ok(Some(read))
            }
            ReadPlan::Absent => {
                trace!(key = %key, "negative cache hit");
                Ok(None)
            }
            ReadPlan::Revalidate(read, ticket) => {
                debug!(key = %key, "serving stale value, refreshing in background");
                self.launch(key.clone(), ticket, loader);
                Ok(Some(read))
            }
            ReadPlan::Join(rx) => Self::await_flight(rx).await.map(Self::into_read),
            ReadPlan::Load(ticket) => {
                let rx = ticket.tx.subscribe();
                self.launch(key.clone(), ticket, loader);
                Self::await_flight(rx).await.map(Self::into_read)
            }
        }
    }

    /// Force a load of `key` regardless of its state, joining one already in
    /// flight. Cached values stay readable while the load runs.
    pub async fn reload<F, Fut>(
        &self,
        key: &DocumentKey,
        loader: F,
    ) -> StoreResult<Option<Arc<Document>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<Option<VersionedDocument>>> + Send + 'static,
    {
        let now = Instant::now();
        let mut inserted = false;
        let plan = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match &slot.flight {
                    Some(flight) => ReadPlan::Join(flight.tx.subscribe()),
                    None => {
                        if slot.value.is_none() {
                            slot.state = CacheState::Loading;
                        }
                        ReadPlan::Load(self.start_flight(slot))
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = Slot::loading(now);
                let ticket = self.start_flight(&mut slot);
                vacant.insert(slot);
                inserted = true;
                ReadPlan::Load(ticket)
            }
        };
        if inserted {
            self.enforce_capacity(Some(key));
        }

        let outcome = match plan {
            ReadPlan::Join(rx) => Self::await_flight(rx).await,
            ReadPlan::Load(ticket) => {
                let rx = ticket.tx.subscribe();
                self.launch(key.clone(), ticket, loader);
                Self::await_flight(rx).await
            }
            _ => Ok(None),
        };
        outcome.map(|loaded| loaded.map(|(value, _)| value))
    }

    /// Wait for an in-flight load of `key`, if any, to land.
    pub async fn settle(&self, key: &DocumentKey) {
        let rx = self
            .inner
            .slots
            .get(key)
            .and_then(|slot| slot.flight.as_ref().map(|flight| flight.tx.subscribe()));
        if let Some(rx) = rx {
            let _ = Self::await_flight(rx).await;
        }
    }

    fn plan_read(&self, key: &DocumentKey) -> (ReadPlan, bool) {
        let now = Instant::now();
        let counters = &self.inner.counters;
        let entry_ttl = self.inner.options.entry_ttl;
        let negative_ttl = self.inner.options.negative_ttl;

        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.last_access = now;
                let age = now.saturating_duration_since(slot.last_refresh);

                let plan = match (slot.state, slot.value.clone()) {
                    (CacheState::Fresh, Some(value)) if age <= entry_ttl => {
                        CacheCounters::bump(&counters.hits);
                        ReadPlan::Hit(CacheRead::from_cache(
                            value,
                            slot.version,
                            CacheState::Fresh,
                            age,
                            false,
                        ))
                    }
                    (CacheState::Fresh | CacheState::Stale, Some(value)) => {
                        CacheCounters::bump(&counters.stale_hits);
                        slot.state = CacheState::Stale;
                        let version = slot.version;
                        if slot.flight.is_some() {
                            ReadPlan::Hit(CacheRead::from_cache(
                                value,
                                version,
                                CacheState::Stale,
                                age,
                                true,
                            ))
                        } else {
                            let ticket = self.start_flight(slot);
                            ReadPlan::Revalidate(
                                CacheRead::from_cache(value, version, CacheState::Stale, age, true),
                                ticket,
                            )
                        }
                    }
                    (CacheState::Absent, _) if age <= negative_ttl => {
                        CacheCounters::bump(&counters.negative_hits);
                        ReadPlan::Absent
                    }
                    _ => {
                        CacheCounters::bump(&counters.misses);
                        match &slot.flight {
                            Some(flight) => ReadPlan::Join(flight.tx.subscribe()),
                            None => {
                                slot.state = CacheState::Loading;
                                ReadPlan::Load(self.start_flight(slot))
                            }
                        }
                    }
                };
                (plan, false)
            }
            Entry::Vacant(vacant) => {
                CacheCounters::bump(&counters.misses);
                let mut slot = Slot::loading(now);
                let ticket = self.start_flight(&mut slot);
                vacant.insert(slot);
                (ReadPlan::Load(ticket), true)
            }
        }
    }

    fn start_flight(&self, slot: &mut Slot) -> FlightTicket {
        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(None);
        let tx = Arc::new(tx);
        slot.flight = Some(Flight {
            id,
            started_epoch: slot.epoch,
            tx: Arc::clone(&tx),
        });
        FlightTicket { id, tx }
    }

    fn launch<F, Fut>(&self, key: DocumentKey, ticket: FlightTicket, loader: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<Option<VersionedDocument>>> + Send + 'static,
    {
        CacheCounters::bump(&self.inner.counters.loads);
        let cache = self.clone();
        let timeout = self.inner.options.load_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, loader()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout { after: timeout }),
            };
            let outcome = cache.complete_flight(&key, ticket.id, result);
            ticket.tx.send_replace(Some(outcome));
        });
    }

    async fn await_flight(mut rx: watch::Receiver<Option<LoadOutcome>>) -> LoadOutcome {
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| Err(StoreError::unavailable("load produced no result"))),
            Err(_) => Err(StoreError::unavailable("load abandoned")),
        }
    }

    fn into_read(loaded: Loaded) -> Option<CacheRead<Arc<Document>>> {
        loaded.map(|(value, version)| CacheRead::from_store(value, version))
    }

    /// Outcome of a load whose slot was removed or taken over meanwhile.
    fn detached(result: StoreResult<Option<VersionedDocument>>) -> LoadOutcome {
        result.map(|found| found.map(|v| (Arc::new(v.document), Some(v.version))))
    }

    /// Apply a finished load to its slot and decide what waiters see.
    fn complete_flight(
        &self,
        key: &DocumentKey,
        flight_id: u64,
        result: StoreResult<Option<VersionedDocument>>,
    ) -> LoadOutcome {
        let now = Instant::now();
        let pending = self.inner.pending.is_pending(key);
        let mut remove_empty = false;
        let outcome = {
            let Some(mut slot) = self.inner.slots.get_mut(key) else {
                return Self::detached(result);
            };
            let Some(started_epoch) = slot
                .flight
                .as_ref()
                .filter(|flight| flight.id == flight_id)
                .map(|flight| flight.started_epoch)
            else {
                drop(slot);
                return Self::detached(result);
            };
            slot.flight = None;

            let disturbed = slot.epoch != started_epoch;
            // A write landed during the load: its value is at least as new.
            let superseded =
                pending || (disturbed && matches!(slot.state, CacheState::Fresh | CacheState::Absent));

            match result {
                Ok(_) if superseded => {
                    debug!(key = %key, "load result superseded by a newer write");
                    if slot.state == CacheState::Absent {
                        Ok(None)
                    } else {
                        Ok(slot.loaded())
                    }
                }
                Ok(Some(found)) if slot.version.is_some_and(|current| current > found.version) => {
                    Ok(slot.loaded())
                }
                Ok(Some(found)) => {
                    let value = Arc::new(found.document);
                    slot.value = Some(Arc::clone(&value));
                    slot.version = Some(found.version);
                    slot.last_refresh = now;
                    // Invalidated mid-flight: the store may have moved on again.
                    slot.state = if disturbed {
                        CacheState::Stale
                    } else {
                        CacheState::Fresh
                    };
                    Ok(Some((value, Some(found.version))))
                }
                Ok(None) => {
                    slot.value = None;
                    slot.state = CacheState::Absent;
                    slot.last_refresh = now;
                    Ok(None)
                }
                Err(error) => {
                    CacheCounters::bump(&self.inner.counters.load_failures);
                    warn!(key = %key, error = %error, "cache load failed");
                    if slot.value.is_none() && slot.state == CacheState::Loading {
                        remove_empty = true;
                    }
                    Err(error)
                }
            }
        };

        if remove_empty {
            self.inner.slots.remove_if(key, |_, slot| {
                slot.flight.is_none() && slot.value.is_none() && slot.state == CacheState::Loading
            });
        }
        outcome
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a value confirmed at `version`, creating the entry if needed.
    ///
    /// Older versions are ignored; an equal version only upgrades a stale
    /// entry. Returns whether the entry changed.
    pub fn put(&self, key: &DocumentKey, document: Document, version: Version) -> bool {
        self.apply_document(key, Arc::new(document), version, true)
    }

    /// Like [`put`](Self::put) but only for keys already tracked.
    pub fn refresh(&self, key: &DocumentKey, document: Document, version: Version) -> bool {
        self.apply_document(key, Arc::new(document), version, false)
    }

    fn apply_document(
        &self,
        key: &DocumentKey,
        document: Arc<Document>,
        version: Version,
        insert: bool,
    ) -> bool {
        let now = Instant::now();
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let Some(current) = slot.version {
                    if version < current || (version == current && slot.state == CacheState::Fresh)
                    {
                        return false;
                    }
                }
                slot.value = Some(document);
                slot.version = Some(version);
                slot.state = CacheState::Fresh;
                slot.touch(now);
                true
            }
            Entry::Vacant(vacant) => {
                if !insert {
                    return false;
                }
                vacant.insert(Slot::fresh(document, Some(version), now));
                self.after_insert(key);
                true
            }
        }
    }

    /// Record that `key` does not exist, creating the entry if needed.
    pub fn mark_absent(&self, key: &DocumentKey, version: Option<Version>) -> bool {
        self.apply_absent(key, version, true)
    }

    /// Record a deletion for a key already tracked.
    pub fn mark_absent_if_tracked(&self, key: &DocumentKey, version: Option<Version>) -> bool {
        self.apply_absent(key, version, false)
    }

    fn apply_absent(&self, key: &DocumentKey, version: Option<Version>, insert: bool) -> bool {
        let now = Instant::now();
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let (Some(deleted_at), Some(current)) = (version, slot.version) {
                    if deleted_at < current {
                        return false;
                    }
                }
                slot.value = None;
                slot.state = CacheState::Absent;
                if version.is_some() {
                    slot.version = version;
                }
                slot.touch(now);
                true
            }
            Entry::Vacant(vacant) => {
                if !insert {
                    return false;
                }
                vacant.insert(Slot::absent(version, now));
                self.after_insert(key);
                true
            }
        }
    }

    /// Mark `key` stale so the next read refreshes it.
    ///
    /// Negative entries are dropped outright. Returns whether the key was
    /// tracked.
    pub fn invalidate(&self, key: &DocumentKey) -> bool {
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state == CacheState::Absent {
                    occupied.remove();
                    return true;
                }
                let slot = occupied.get_mut();
                if slot.state == CacheState::Fresh {
                    slot.state = CacheState::Stale;
                }
                slot.epoch += 1;
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Invalidate unless the entry already holds `version` or newer.
    pub fn invalidate_version(&self, key: &DocumentKey, version: Option<Version>) -> bool {
        let current = self.inner.slots.get(key).map(|slot| (slot.state, slot.version));
        match (current, version) {
            (None, _) => false,
            (Some((CacheState::Fresh, Some(current))), Some(seen)) if current >= seen => false,
            _ => self.invalidate(key),
        }
    }

    /// Invalidate every entry of `collection`. Returns how many were tracked.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        self.keys(Some(collection))
            .iter()
            .filter(|key| self.invalidate(key))
            .count()
    }

    pub fn invalidate_all(&self) -> usize {
        self.keys(None)
            .iter()
            .filter(|key| self.invalidate(key))
            .count()
    }

    pub fn remove(&self, key: &DocumentKey) -> bool {
        self.inner.slots.remove(key).is_some()
    }

    /// Install a locally saved value before the store confirms it.
    ///
    /// The version is left unchanged until [`put`](Self::put) records the one
    /// the store assigned. Returns what the entry held before, for
    /// [`rollback`](Self::rollback).
    pub fn optimistic_put(&self, key: &DocumentKey, document: Document) -> Option<EntrySnapshot> {
        let now = Instant::now();
        let document = Arc::new(document);
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let snapshot = EntrySnapshot {
                    value: slot.value.take(),
                    version: slot.version,
                };
                slot.value = Some(document);
                slot.state = CacheState::Fresh;
                slot.touch(now);
                Some(snapshot)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::fresh(document, None, now));
                self.after_insert(key);
                None
            }
        }
    }

    /// Undo an [`optimistic_put`](Self::optimistic_put) after a failed save.
    ///
    /// A previous value comes back as stale; an entry that held nothing is
    /// removed.
    pub fn rollback(&self, key: &DocumentKey, snapshot: Option<EntrySnapshot>) {
        let now = Instant::now();
        match snapshot {
            Some(EntrySnapshot {
                value: Some(value),
                version,
            }) => {
                if let Some(mut slot) = self.inner.slots.get_mut(key) {
                    slot.value = Some(value);
                    slot.version = version;
                    slot.state = CacheState::Stale;
                    slot.touch(now);
                }
            }
            _ => {
                self.remove(key);
            }
        }
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn peek(&self, key: &DocumentKey) -> Option<CacheEntry> {
        let now = Instant::now();
        self.inner.slots.get(key).map(|slot| CacheEntry {
            key: key.clone(),
            value: slot.value.clone(),
            version: slot.version,
            state: slot.state,
            age: now.saturating_duration_since(slot.last_refresh),
            loading: slot.flight.is_some(),
        })
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.inner.slots.contains_key(key)
    }

    /// Tracked keys, optionally limited to one collection.
    pub fn keys(&self, collection: Option<&str>) -> Vec<DocumentKey> {
        self.inner
            .slots
            .iter()
            .filter(|entry| collection.map_or(true, |c| entry.key().collection == c))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.len() as u64)
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    fn after_insert(&self, key: &DocumentKey) {
        if self.inner.slots.len() > self.inner.options.max_entries {
            self.enforce_capacity(Some(key));
        }
    }

    /// Evict least recently accessed entries once over `max_entries`.
    ///
    /// Evicts a small batch below the limit so a full cache does not rescan on
    /// every insert. Entries with a load or save in flight are never evicted.
    fn enforce_capacity(&self, protect: Option<&DocumentKey>) {
        let max = self.inner.options.max_entries;
        let len = self.inner.slots.len();
        if len <= max {
            return;
        }
        let target = (len - max) + max / 64;

        let mut candidates: Vec<(Instant, DocumentKey)> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.flight.is_none() && Some(entry.key()) != protect)
            .map(|entry| (entry.last_access, entry.key().clone()))
            .collect();
        candidates.retain(|(_, key)| !self.inner.pending.is_pending(key));
        candidates.sort_by_key(|(last_access, _)| *last_access);

        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(target) {
            if self
                .inner
                .slots
                .remove_if(&key, |_, slot| slot.flight.is_none())
                .is_some()
            {
                CacheCounters::bump(&self.inner.counters.evictions);
                evicted += 1;
            }
        }
        debug!(evicted, max_entries = max, "cache over capacity, evicted entries");
    }
}
