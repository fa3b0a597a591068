//! Change Feed Supervisor
//!
//! Keeps one collection of the coherent cache in step with the store. Each
//! supervisor cycles through:
//!
//! ```text
//! DISCONNECTED → CONNECTING → STREAMING → (on error) RECONNECTING → CONNECTING …
//! ```
//!
//! - CONNECTING loads the last checkpoint and opens the feed from it.
//! - An expired position clears the checkpoint, reopens the feed from "now"
//!   and re-fetches every cached key of the collection (a reconcile).
//! - Opening without any position also reconciles, since events may have been
//!   missed while nobody was watching.
//! - Checkpoints are saved every `batch_size` events or after `max_await` of
//!   silence, whichever comes first.
//!
//! The supervisor never gives up. Failures back off exponentially with jitter
//! and show up as `Degraded` health while reads keep being served.

use std::sync::Arc;
use std::time::Duration;

use docsync_core::{
    ChangeEvent, FeedOptions, OperationType, ResumeCheckpoint, ResumeToken, StoreError,
};
use docsync_storage::{CoherentCache, DocumentStore, ResumeTokenStore};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::status::{FeedMetrics, FeedMonitor, FeedState, FeedStatus};

/// Keys re-fetched concurrently during a reconcile.
const RECONCILE_CONCURRENCY: usize = 16;

enum SessionEnd {
    Shutdown,
    Expired,
    Invalidated,
    Failed(String),
}

enum Step {
    Shutdown,
    Ignore,
    Idle,
    Event(ChangeEvent),
    Failed(StoreError),
    Closed,
}

/// Supervises the change feed of a single collection.
pub struct ChangeFeedSupervisor {
    collection: String,
    store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn ResumeTokenStore>,
    cache: CoherentCache,
    options: FeedOptions,
    monitor: FeedMonitor,
}

impl ChangeFeedSupervisor {
    pub fn new(
        collection: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        tokens: Arc<dyn ResumeTokenStore>,
        cache: CoherentCache,
        options: FeedOptions,
    ) -> Self {
        let collection = collection.into();
        let monitor = FeedMonitor::new(&collection);
        Self {
            collection,
            store,
            tokens,
            cache,
            options,
            monitor,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Handle for observing this supervisor once it has been moved into a task.
    pub fn monitor(&self) -> FeedMonitor {
        self.monitor.clone()
    }

    /// Run on a new task until `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<FeedStatus> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Returns the final status.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> FeedStatus {
        info!(collection = %self.collection, "Change feed supervisor started");

        let mut backoff = Backoff::new(&self.options);
        let mut reconcile = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.monitor.set_state(FeedState::Connecting);

            match self.session(&mut shutdown, &mut backoff, &mut reconcile).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Invalidated => {
                    FeedMetrics::bump(&self.monitor.metrics().reconnects);
                    info!(collection = %self.collection, "Reopening invalidated change feed");
                    continue;
                }
                SessionEnd::Expired => {
                    FeedMetrics::bump(&self.monitor.metrics().reconnects);
                    warn!(
                        collection = %self.collection,
                        "Resume position expired, reconciling cached keys"
                    );
                    if let Err(e) = self.tokens.clear(&self.collection).await {
                        warn!(collection = %self.collection, error = %e, "Failed to clear expired checkpoint");
                    }
                    // Watching from "now" should never expire; if it does, back off.
                    let first_expiry = !reconcile;
                    reconcile = true;
                    if first_expiry {
                        continue;
                    }
                    self.monitor
                        .record_error("change feed expired without a resume position");
                }
                SessionEnd::Failed(reason) => {
                    FeedMetrics::bump(&self.monitor.metrics().reconnects);
                    self.monitor.record_error(reason);
                }
            }

            self.monitor.set_state(FeedState::Reconnecting);
            let delay = backoff.next_delay();
            warn!(
                collection = %self.collection,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = ?self.monitor.status().last_error,
                "Change feed disconnected, retrying"
            );
            if !sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        self.monitor.set_state(FeedState::Disconnected);
        let status = self.monitor.status();
        info!(
            collection = %self.collection,
            events_applied = status.events_applied,
            reconnects = status.reconnects,
            reconciles = status.reconciles,
            "Change feed supervisor stopped"
        );
        status
    }

    /// One connection: open the feed, then apply events until it ends.
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
        reconcile: &mut bool,
    ) -> SessionEnd {
        let token = if *reconcile {
            None
        } else {
            match self.tokens.load(&self.collection).await {
                Ok(checkpoint) => checkpoint.map(|c| c.token),
                Err(e) => return SessionEnd::Failed(e.to_string()),
            }
        };
        if token.is_none() && !self.cache.keys(Some(&self.collection)).is_empty() {
            *reconcile = true;
        }

        let mut stream = match self.store.watch(&self.collection, token.as_ref()).await {
            Ok(stream) => stream,
            Err(StoreError::FeedExpired { .. }) => return SessionEnd::Expired,
            Err(e) => return SessionEnd::Failed(e.to_string()),
        };

        // The feed is open before re-fetching, so nothing slips between the two.
        if *reconcile {
            self.reconcile().await;
            *reconcile = false;
        }

        self.monitor.set_state(FeedState::Streaming);
        backoff.reset();
        info!(
            collection = %self.collection,
            resumed = token.is_some(),
            "Change feed connected"
        );

        let mut unsaved: Option<ResumeToken> = None;
        let mut batched = 0usize;

        loop {
            let step = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Step::Shutdown
                    } else {
                        Step::Ignore
                    }
                }
                next = tokio::time::timeout(self.options.max_await, stream.next()) => match next {
                    Err(_) => Step::Idle,
                    Ok(Some(Ok(event))) => Step::Event(event),
                    Ok(Some(Err(e))) => Step::Failed(e),
                    Ok(None) => Step::Closed,
                },
            };

            match step {
                Step::Ignore => {}
                Step::Shutdown => {
                    self.checkpoint(&mut unsaved).await;
                    return SessionEnd::Shutdown;
                }
                Step::Idle => {
                    if batched > 0 {
                        self.checkpoint(&mut unsaved).await;
                        batched = 0;
                    }
                }
                Step::Event(event) => {
                    unsaved = Some(event.resume_token.clone());
                    batched += 1;
                    if self.apply(event) {
                        self.checkpoint(&mut unsaved).await;
                        return SessionEnd::Invalidated;
                    }
                    if batched >= self.options.batch_size {
                        self.checkpoint(&mut unsaved).await;
                        batched = 0;
                    }
                }
                Step::Failed(StoreError::FeedExpired { .. }) => return SessionEnd::Expired,
                Step::Failed(e) => {
                    self.checkpoint(&mut unsaved).await;
                    return SessionEnd::Failed(e.to_string());
                }
                Step::Closed => {
                    self.checkpoint(&mut unsaved).await;
                    return SessionEnd::Failed("change stream closed".to_string());
                }
            }
        }
    }

    /// Apply one event to the cache. Returns `true` if the feed was invalidated.
    fn apply(&self, event: ChangeEvent) -> bool {
        let metrics = self.monitor.metrics();

        if event.operation == OperationType::Invalidate {
            FeedMetrics::bump(&metrics.invalidations);
            let invalidated = self.cache.invalidate_collection(&self.collection);
            warn!(
                collection = %self.collection,
                invalidated,
                "Change feed invalidated, collection marked stale"
            );
            return true;
        }

        let key = event.key();
        if self.cache.pending().observe(&key, event.version) {
            FeedMetrics::bump(&metrics.self_writes_suppressed);
            debug!(key = %key, version = ?event.version, "Event matches an in-flight save");
            return false;
        }

        let operation = event.operation;
        let changed = match (operation, event.full_document, event.version) {
            (OperationType::Delete, _, version) => self.cache.mark_absent_if_tracked(&key, version),
            (_, Some(document), Some(version)) => self.cache.refresh(&key, document, version),
            (_, _, version) => self.cache.invalidate_version(&key, version),
        };
        FeedMetrics::bump(&metrics.events_applied);
        trace!(key = %key, operation = ?operation, changed, "Change event applied");
        false
    }

    async fn checkpoint(&self, unsaved: &mut Option<ResumeToken>) {
        let Some(token) = unsaved.take() else {
            return;
        };
        let checkpoint = ResumeCheckpoint::new(self.collection.as_str(), token);
        match self.tokens.save(&checkpoint).await {
            Ok(()) => {
                self.monitor.record_checkpoint();
                trace!(collection = %self.collection, token = ?checkpoint.token, "Checkpoint saved");
            }
            Err(e) => {
                FeedMetrics::bump(&self.monitor.metrics().checkpoint_failures);
                warn!(collection = %self.collection, error = %e, "Failed to save checkpoint");
                // Retried with the next batch.
                *unsaved = Some(checkpoint.token);
            }
        }
    }

    /// Re-fetch every cached key of the collection.
    ///
    /// Keys that cannot be fetched are marked stale so the next read retries.
    async fn reconcile(&self) {
        FeedMetrics::bump(&self.monitor.metrics().reconciles);
        let keys = self.cache.keys(Some(&self.collection));
        info!(collection = %self.collection, keys = keys.len(), "Reconciling cached keys");

        let failures = futures_util::stream::iter(keys)
            .map(|key| {
                let store = Arc::clone(&self.store);
                let cache = self.cache.clone();
                async move {
                    let loader_key = key.clone();
                    let loaded = cache
                        .reload(&key, move || async move { store.get(&loader_key).await })
                        .await;
                    match loaded {
                        Ok(_) => 0usize,
                        Err(e) => {
                            debug!(key = %key, error = %e, "Reconcile fetch failed");
                            cache.invalidate(&key);
                            1
                        }
                    }
                }
            })
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .fold(0usize, |total, failed| async move { total + failed })
            .await;

        if failures > 0 {
            warn!(collection = %self.collection, failures, "Reconcile left keys stale");
        }
    }
}

/// Sleep for `delay`, returning `false` early if shutdown is requested.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
