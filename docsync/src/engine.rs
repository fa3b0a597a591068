//! Engine wiring
//!
//! Owns one coherent cache, the facade and message resolver built on it, and
//! one change feed supervisor per watched collection.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use docsync_core::{ConfigError, HealthCheck, HealthStatus, SyncOptions, SyncResult};
use docsync_feed::{ChangeFeedSupervisor, FeedMonitor, FeedStatus};
use docsync_storage::{
    CoherentCache, DocumentResumeTokenStore, DocumentStore, InMemoryDocumentStore,
    LmdbResumeTokenStore, ResumeTokenStore,
};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::facade::ConfigFacade;
use crate::messages::MessageResolver;

const MEMORY_URI_SCHEME: &str = "memory://";

/// Builder for [`Engine`].
pub struct EngineBuilder {
    options: SyncOptions,
    store: Option<Arc<dyn DocumentStore>>,
    tokens: Option<Arc<dyn ResumeTokenStore>>,
}

impl EngineBuilder {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            store: None,
            tokens: None,
        }
    }

    /// Store client to read, write and watch through.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where resume checkpoints are kept. Defaults to the checkpoint
    /// collection of the store itself.
    pub fn resume_tokens(mut self, tokens: Arc<dyn ResumeTokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Keep resume checkpoints in a local LMDB environment at `path`.
    pub fn lmdb_checkpoints<P: AsRef<Path>>(self, path: P, max_size_mb: usize) -> SyncResult<Self> {
        let tokens = LmdbResumeTokenStore::new(path, max_size_mb)?;
        Ok(self.resume_tokens(Arc::new(tokens)))
    }

    /// Validate the options and assemble the engine. Nothing is started.
    pub fn build(self) -> SyncResult<Engine> {
        self.options.validate()?;

        let store: Arc<dyn DocumentStore> = match self.store {
            Some(store) => store,
            None if self.options.uri.starts_with(MEMORY_URI_SCHEME) => {
                Arc::new(InMemoryDocumentStore::new())
            }
            None => {
                return Err(ConfigError::MissingRequired {
                    field: "store".to_string(),
                }
                .into())
            }
        };

        let tokens = self.tokens.unwrap_or_else(|| {
            Arc::new(DocumentResumeTokenStore::new(
                Arc::clone(&store),
                self.options.checkpoint_collection.clone(),
            ))
        });

        let cache = CoherentCache::new(self.options.cache.clone());
        let facade = ConfigFacade::new(Arc::clone(&store), cache.clone());
        let messages = MessageResolver::new(facade.clone(), self.options.default_locale.clone());

        Ok(Engine {
            inner: Arc::new(EngineInner {
                options: self.options,
                store,
                tokens,
                cache,
                facade,
                messages,
                running: Mutex::new(None),
            }),
        })
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<FeedStatus>>,
    monitors: Vec<FeedMonitor>,
}

struct EngineInner {
    options: SyncOptions,
    store: Arc<dyn DocumentStore>,
    tokens: Arc<dyn ResumeTokenStore>,
    cache: CoherentCache,
    facade: ConfigFacade,
    messages: MessageResolver,
    running: Mutex<Option<Running>>,
}

/// A running (or startable) coherent document cache.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(options: SyncOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    /// Spawn a supervisor for every watched collection.
    ///
    /// Calling `start` on a running engine does nothing. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.inner.options.watched_collections.len());
        let mut monitors = Vec::with_capacity(handles.capacity());

        for collection in &self.inner.options.watched_collections {
            let supervisor = ChangeFeedSupervisor::new(
                collection.clone(),
                Arc::clone(&self.inner.store),
                Arc::clone(&self.inner.tokens),
                self.inner.cache.clone(),
                self.inner.options.feed.clone(),
            );
            monitors.push(supervisor.monitor());
            handles.push(supervisor.spawn(rx.clone()));
        }

        info!(
            database = %self.inner.options.database,
            feeds = handles.len(),
            "Engine started"
        );
        *running = Some(Running {
            shutdown,
            handles,
            monitors,
        });
    }

    /// Stop every supervisor and wait for them to exit.
    ///
    /// Returns their final status. The cache keeps serving reads afterwards,
    /// it just no longer receives change events.
    pub async fn shutdown(&self) -> Vec<FeedStatus> {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return Vec::new();
        };

        running.shutdown.send_replace(true);
        let mut statuses = Vec::with_capacity(running.handles.len());
        for (result, monitor) in join_all(running.handles)
            .await
            .into_iter()
            .zip(&running.monitors)
        {
            match result {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(collection = %monitor.collection(), error = %e, "Supervisor task failed");
                    statuses.push(monitor.status());
                }
            }
        }
        info!(feeds = statuses.len(), "Engine stopped");
        statuses
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn facade(&self) -> &ConfigFacade {
        &self.inner.facade
    }

    pub fn messages(&self) -> &MessageResolver {
        &self.inner.messages
    }

    pub fn cache(&self) -> &CoherentCache {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.inner.options
    }

    fn monitors(&self) -> Vec<FeedMonitor> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.monitors.clone())
            .unwrap_or_default()
    }

    /// Status of every running supervisor.
    pub fn feed_status(&self) -> Vec<FeedStatus> {
        self.monitors().iter().map(FeedMonitor::status).collect()
    }

    /// Health of the engine and each feed.
    ///
    /// The first entry is the engine as a whole: degraded while any feed is
    /// not streaming, unknown when nothing is running.
    pub fn health(&self) -> Vec<HealthCheck> {
        let feeds: Vec<HealthCheck> = self.monitors().iter().map(FeedMonitor::health).collect();
        let stats = self.inner.cache.stats();

        let overall = if !self.is_running() {
            HealthCheck::unknown("docsync")
        } else if feeds.iter().any(|f| f.status != HealthStatus::Healthy) {
            HealthCheck::degraded("docsync", "change feeds are reconnecting")
        } else {
            HealthCheck::healthy("docsync")
        };

        let overall = overall
            .with_metadata("cached_entries", serde_json::json!(stats.entry_count))
            .with_metadata("hit_rate", serde_json::json!(stats.hit_rate()));

        std::iter::once(overall).chain(feeds).collect()
    }
}
