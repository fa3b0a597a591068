//! DOCSYNC - Coherent Document Configuration
//!
//! Process-local, change-feed driven cache for configuration and message
//! documents kept in a shared document database.
//!
//! ```ignore
//! let engine = Engine::builder(SyncOptions::new("games").watch("cfg"))
//!     .store(Arc::new(store))
//!     .build()?;
//! engine.start();
//!
//! let key = DocumentKey::new("cfg", "server-1");
//! let settings: ServerSettings = engine
//!     .facade()
//!     .get_or_generate_typed(&key, ServerSettings::default)
//!     .await?;
//! ```

pub mod codec;
pub mod engine;
pub mod facade;
pub mod messages;

pub use codec::{DocumentCodec, SerdeCodec};
pub use engine::{Engine, EngineBuilder};
pub use facade::ConfigFacade;
pub use messages::{substitute, MessageResolver, Placeholders};

pub use docsync_core::{
    CacheOptions, Document, DocumentKey, ErrorKind, FeedOptions, HealthCheck, HealthStatus,
    Operation, SyncError, SyncOptions, SyncResult, Version, VersionedDocument,
};
pub use docsync_feed::{FeedState, FeedStatus};
pub use docsync_storage::{
    CacheRead, CacheState, CacheStats, DocumentStore, InMemoryDocumentStore, ResumeTokenStore,
};
