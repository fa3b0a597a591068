//! DOCSYNC Storage - Store Client, Checkpoints and Coherent Cache
//!
//! Defines the document store abstraction, resume checkpoint persistence and
//! the process-local coherent cache that sits in front of them.

pub mod cache;
pub mod checkpoint;
pub mod store;

pub use cache::{
    CacheEntry, CacheRead, CacheState, CacheStats, CoherentCache, EntrySnapshot, PendingWrite,
    PendingWrites,
};
pub use checkpoint::{
    DocumentResumeTokenStore, InMemoryResumeTokenStore, LmdbResumeTokenStore, ResumeTokenStore,
};
pub use store::{
    ChangeStream, DocumentStore, InMemoryDocumentStore, InsertOutcome, StoreResult,
    StoreStatsSnapshot,
};
