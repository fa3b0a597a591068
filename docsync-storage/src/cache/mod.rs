//! Coherent document cache.
//!
//! This module provides the process-local cache that serves configuration reads
//! without touching the network, plus the bookkeeping that keeps it coherent
//! with writes made by this process and others.
//!
//! # Design Philosophy
//!
//! Reads never wait on the network when any value is cached: fresh entries are
//! returned as-is, stale entries are returned immediately while a background
//! refresh runs. Only a key with nothing cached pays a round trip, and
//! concurrent readers of such a key share a single load.
//!
//! Staleness is still explicit: every read returns a [`CacheRead`] saying which
//! state it was served from and whether a refresh was started.
//!
//! # Writers
//!
//! Exactly two components write entries: the change feed supervisor
//! (invalidations and pushed refreshes) and the config facade (optimistic
//! post-save updates). Both go through [`CoherentCache`]'s methods; neither
//! ever holds an entry across an await point.
//!
//! # Example
//!
//! ```ignore
//! let read = cache
//!     .read_through(&key, move || async move { store.get(&key).await })
//!     .await?;
//!
//! if let Some(read) = read {
//!     if read.is_revalidating() {
//!         tracing::debug!("served stale value while refreshing");
//!     }
//! }
//! ```

pub mod coherent;
pub mod pending;
pub mod read;
pub mod stats;

pub use coherent::{CacheEntry, CacheState, CoherentCache, EntrySnapshot};
pub use pending::{PendingWrite, PendingWrites};
pub use read::CacheRead;
pub use stats::CacheStats;
