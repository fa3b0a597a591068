//! DOCSYNC Feed - Change Feed Supervision
//!
//! One long-lived supervisor per watched collection consumes the store's change
//! feed and applies it to the coherent cache, persisting resume checkpoints as
//! it goes. Supervisors reconnect forever with jittered exponential backoff
//! and report degradation through [`FeedStatus`] instead of failing.

pub mod backoff;
pub mod status;
pub mod supervisor;

pub use backoff::Backoff;
pub use status::{FeedMetrics, FeedMonitor, FeedState, FeedStatus};
pub use supervisor::ChangeFeedSupervisor;
