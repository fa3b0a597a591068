//! Supervisor state and metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use docsync_core::{HealthCheck, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state of one supervised feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for one supervised feed.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    /// Sessions ended by an error or expiry and reopened.
    pub reconnects: AtomicU64,
    /// Events applied to the cache.
    pub events_applied: AtomicU64,
    /// Events acknowledged without touching the cache because a local save
    /// for the key was in flight.
    pub self_writes_suppressed: AtomicU64,
    /// Full reconciles after an expired resume token.
    pub reconciles: AtomicU64,
    /// Collection-wide invalidations received.
    pub invalidations: AtomicU64,
    pub checkpoints_saved: AtomicU64,
    pub checkpoint_failures: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a supervised feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedStatus {
    pub collection: String,
    pub state: FeedState,
    pub reconnects: u64,
    pub events_applied: u64,
    pub self_writes_suppressed: u64,
    pub reconciles: u64,
    pub invalidations: u64,
    pub checkpoints_saved: u64,
    pub checkpoint_failures: u64,
    pub last_error: Option<String>,
    pub last_checkpoint_at: Option<Timestamp>,
}

// ============================================================================
// MONITOR
// ============================================================================

#[derive(Debug, Default)]
struct Notes {
    last_error: Option<String>,
    last_checkpoint_at: Option<Timestamp>,
}

/// Shared handle for observing a supervisor from outside its task.
#[derive(Debug, Clone)]
pub struct FeedMonitor {
    collection: Arc<str>,
    state: Arc<watch::Sender<FeedState>>,
    metrics: Arc<FeedMetrics>,
    notes: Arc<Mutex<Notes>>,
}

impl FeedMonitor {
    pub fn new(collection: &str) -> Self {
        let (state, _) = watch::channel(FeedState::Disconnected);
        Self {
            collection: Arc::from(collection),
            state: Arc::new(state),
            metrics: Arc::new(FeedMetrics::new()),
            notes: Arc::new(Mutex::new(Notes::default())),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }

    pub(crate) fn set_state(&self, state: FeedState) {
        self.state.send_replace(state);
    }

    pub(crate) fn record_error(&self, error: impl Into<String>) {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(error.into());
    }

    pub(crate) fn record_checkpoint(&self) {
        FeedMetrics::bump(&self.metrics.checkpoints_saved);
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_checkpoint_at = Some(Utc::now());
    }

    pub fn status(&self) -> FeedStatus {
        let notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        let m = &self.metrics;
        FeedStatus {
            collection: self.collection.to_string(),
            state: self.state(),
            reconnects: m.reconnects.load(Ordering::Relaxed),
            events_applied: m.events_applied.load(Ordering::Relaxed),
            self_writes_suppressed: m.self_writes_suppressed.load(Ordering::Relaxed),
            reconciles: m.reconciles.load(Ordering::Relaxed),
            invalidations: m.invalidations.load(Ordering::Relaxed),
            checkpoints_saved: m.checkpoints_saved.load(Ordering::Relaxed),
            checkpoint_failures: m.checkpoint_failures.load(Ordering::Relaxed),
            last_error: notes.last_error.clone(),
            last_checkpoint_at: notes.last_checkpoint_at,
        }
    }

    /// Healthy while streaming, degraded while (re)connecting.
    pub fn health(&self) -> HealthCheck {
        let status = self.status();
        let component = format!("feed:{}", status.collection);
        let check = match status.state {
            FeedState::Streaming => HealthCheck::healthy(component),
            FeedState::Connecting | FeedState::Reconnecting => HealthCheck::degraded(
                component,
                status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "connecting to change feed".to_string()),
            ),
            FeedState::Disconnected => HealthCheck::unknown(component),
        };
        check
            .with_metadata("state", serde_json::json!(status.state))
            .with_metadata("reconnects", serde_json::json!(status.reconnects))
            .with_metadata("events_applied", serde_json::json!(status.events_applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::HealthStatus;

    #[test]
    fn test_health_follows_state() {
        let monitor = FeedMonitor::new("cfg");
        assert_eq!(monitor.health().status, HealthStatus::Unknown);

        monitor.set_state(FeedState::Streaming);
        assert!(monitor.health().is_healthy());

        monitor.record_error("connection reset");
        monitor.set_state(FeedState::Reconnecting);
        let health = monitor.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.message.as_deref(), Some("connection reset"));
        assert_eq!(health.component, "feed:cfg");
    }

    #[test]
    fn test_status_snapshot() {
        let monitor = FeedMonitor::new("cfg");
        FeedMetrics::bump(&monitor.metrics().events_applied);
        FeedMetrics::bump(&monitor.metrics().events_applied);
        monitor.record_checkpoint();

        let status = monitor.status();
        assert_eq!(status.events_applied, 2);
        assert_eq!(status.checkpoints_saved, 1);
        assert!(status.last_checkpoint_at.is_some());
        assert_eq!(status.state, FeedState::Disconnected);
    }
}
