//! In-flight save tracking.
//!
//! A [`PendingWrite`] exists for a key from the moment a save starts until its
//! store write resolves. While it exists:
//!
//! - other saves to the same key wait their turn (saves are serialized per key)
//! - change events for the key are acknowledged without refreshing the cache,
//!   since the writer already holds the newest value
//! - background loads for the key do not overwrite the optimistic value
//!
//! Suppressed events are not forgotten: the highest version seen is compared
//! with the version the save produced, so a concurrent external write that
//! landed after ours still invalidates the entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use docsync_core::{DocumentKey, Version};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct PendingSlot {
    gate: Arc<Mutex<()>>,
    in_flight: AtomicBool,
    observed: AtomicU64,
}

/// Registry of keys with a save in flight.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    slots: Arc<DashMap<DocumentKey, Arc<PendingSlot>>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a save for `key`, waiting for any earlier save of the same key
    /// to finish first.
    pub async fn begin(&self, key: &DocumentKey) -> PendingWrite {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let permit = Arc::clone(&slot.gate).lock_owned().await;
        slot.observed.store(0, Ordering::SeqCst);
        slot.in_flight.store(true, Ordering::SeqCst);
        PendingWrite {
            key: key.clone(),
            slot,
            slots: Arc::clone(&self.slots),
            _permit: permit,
        }
    }

    pub fn is_pending(&self, key: &DocumentKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.in_flight.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Offer a change event for `key`.
    ///
    /// Returns `true` when a save is in flight, in which case the event should
    /// be acknowledged without touching the cache; its version is remembered.
    pub fn observe(&self, key: &DocumentKey, version: Option<Version>) -> bool {
        match self.slots.get(key) {
            Some(slot) if slot.in_flight.load(Ordering::SeqCst) => {
                if let Some(version) = version {
                    slot.observed.fetch_max(version, Ordering::SeqCst);
                }
                true
            }
            _ => false,
        }
    }

    /// Number of keys with a save in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_flight.load(Ordering::SeqCst))
            .count()
    }
}

/// Token for one in-flight save. Dropping it ends the pending window.
#[derive(Debug)]
pub struct PendingWrite {
    key: DocumentKey,
    slot: Arc<PendingSlot>,
    slots: Arc<DashMap<DocumentKey, Arc<PendingSlot>>>,
    _permit: OwnedMutexGuard<()>,
}

impl PendingWrite {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// End the pending window after a successful write of `written`.
    ///
    /// Returns `true` if the change feed reported a newer version than
    /// `written` while the save was in flight.
    pub fn finish(self, written: Version) -> bool {
        self.slot.observed.load(Ordering::SeqCst) > written
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.slot.in_flight.store(false, Ordering::SeqCst);
        // Only the registry and this token hold the slot: nobody is queued.
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_observe_only_while_pending() {
        let pending = PendingWrites::new();
        let key = DocumentKey::new("cfg", "server-1");

        assert!(!pending.observe(&key, Some(1)));

        let write = pending.begin(&key).await;
        assert!(pending.is_pending(&key));
        assert!(pending.observe(&key, Some(5)));
        assert_eq!(pending.in_flight(), 1);

        assert!(!write.finish(5));
        assert!(!pending.is_pending(&key));
        assert!(!pending.observe(&key, Some(6)));
    }

    #[tokio::test]
    async fn test_finish_reports_newer_external_version() {
        let pending = PendingWrites::new();
        let key = DocumentKey::new("cfg", "server-1");

        let write = pending.begin(&key).await;
        pending.observe(&key, Some(9));
        assert!(write.finish(7));
    }

    #[tokio::test]
    async fn test_saves_to_same_key_are_serialized() {
        let pending = PendingWrites::new();
        let key = DocumentKey::new("cfg", "server-1");

        let first = pending.begin(&key).await;

        let second = {
            let pending = pending.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let write = pending.begin(&key).await;
                write.finish(2)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(first);
        assert!(!second.await.unwrap());
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_block() {
        let pending = PendingWrites::new();
        let _a = pending.begin(&DocumentKey::new("cfg", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            pending.begin(&DocumentKey::new("cfg", "b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(pending.in_flight(), 2);
    }
}
