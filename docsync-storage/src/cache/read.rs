//! Staleness metadata for cache reads.

use std::time::Duration;

use docsync_core::Version;

use super::coherent::CacheState;

/// A value served by the coherent cache, with how it was served.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    /// The cached value.
    value: T,
    /// Store version of the value, if known.
    version: Option<Version>,
    /// State the entry was in when served.
    state: CacheState,
    /// Time since the value was last confirmed against the store.
    age: Duration,
    /// Whether this was a cache hit or a load.
    was_cache_hit: bool,
    /// Whether a background refresh is running for this key.
    revalidating: bool,
}

impl<T> CacheRead<T> {
    /// Create a cache read served from a cached entry.
    pub fn from_cache(
        value: T,
        version: Option<Version>,
        state: CacheState,
        age: Duration,
        revalidating: bool,
    ) -> Self {
        Self {
            value,
            version,
            state,
            age,
            was_cache_hit: true,
            revalidating,
        }
    }

    /// Create a cache read for a value that was just loaded from the store.
    pub fn from_store(value: T, version: Option<Version>) -> Self {
        Self {
            value,
            version,
            state: CacheState::Fresh,
            age: Duration::ZERO,
            was_cache_hit: false,
            revalidating: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// State of the entry when it was served (`Fresh` or `Stale`).
    pub fn state(&self) -> CacheState {
        self.state
    }

    /// How long ago the value was last confirmed against the store.
    pub fn staleness(&self) -> Duration {
        self.age
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// True when the value was stale and a refresh is in flight.
    pub fn is_revalidating(&self) -> bool {
        self.revalidating
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            version: self.version,
            state: self.state,
            age: self.age,
            was_cache_hit: self.was_cache_hit,
            revalidating: self.revalidating,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_hit_reports_revalidation() {
        let read = CacheRead::from_cache(
            "motd",
            Some(3),
            CacheState::Stale,
            Duration::from_secs(5),
            true,
        );

        assert!(read.was_cache_hit() && read.is_revalidating());
        assert_eq!(
            (read.state(), read.version(), read.staleness()),
            (CacheState::Stale, Some(3), Duration::from_secs(5))
        );
    }

    #[test]
    fn test_loaded_value_is_fresh_and_mappable() {
        let read = CacheRead::from_store(100u32, Some(7)).map(|players| players * 2);

        assert!(!read.was_cache_hit());
        assert!(!read.is_revalidating());
        assert_eq!(read.state(), CacheState::Fresh);
        assert_eq!(read.version(), Some(7));
        assert_eq!(*read.as_ref(), 200);
    }
}
