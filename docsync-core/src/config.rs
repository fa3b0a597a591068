//! Configuration types

use crate::{ConfigError, SyncResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Well-known collection used when checkpoints live in the document database.
pub const DEFAULT_CHECKPOINT_COLLECTION: &str = "_docsync_checkpoints";

/// Coherent cache tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Upper bound on cached keys; least recently accessed entries are evicted.
    pub max_entries: usize,
    /// TTL ceiling. Entries older than this are served as stale and refreshed.
    pub entry_ttl: Duration,
    /// How long a confirmed-absent key is remembered.
    pub negative_ttl: Duration,
    /// Bound on a single-flight load before waiters see `StoreUnavailable`.
    pub load_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            entry_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(30),
            load_timeout: Duration::from_secs(10),
        }
    }
}

/// Change feed supervision tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the random delay added to each backoff step.
    pub jitter: Duration,
    /// Events processed between checkpoint saves.
    pub batch_size: usize,
    /// Idle time after which a partial batch is checkpointed.
    pub max_await: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(250),
            batch_size: 100,
            max_await: Duration::from_secs(1),
        }
    }
}

/// Master options struct handed to the engine builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub uri: String,
    pub database: String,
    /// Collections the supervisor keeps a change feed open for.
    pub watched_collections: Vec<String>,
    /// Locale used when a localized message document or path is missing.
    pub default_locale: String,
    pub checkpoint_collection: String,
    pub cache: CacheOptions,
    pub feed: FeedOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            uri: "memory://local".to_string(),
            database: "docsync".to_string(),
            watched_collections: Vec::new(),
            default_locale: "en".to_string(),
            checkpoint_collection: DEFAULT_CHECKPOINT_COLLECTION.to_string(),
            cache: CacheOptions::default(),
            feed: FeedOptions::default(),
        }
    }
}

impl SyncOptions {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Add a collection to keep coherent via the change feed.
    pub fn watch(mut self, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        if !self.watched_collections.contains(&collection) {
            self.watched_collections.push(collection);
        }
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_feed(mut self, feed: FeedOptions) -> Self {
        self.feed = feed;
        self
    }

    /// Create options from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `DOCSYNC_URI`, `DOCSYNC_DATABASE`, `DOCSYNC_DEFAULT_LOCALE`
    /// - `DOCSYNC_WATCHED_COLLECTIONS`: comma separated
    /// - `DOCSYNC_CACHE_MAX_ENTRIES`, `DOCSYNC_CACHE_TTL_SECS`,
    ///   `DOCSYNC_CACHE_NEGATIVE_TTL_SECS`, `DOCSYNC_CACHE_LOAD_TIMEOUT_MS`
    /// - `DOCSYNC_FEED_INITIAL_BACKOFF_MS`, `DOCSYNC_FEED_MAX_BACKOFF_MS`,
    ///   `DOCSYNC_FEED_BACKOFF_MULTIPLIER`, `DOCSYNC_FEED_JITTER_MS`,
    ///   `DOCSYNC_FEED_BATCH_SIZE`, `DOCSYNC_FEED_MAX_AWAIT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let watched_collections = std::env::var("DOCSYNC_WATCHED_COLLECTIONS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.watched_collections);

        Self {
            uri: std::env::var("DOCSYNC_URI").unwrap_or(defaults.uri),
            database: std::env::var("DOCSYNC_DATABASE").unwrap_or(defaults.database),
            watched_collections,
            default_locale: std::env::var("DOCSYNC_DEFAULT_LOCALE")
                .unwrap_or(defaults.default_locale),
            checkpoint_collection: defaults.checkpoint_collection,
            cache: CacheOptions {
                max_entries: env_parse("DOCSYNC_CACHE_MAX_ENTRIES")
                    .unwrap_or(defaults.cache.max_entries),
                entry_ttl: env_parse("DOCSYNC_CACHE_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cache.entry_ttl),
                negative_ttl: env_parse("DOCSYNC_CACHE_NEGATIVE_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cache.negative_ttl),
                load_timeout: env_parse("DOCSYNC_CACHE_LOAD_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.cache.load_timeout),
            },
            feed: FeedOptions {
                initial_backoff: env_parse("DOCSYNC_FEED_INITIAL_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.feed.initial_backoff),
                max_backoff: env_parse("DOCSYNC_FEED_MAX_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.feed.max_backoff),
                backoff_multiplier: env_parse("DOCSYNC_FEED_BACKOFF_MULTIPLIER")
                    .unwrap_or(defaults.feed.backoff_multiplier),
                jitter: env_parse("DOCSYNC_FEED_JITTER_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.feed.jitter),
                batch_size: env_parse("DOCSYNC_FEED_BATCH_SIZE")
                    .unwrap_or(defaults.feed.batch_size),
                max_await: env_parse("DOCSYNC_FEED_MAX_AWAIT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.feed.max_await),
            },
        }
    }

    /// Validate the options.
    ///
    /// Validates:
    /// - `database` and `default_locale` are non-empty
    /// - cache capacity and all durations are positive
    /// - `initial_backoff <= max_backoff` and `backoff_multiplier >= 1.0`
    /// - `batch_size > 0`
    /// - the checkpoint collection is not itself watched
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "database".to_string(),
            }
            .into());
        }

        if self.default_locale.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "default_locale".to_string(),
            }
            .into());
        }

        if self.cache.max_entries == 0 {
            return Err(invalid(
                "cache.max_entries",
                self.cache.max_entries,
                "max_entries must be greater than 0",
            ));
        }

        for (field, value) in [
            ("cache.entry_ttl", self.cache.entry_ttl),
            ("cache.negative_ttl", self.cache.negative_ttl),
            ("cache.load_timeout", self.cache.load_timeout),
            ("feed.initial_backoff", self.feed.initial_backoff),
            ("feed.max_backoff", self.feed.max_backoff),
            ("feed.max_await", self.feed.max_await),
        ] {
            if value.is_zero() {
                return Err(invalid(
                    field,
                    format!("{:?}", value),
                    "duration must be positive",
                ));
            }
        }

        if self.feed.initial_backoff > self.feed.max_backoff {
            return Err(invalid(
                "feed.initial_backoff",
                format!("{:?}", self.feed.initial_backoff),
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if !(self.feed.backoff_multiplier >= 1.0) {
            return Err(invalid(
                "feed.backoff_multiplier",
                self.feed.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if self
            .watched_collections
            .iter()
            .any(|c| *c == self.checkpoint_collection)
        {
            return Err(invalid(
                "watched_collections",
                &self.checkpoint_collection,
                "the checkpoint collection cannot be watched",
            ));
        }

        if self.feed.batch_size == 0 {
            return Err(invalid(
                "feed.batch_size",
                self.feed.batch_size,
                "batch_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::SyncError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;

    fn invalid_field(result: SyncResult<()>) -> Option<String> {
        match result {
            Err(SyncError::Config(ConfigError::InvalidValue { field, .. })) => Some(field),
            Err(SyncError::Config(ConfigError::MissingRequired { field })) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SyncOptions::default().validate().is_ok());
    }

    #[test]
    fn test_watch_deduplicates() {
        let options = SyncOptions::new("games").watch("cfg").watch("cfg").watch("messages");
        assert_eq!(options.watched_collections, vec!["cfg", "messages"]);
        assert_eq!(options.database, "games");
    }

    #[test]
    fn test_rejects_empty_database() {
        let options = SyncOptions::new("  ");
        assert_eq!(invalid_field(options.validate()), Some("database".to_string()));
    }

    #[test]
    fn test_rejects_watching_checkpoint_collection() {
        let options = SyncOptions::new("games").watch(DEFAULT_CHECKPOINT_COLLECTION);
        assert_eq!(
            invalid_field(options.validate()),
            Some("watched_collections".to_string())
        );
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut options = SyncOptions::default();
        options.cache.max_entries = 0;
        assert_eq!(
            invalid_field(options.validate()),
            Some("cache.max_entries".to_string())
        );
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let mut options = SyncOptions::default();
        options.feed.initial_backoff = Duration::from_secs(60);
        options.feed.max_backoff = Duration::from_secs(30);
        assert_eq!(
            invalid_field(options.validate()),
            Some("feed.initial_backoff".to_string())
        );
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let mut options = SyncOptions::default();
        options.feed.backoff_multiplier = 0.5;
        assert_eq!(
            invalid_field(options.validate()),
            Some("feed.backoff_multiplier".to_string())
        );

        options.feed.backoff_multiplier = f64::NAN;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_durations() {
        let mut options = SyncOptions::default();
        options.cache.load_timeout = Duration::ZERO;
        assert_eq!(
            invalid_field(options.validate()),
            Some("cache.load_timeout".to_string())
        );
    }
}
