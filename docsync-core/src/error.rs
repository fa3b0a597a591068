//! Error types for DOCSYNC operations

use crate::DocumentKey;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Document store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transient failure; the call may be retried.
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Permanent failure for this call (validation, permissions).
    #[error("Store rejected request: {reason}")]
    Rejected { reason: String },

    /// The change feed can no longer resume from the supplied token.
    #[error("Change feed for {collection} expired")]
    FeedExpired { collection: String },

    #[error("Store operation timed out after {after:?}")]
    Timeout { after: Duration },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => ErrorKind::Unavailable,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::FeedExpired { .. } => ErrorKind::FeedExpired,
        }
    }
}

/// Typed value <-> document conversion errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{type_name} does not encode to a document object")]
    NotAnObject { type_name: &'static str },

    #[error("Failed to encode {type_name}: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },

    #[error("Failed to decode {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Resume checkpoint persistence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Failed to open checkpoint store: {0}")]
    Open(String),

    #[error("Failed to read checkpoint for {collection}: {reason}")]
    Read { collection: String, reason: String },

    #[error("Failed to write checkpoint for {collection}: {reason}")]
    Write { collection: String, reason: String },

    #[error("Checkpoint encoding error: {0}")]
    Encode(String),
}

/// Facade operation that produced an error, for caller-side logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    GetOrGenerate,
    Save,
    Delete,
    Reload,
    Preload,
    Resolve,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::GetOrGenerate => "get_or_generate",
            Self::Save => "save",
            Self::Delete => "delete",
            Self::Reload => "reload",
            Self::Preload => "preload",
            Self::Resolve => "resolve",
        };
        f.write_str(name)
    }
}

/// Coarse classification hosts use to pick a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    Rejected,
    FeedExpired,
    Codec,
    Config,
    Checkpoint,
}

/// Master error type for all DOCSYNC errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("{operation} failed for {key}: {source}")]
    Operation {
        operation: Operation,
        key: DocumentKey,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Attach the failing operation and key. Already-contextualized errors are
    /// returned unchanged so the innermost key wins.
    pub fn context(self, operation: Operation, key: &DocumentKey) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                operation,
                key: key.clone(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Codec(_) => ErrorKind::Codec,
            Self::Config(_) => ErrorKind::Config,
            Self::Checkpoint(_) => ErrorKind::Checkpoint,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// Key the failing operation targeted, when known.
    pub fn key(&self) -> Option<&DocumentKey> {
        match self {
            Self::Operation { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

/// Result type alias for DOCSYNC operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_unavailable() {
        let err = StoreError::unavailable("connection reset");
        let msg = format!("{}", err);
        assert!(msg.contains("Store unavailable"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_store_error_kinds() {
        assert_eq!(StoreError::unavailable("x").kind(), ErrorKind::Unavailable);
        assert_eq!(
            StoreError::Timeout {
                after: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(StoreError::rejected("x").kind(), ErrorKind::Rejected);
        assert_eq!(
            StoreError::FeedExpired {
                collection: "cfg".to_string()
            }
            .kind(),
            ErrorKind::FeedExpired
        );
    }

    #[test]
    fn test_context_carries_key_and_kind() {
        let key = DocumentKey::new("cfg", "server-1");
        let err = SyncError::from(StoreError::rejected("bad document")).context(Operation::Save, &key);

        assert_eq!(err.key(), Some(&key));
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(!err.is_retryable());

        let msg = format!("{}", err);
        assert!(msg.contains("save failed for cfg/server-1"));
        assert!(msg.contains("bad document"));
    }

    #[test]
    fn test_context_is_not_nested_twice() {
        let inner = DocumentKey::new("cfg", "a");
        let outer = DocumentKey::new("cfg", "b");
        let err = SyncError::from(StoreError::unavailable("down"))
            .context(Operation::Get, &inner)
            .context(Operation::Resolve, &outer);

        assert_eq!(err.key(), Some(&inner));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sync_error_from_variants() {
        let store = SyncError::from(StoreError::unavailable("x"));
        assert!(matches!(store, SyncError::Store(_)));

        let codec = SyncError::from(CodecError::NotAnObject { type_name: "u32" });
        assert!(matches!(codec, SyncError::Codec(_)));
        assert_eq!(codec.kind(), ErrorKind::Codec);

        let config = SyncError::from(ConfigError::MissingRequired {
            field: "database".to_string(),
        });
        assert!(matches!(config, SyncError::Config(_)));

        let checkpoint = SyncError::from(CheckpointError::Open("denied".to_string()));
        assert_eq!(checkpoint.kind(), ErrorKind::Checkpoint);
    }
}
