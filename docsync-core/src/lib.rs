//! DOCSYNC Core - Document Types
//!
//! Pure data structures shared by every DOCSYNC crate: document keys and
//! payloads, change events, resume checkpoints, the error taxonomy and the
//! options struct. This crate contains no I/O.

pub mod config;
pub mod error;
pub mod health;

pub use config::{CacheOptions, FeedOptions, SyncOptions};
pub use error::{
    CheckpointError, CodecError, ConfigError, ErrorKind, Operation, StoreError, SyncError,
    SyncResult,
};
pub use health::{HealthCheck, HealthStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Monotonically increasing document version assigned by the store on write.
pub type Version = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identity of a document within the configured database.
///
/// The database name is carried by [`SyncOptions`]; a single process talks to
/// one logical database, so keys only need the collection and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Key of the same document in a sibling locale, e.g. `messages_de`.
    pub fn localized(&self, locale: &str) -> Self {
        Self {
            collection: self.collection.clone(),
            id: format!("{}_{}", self.id, locale),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

// ============================================================================
// DOCUMENT PAYLOAD
// ============================================================================

/// A nested key/value tree.
///
/// The core never enforces a schema; typed views are produced by a codec in the
/// facade crate. Only JSON objects are valid documents at the top level.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Walk a dotted path (`"lobby.welcome.title"`) into the tree.
    ///
    /// Segments address object fields; a numeric segment indexes into a list.
    /// Empty paths and empty segments never match.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return None;
        }
        let mut segments = path.split('.');
        let first = segments.next().filter(|s| !s.is_empty())?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            if segment.is_empty() {
                return None;
            }
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A document together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    pub document: Document,
    pub version: Version,
}

impl VersionedDocument {
    pub fn new(document: Document, version: Version) -> Self {
        Self { document, version }
    }
}

// ============================================================================
// CHANGE FEED TYPES
// ============================================================================

/// Opaque change-feed position.
///
/// Only the store that issued a token can interpret it; everything else just
/// persists and hands it back.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({})", hex::encode(&self.0))
    }
}

/// Kind of mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    /// The feed itself is no longer valid (collection dropped or renamed).
    Invalidate,
}

impl OperationType {
    /// Whether the operation leaves a document behind.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }
}

/// One mutation observed on a watched collection.
///
/// Events for the same `(collection, id)` arrive in mutation order. For
/// [`OperationType::Invalidate`] the `id` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
    pub operation: OperationType,
    pub full_document: Option<Document>,
    pub version: Option<Version>,
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.collection.clone(), self.id.clone())
    }
}

/// Last processed feed position for one watched collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    pub collection: String,
    pub token: ResumeToken,
    pub saved_at: Timestamp,
}

impl ResumeCheckpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(collection: impl Into<String>, token: ResumeToken) -> Self {
        Self {
            collection: collection.into(),
            token,
            saved_at: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        Document::from_value(json!({
            "maxPlayers": 100,
            "lobby": {
                "welcome": { "title": "Hello {player}" },
                "lines": ["first", "second"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_document_key_display() {
        let key = DocumentKey::new("cfg", "server-1");
        assert_eq!(key.to_string(), "cfg/server-1");
    }

    #[test]
    fn test_document_key_localized() {
        let key = DocumentKey::new("messages", "lobby");
        assert_eq!(key.localized("de"), DocumentKey::new("messages", "lobby_de"));
    }

    #[test]
    fn test_document_from_non_object_is_rejected() {
        assert!(Document::from_value(json!([1, 2])).is_none());
        assert!(Document::from_value(json!("text")).is_none());
        assert!(Document::from_value(json!({})).is_some());
    }

    #[test]
    fn test_get_path_nested_object() {
        let doc = sample();
        assert_eq!(
            doc.get_path("lobby.welcome.title"),
            Some(&json!("Hello {player}"))
        );
        assert_eq!(doc.get_path("maxPlayers"), Some(&json!(100)));
    }

    #[test]
    fn test_get_path_list_index() {
        let doc = sample();
        assert_eq!(doc.get_path("lobby.lines.1"), Some(&json!("second")));
        assert_eq!(doc.get_path("lobby.lines.7"), None);
        assert_eq!(doc.get_path("lobby.lines.x"), None);
    }

    #[test]
    fn test_get_path_rejects_malformed() {
        let doc = sample();
        assert_eq!(doc.get_path(""), None);
        assert_eq!(doc.get_path("lobby..welcome"), None);
        assert_eq!(doc.get_path(".lobby"), None);
        assert_eq!(doc.get_path("maxPlayers.inner"), None);
    }

    #[test]
    fn test_document_serializes_transparently() {
        let doc = Document::new().with("a", 1);
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn test_resume_token_debug_is_hex() {
        let token = ResumeToken::from_bytes(vec![0xde, 0xad]);
        assert_eq!(format!("{:?}", token), "ResumeToken(dead)");
    }

    #[test]
    fn test_operation_type_is_write() {
        assert!(OperationType::Insert.is_write());
        assert!(OperationType::Replace.is_write());
        assert!(!OperationType::Delete.is_write());
        assert!(!OperationType::Invalidate.is_write());
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
