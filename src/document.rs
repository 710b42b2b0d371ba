//! Document and attachment shapes that travel to peers.
//!
//! Documents carry their metadata as a JSON object; deletions travel as
//! tombstones, which are documents with an empty body and a delete marker
//! in the metadata. Attachment bodies are not held here - only the
//! [`AttachmentInformation`] descriptor; bytes are fetched lazily by key
//! at serialization time.

use crate::etag::Etag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Metadata key carrying the document id on the wire.
pub const METADATA_ID: &str = "@id";
/// Metadata key carrying the document etag on the wire.
pub const METADATA_ETAG: &str = "@etag";
/// Metadata marker present on tombstones.
pub const METADATA_DELETE_MARKER: &str = "Raven-Delete-Marker";
/// Metadata key naming the database a document was first written on.
pub const METADATA_REPLICATION_SOURCE: &str = "Raven-Replication-Source";
/// Metadata marker present on conflict artifacts, which never travel.
pub const METADATA_REPLICATION_CONFLICT: &str = "Raven-Replication-Conflict";

/// Prefix identifying system documents, which are filtered from
/// replication by default.
pub const SYSTEM_DOCUMENT_PREFIX: &str = "Raven/";

/// A document as pulled from the prefetcher or synthesized from a
/// tombstone, ready to be placed into an outgoing batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    /// Document key.
    pub key: String,
    /// Version token assigned by the store.
    pub etag: Etag,
    /// Metadata object (`@id`, markers, replication source).
    pub metadata: Value,
    /// Document body. Empty object for tombstones.
    pub data: Value,
    /// Wall-clock time of the last modification, when the store knows it.
    pub last_modified: Option<DateTime<Utc>>,
}

impl ReplicatedDocument {
    /// Build a tombstone document from a deletion list entry.
    pub fn tombstone(key: &str, etag: Etag) -> Self {
        Self {
            key: key.to_string(),
            etag,
            metadata: json!({ METADATA_DELETE_MARKER: true }),
            data: json!({}),
            last_modified: None,
        }
    }

    /// True when the metadata carries the delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.metadata
            .get(METADATA_DELETE_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The replication source recorded in the metadata, if any.
    pub fn replication_source(&self) -> Option<&str> {
        self.metadata.get(METADATA_REPLICATION_SOURCE).and_then(Value::as_str)
    }

    /// Render the wire form: the document body with metadata attached and
    /// `@id` guaranteed present.
    pub fn to_wire(&self) -> Value {
        let mut metadata = match &self.metadata {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        metadata.insert(METADATA_ID.to_string(), Value::String(self.key.clone()));
        metadata.insert(METADATA_ETAG.to_string(), Value::String(self.etag.to_string()));

        let mut body = match &self.data {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                if !other.is_null() {
                    map.insert("Value".to_string(), other.clone());
                }
                map
            }
        };
        body.insert("@metadata".to_string(), Value::Object(metadata));
        Value::Object(body)
    }
}

/// Descriptor for an attachment awaiting replication. The payload bytes
/// are read from the store inside the send transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInformation {
    /// Attachment key.
    pub key: String,
    /// Version token assigned by the store.
    pub etag: Etag,
    /// Attachment metadata object.
    pub metadata: Value,
    /// Payload size in bytes, as recorded by the store.
    pub size: u64,
}

impl AttachmentInformation {
    /// Build a tombstone descriptor from a deletion list entry.
    pub fn tombstone(key: &str, etag: Etag) -> Self {
        Self {
            key: key.to_string(),
            etag,
            metadata: json!({ METADATA_DELETE_MARKER: true }),
            size: 0,
        }
    }

    /// True when the metadata carries the delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.metadata
            .get(METADATA_DELETE_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The replication source recorded in the metadata, if any.
    pub fn replication_source(&self) -> Option<&str> {
        self.metadata.get(METADATA_REPLICATION_SOURCE).and_then(Value::as_str)
    }
}

/// True for keys in the system namespace.
pub fn is_system_document_id(key: &str) -> bool {
    key.get(..SYSTEM_DOCUMENT_PREFIX.len())
        .map(|head| head.eq_ignore_ascii_case(SYSTEM_DOCUMENT_PREFIX))
        .unwrap_or(false)
}
