// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store integration traits.
//!
//! The agent consumes the document/attachment store through this narrow
//! surface; it never owns storage. Batch operations run synchronously
//! inside one storage transaction - the only true suspension point in the
//! agent is the HTTP client.
//!
//! The host provides an implementation; tests use a recording mock.

use crate::document::AttachmentInformation;
use crate::error::Result;
use crate::etag::Etag;
use serde_json::Value;

/// Key of the replication destinations configuration document.
pub const DESTINATIONS_DOC: &str = "Raven/Replication/Destinations";
/// Key prefix under which per-destination failure documents are stored.
pub const DESTINATION_FAILURE_PREFIX: &str = "Raven/Replication/Destinations/";
/// Key prefix under which remote sources register themselves.
pub const SOURCES_PREFIX: &str = "Raven/Replication/Sources/";
/// Name of the document tombstone list.
pub const DOC_TOMBSTONES_LIST: &str = "Raven/Replication/Docs/Tombstones";
/// Name of the attachment tombstone list.
pub const ATTACHMENT_TOMBSTONES_LIST: &str = "Raven/Replication/Attachments/Tombstones";

/// A document as stored locally.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub key: String,
    pub etag: Etag,
    pub metadata: Value,
    pub data: Value,
}

/// An entry read from a named list (tombstones).
#[derive(Debug, Clone)]
pub struct ListItem {
    pub key: String,
    pub etag: Etag,
}

/// What we need from the local document store.
///
/// Synchronous by contract: implementations back onto an embedded engine
/// and complete without awaiting.
pub trait DocumentStore: Send + Sync + 'static {
    /// Read a document by key.
    fn get(&self, key: &str) -> Result<Option<StoredDocument>>;

    /// Write a document. When `expected_etag` is set the write is
    /// conditional; a concurrency miss is reported as a storage error.
    fn put(&self, key: &str, expected_etag: Option<Etag>, data: Value, metadata: Value)
        -> Result<Etag>;

    /// Delete a document. Returns whether anything was removed.
    fn delete(&self, key: &str, expected_etag: Option<Etag>) -> Result<bool>;

    /// Page through documents whose key starts with `prefix`.
    fn documents_with_id_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<StoredDocument>>;

    /// Run `action` inside one storage read transaction.
    fn batch(&self, action: &mut dyn FnMut(&dyn StorageAccessor) -> Result<()>) -> Result<()>;

    /// The etag a recent touch (metadata-only update) assigned to `key`,
    /// if the store tracked one.
    fn recent_touch_etag(&self, key: &str) -> Option<Etag>;
}

/// Read surface available inside a storage transaction.
pub trait StorageAccessor {
    /// The highest document etag currently in the store.
    fn most_recent_document_etag(&self) -> Etag;

    /// Attachments with etag strictly greater than `after`, up to `take`
    /// items or `size_limit` accumulated payload bytes.
    fn attachments_after(
        &self,
        after: Etag,
        take: usize,
        size_limit: u64,
    ) -> Result<Vec<AttachmentInformation>>;

    /// Read one attachment's payload bytes.
    fn attachment_data(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read entries from a named list with etag strictly greater than
    /// `from`, optionally bounded above (inclusive) by `to`, up to `take`
    /// entries.
    fn read_list(&self, name: &str, from: Etag, to: Option<Etag>, take: usize)
        -> Result<Vec<ListItem>>;
}
