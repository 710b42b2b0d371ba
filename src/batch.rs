// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outgoing batch assembly.
//!
//! Combines prefetched documents with deletion tombstones, applies the
//! destination's and the prefetcher's filters, and keeps advancing the
//! cursor when an entire batch was filtered out, so a destination behind a
//! wall of unsendable documents still makes progress.
//!
//! ```text
//! prefetcher ──► docs ─┐
//!                      ├─► merge (ascending etag) ─► filters ─► batch
//! tombstone list ──────┘         │
//!                                └─ all filtered? advance cursor, read again
//! ```
//!
//! Everything runs inside one storage read transaction; attachment payload
//! bytes are read at serialization time so the batch observes a single
//! consistent snapshot.

use crate::config::BatchingConfig;
use crate::document::{AttachmentInformation, ReplicatedDocument, METADATA_ETAG, METADATA_ID};
use crate::error::Result;
use crate::etag::Etag;
use crate::peer_client::SourceReplicationInformation;
use crate::prefetcher::Prefetcher;
use crate::destination::ReplicationStrategy;
use crate::storage::{DocumentStore, ATTACHMENT_TOMBSTONES_LIST, DOC_TOMBSTONES_LIST};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Result of one document batch build.
#[derive(Debug, Default)]
pub struct DocumentBatch {
    /// Cursor the peer acknowledged before this build.
    pub start_etag: Etag,
    /// Cursor after this build: the last pre-filter etag seen.
    pub last_etag: Etag,
    /// Last-modified of the newest pre-filter item carrying one.
    pub last_last_modified: Option<DateTime<Utc>>,
    /// Documents that survived all filters, ascending by etag.
    pub documents: Vec<ReplicatedDocument>,
    /// Everything the prefetcher loaded, for the auto-tuner.
    pub loaded_docs: Vec<ReplicatedDocument>,
    /// Pre-filter items that were system documents.
    pub system_doc_count: usize,
    /// Pre-filter items that originated from the destination itself.
    pub from_destination_count: usize,
}

impl DocumentBatch {
    /// True when the cursor moved past the peer's acknowledged position.
    pub fn advanced(&self) -> bool {
        self.last_etag > self.start_etag
    }

    /// Wire form of the surviving documents.
    pub fn wire_documents(&self) -> Vec<serde_json::Value> {
        self.documents.iter().map(ReplicatedDocument::to_wire).collect()
    }
}

/// Result of one attachment batch build.
#[derive(Debug, Default)]
pub struct AttachmentBatch {
    pub start_etag: Etag,
    pub last_etag: Etag,
    /// Descriptors that survived the filters, ascending by etag.
    pub attachments: Vec<AttachmentInformation>,
    /// Wire payload, one BSON document per surviving attachment, with
    /// bytes already read from the store.
    pub payload: Vec<bson::Document>,
}

impl AttachmentBatch {
    pub fn advanced(&self) -> bool {
        self.last_etag > self.start_etag
    }
}

/// Builds outgoing batches for one destination.
pub struct BatchAssembler {
    config: BatchingConfig,
}

impl BatchAssembler {
    pub fn new(config: BatchingConfig) -> Self {
        Self { config }
    }

    /// Build the next document batch after `info.last_document_etag`.
    ///
    /// Iterates until either nothing is left to read or at least one
    /// document survived the filters; either way `last_etag` reflects
    /// every pre-filter item consumed.
    pub fn build_documents(
        &self,
        store: &Arc<dyn DocumentStore>,
        prefetcher: &Arc<dyn Prefetcher>,
        strategy: &ReplicationStrategy,
        info: &SourceReplicationInformation,
    ) -> Result<DocumentBatch> {
        let start_etag = info.last_document_etag;
        let destination_id = info.server_instance_id.clone();
        let mut batch = DocumentBatch {
            start_etag,
            last_etag: start_etag,
            ..Default::default()
        };

        store.batch(&mut |accessor| {
            loop {
                let round_start = batch.last_etag;
                let mut docs = prefetcher.documents_after(round_start)?;
                let doc_last_etag = docs.last().map(|d| d.etag);

                let cap = self.config.doc_tombstone_floor.max(docs.len()) + 1;
                let tombstones =
                    accessor.read_list(DOC_TOMBSTONES_LIST, round_start, doc_last_etag, cap)?;

                // A capped tombstone read may have a gap above its last
                // entry; everything beyond that etag is deferred to the
                // next round so deletions cannot be skipped over.
                if tombstones.len() == cap {
                    let bound = tombstones[tombstones.len() - 1].etag;
                    docs.retain(|d| d.etag <= bound);
                }

                batch.loaded_docs.extend(docs.iter().cloned());

                let mut merged: Vec<ReplicatedDocument> = docs;
                merged.extend(
                    tombstones
                        .iter()
                        .map(|item| ReplicatedDocument::tombstone(&item.key, item.etag)),
                );
                merged.sort_by_key(|d| d.etag);

                if merged.is_empty() {
                    break;
                }

                for doc in &merged {
                    if strategy.is_system_document_id(&doc.key) {
                        batch.system_doc_count += 1;
                    }
                    if strategy.origins_from_destination(&destination_id, &doc.metadata) {
                        batch.from_destination_count += 1;
                    }
                }

                let newest = &merged[merged.len() - 1];
                batch.last_etag = newest.etag;
                if let Some(modified) = merged.iter().rev().find_map(|d| d.last_modified) {
                    batch.last_last_modified = Some(modified);
                }

                let survivors: Vec<ReplicatedDocument> = merged
                    .into_iter()
                    .filter(|doc| {
                        // Touch-induced etag bumps must not propagate
                        if let Some(touched) = store.recent_touch_etag(&doc.key) {
                            if touched > round_start {
                                return false;
                            }
                        }
                        strategy.filter_documents(&destination_id, &doc.key, &doc.metadata)
                            && prefetcher.filter_document(doc)
                    })
                    .collect();

                if !survivors.is_empty() {
                    batch.documents = survivors;
                    break;
                }
                debug!(
                    destination = %strategy.url(),
                    cursor = %batch.last_etag,
                    "Entire batch filtered out, reading past it"
                );
            }
            Ok(())
        })?;

        Ok(batch)
    }

    /// Build the next attachment batch after `info.last_attachment_etag`.
    pub fn build_attachments(
        &self,
        store: &Arc<dyn DocumentStore>,
        strategy: &ReplicationStrategy,
        info: &SourceReplicationInformation,
    ) -> Result<AttachmentBatch> {
        let start_etag = info.last_attachment_etag;
        let destination_id = info.server_instance_id.clone();
        let mut batch = AttachmentBatch {
            start_etag,
            last_etag: start_etag,
            ..Default::default()
        };

        store.batch(&mut |accessor| {
            loop {
                let round_start = batch.last_etag;
                let mut attachments = accessor.attachments_after(
                    round_start,
                    self.config.attachment_batch_items,
                    self.config.attachment_batch_bytes,
                )?;
                let last_etag = attachments.last().map(|a| a.etag);

                let cap = self.config.attachment_tombstone_floor.max(attachments.len()) + 1;
                let tombstones =
                    accessor.read_list(ATTACHMENT_TOMBSTONES_LIST, round_start, last_etag, cap)?;

                if tombstones.len() == cap {
                    let bound = tombstones[tombstones.len() - 1].etag;
                    attachments.retain(|a| a.etag <= bound);
                }

                let mut merged = attachments;
                merged.extend(
                    tombstones
                        .iter()
                        .map(|item| AttachmentInformation::tombstone(&item.key, item.etag)),
                );
                merged.sort_by_key(|a| a.etag);

                if merged.is_empty() {
                    break;
                }

                batch.last_etag = merged[merged.len() - 1].etag;

                let survivors: Vec<AttachmentInformation> = merged
                    .into_iter()
                    .filter(|a| strategy.filter_attachments(a, &destination_id))
                    .collect();

                if survivors.is_empty() {
                    debug!(
                        destination = %strategy.url(),
                        cursor = %batch.last_etag,
                        "Entire attachment batch filtered out, reading past it"
                    );
                    continue;
                }

                // Payload bytes are read here, inside the transaction, so
                // zero-size attachments carry an empty byte array.
                for attachment in &survivors {
                    let data = if attachment.is_tombstone() {
                        Vec::new()
                    } else {
                        accessor.attachment_data(&attachment.key)?.unwrap_or_default()
                    };
                    batch.payload.push(attachment_wire_doc(attachment, data)?);
                }
                batch.attachments = survivors;
                break;
            }
            Ok(())
        })?;

        Ok(batch)
    }
}

fn attachment_wire_doc(
    attachment: &AttachmentInformation,
    data: Vec<u8>,
) -> Result<bson::Document> {
    let metadata = bson::to_bson(&attachment.metadata)
        .map_err(|e| crate::error::ReplicationError::BatchBuild(format!(
            "attachment metadata for {} is not BSON-encodable: {}",
            attachment.key, e
        )))?;
    let mut doc = bson::Document::new();
    doc.insert("@metadata", metadata);
    doc.insert(METADATA_ID, attachment.key.clone());
    doc.insert(
        METADATA_ETAG,
        bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: attachment.etag.as_bytes().to_vec(),
        },
    );
    doc.insert(
        "data",
        bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: data,
        },
    );
    Ok(doc)
}
