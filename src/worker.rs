// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-destination replication worker.
//!
//! One worker runs per destination per tick, under the controller's
//! single-flight token, and walks a three-phase state machine:
//!
//! 1. **Negotiate** - ask the peer for the cursors it last acknowledged.
//! 2. **Documents** - assemble and ship the next document batch, or bump
//!    the peer's cursor when everything was filtered out locally.
//! 3. **Attachments** - same for attachments.
//!
//! A send that fails while the destination is still considered healthy is
//! retried exactly once before any failure accounting becomes visible;
//! single transient failures are common and cheap to paper over. The
//! second documents-send failure also signals the prefetcher to shrink
//! its next batch.

use crate::batch::{BatchAssembler, DocumentBatch};
use crate::config::BatchingConfig;
use crate::destination::ReplicationStrategy;
use crate::error::ReplicationError;
use crate::etag::Etag;
use crate::failure::FailureLedger;
use crate::metrics;
use crate::peer_client::{NegotiateOutcome, PeerClient, SourceReplicationInformation};
use crate::prefetcher::Prefetcher;
use crate::stats::{DestinationStatsTable, StatsScope, SuccessUpdate};
use crate::storage::DocumentStore;
use crate::work::WorkContext;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseOutcome {
    /// Data was shipped and acknowledged.
    Shipped,
    /// Nothing to ship (possibly after a cursor bump).
    NoOp,
    /// The phase failed; the worker ends.
    Failed,
}

/// Replicates one destination for one tick.
pub struct DestinationWorker {
    store: Arc<dyn DocumentStore>,
    client: Arc<PeerClient>,
    assembler: BatchAssembler,
    strategy: ReplicationStrategy,
    prefetcher: Arc<dyn Prefetcher>,
    ledger: Arc<FailureLedger>,
    stats: Arc<DestinationStatsTable>,
    work: Arc<WorkContext>,
    etag_bump_threshold: usize,
}

impl DestinationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        client: Arc<PeerClient>,
        strategy: ReplicationStrategy,
        prefetcher: Arc<dyn Prefetcher>,
        ledger: Arc<FailureLedger>,
        stats: Arc<DestinationStatsTable>,
        work: Arc<WorkContext>,
        batching: BatchingConfig,
    ) -> Self {
        Self {
            store,
            client,
            assembler: BatchAssembler::new(batching.clone()),
            strategy,
            prefetcher,
            ledger,
            stats,
            work,
            etag_bump_threshold: batching.etag_bump_threshold,
        }
    }

    /// Run the full state machine once. Returns whether anything was
    /// shipped, so the controller can wake an idling store.
    pub async fn replicate(&self) -> bool {
        let url = self.strategy.url().to_string();
        let mut scope = StatsScope::start("replicate");

        let info = match self.negotiate(&mut scope).await {
            Some(info) => info,
            None => {
                self.stats.entry(&url).push_stats(scope.finish());
                metrics::record_worker_outcome(&url, "negotiate_failed");
                return false;
            }
        };
        scope.record(json!({
            "LastDocumentEtag": info.last_document_etag.to_string(),
            "LastAttachmentEtag": info.last_attachment_etag.to_string(),
        }));

        let documents = self.replicate_documents(&info, &mut scope).await;
        if documents == PhaseOutcome::Failed {
            self.stats.entry(&url).push_stats(scope.finish());
            metrics::record_worker_outcome(&url, "documents_failed");
            return false;
        }

        let attachments = self.replicate_attachments(&info, &mut scope).await;
        self.stats.entry(&url).push_stats(scope.finish());

        let shipped =
            documents == PhaseOutcome::Shipped || attachments == PhaseOutcome::Shipped;
        metrics::record_worker_outcome(
            &url,
            if shipped {
                "ok"
            } else if attachments == PhaseOutcome::Failed {
                "attachments_failed"
            } else {
                "no_op"
            },
        );
        if shipped {
            self.work.update_found_work();
        }
        shipped
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 1: negotiate
    // ─────────────────────────────────────────────────────────────────────

    async fn negotiate(&self, scope: &mut StatsScope) -> Option<SourceReplicationInformation> {
        let url = self.strategy.url().to_string();
        let mut head = Etag::ZERO;
        let head_read = self.store.batch(&mut |accessor| {
            head = accessor.most_recent_document_etag();
            Ok(())
        });
        if let Err(e) = head_read {
            warn!(url = %url, error = %e, "Failed to read local head etag");
            scope.record_error("Storage", &e.to_string());
            return None;
        }

        match self.client.get_last_etag(&self.strategy, head).await {
            Ok(NegotiateOutcome::Info(info)) => {
                self.stats.entry(&url).set_last_etag_checked(head);
                Some(info)
            }
            Ok(NegotiateOutcome::NotEnabled { status }) => {
                warn!(url = %url, status, "Replication not enabled on peer");
                scope.record_error("PeerRejected", &format!("HTTP {}", status));
                self.ledger
                    .record_failure(&url, Some(&format!("replication not enabled (HTTP {})", status)));
                None
            }
            Err(ReplicationError::Cancelled) => None,
            Err(e) => {
                warn!(url = %url, error = %e, "Negotiation failed");
                scope.record_error("PeerError", &e.to_string());
                self.ledger.record_failure(&url, Some(&e.to_string()));
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 2: documents
    // ─────────────────────────────────────────────────────────────────────

    async fn replicate_documents(
        &self,
        info: &SourceReplicationInformation,
        scope: &mut StatsScope,
    ) -> PhaseOutcome {
        let url = self.strategy.url().to_string();
        let mut child = StatsScope::start("documents");
        let started = Instant::now();

        let batch = match self
            .assembler
            .build_documents(&self.store, &self.prefetcher, &self.strategy, info)
        {
            Ok(batch) => batch,
            Err(e) => {
                // Batch build failures are recorded and treated as an
                // empty, unadvanced batch; the tick continues.
                warn!(url = %url, error = %e, "Failed to build document batch");
                child.record_error("BatchBuildFailure", &e.to_string());
                scope.complete_child(child);
                return PhaseOutcome::NoOp;
            }
        };
        child.record(json!({
            "StartEtag": batch.start_etag.to_string(),
            "LastEtag": batch.last_etag.to_string(),
            "Documents": batch.documents.len(),
            "SystemDocs": batch.system_doc_count,
            "FromDestination": batch.from_destination_count,
        }));

        let outcome = if batch.documents.is_empty() {
            self.handle_empty_document_batch(&batch, &mut child).await
        } else {
            self.send_document_batch(&batch, &mut child).await
        };

        if !batch.loaded_docs.is_empty() {
            self.prefetcher
                .update_auto_throttler(&batch.loaded_docs, started.elapsed());
        }
        scope.complete_child(child);
        outcome
    }

    async fn handle_empty_document_batch(
        &self,
        batch: &DocumentBatch,
        child: &mut StatsScope,
    ) -> PhaseOutcome {
        let url = self.strategy.url().to_string();
        if !batch.advanced() {
            return PhaseOutcome::NoOp;
        }

        // Everything between the peer's cursor and ours was filtered out.
        // Bump the peer unless the filtered set was a small pile of system
        // or echoed documents not worth a round-trip.
        let threshold = self.etag_bump_threshold;
        let bump = batch.system_doc_count == 0
            || batch.system_doc_count > threshold
            || batch.from_destination_count > threshold;
        if !bump {
            debug!(url = %url, etag = %batch.last_etag, "Recording filtered-out progress locally");
            self.stats
                .entry(&url)
                .set_cursor(batch.last_etag, true, batch.last_last_modified);
            return PhaseOutcome::NoOp;
        }

        match self
            .client
            .put_last_etag(&self.strategy, Some(batch.last_etag), None)
            .await
        {
            Ok(()) => {
                debug!(url = %url, etag = %batch.last_etag, "Bumped peer document cursor");
                metrics::record_etag_bump(&url);
                self.ledger.record_success(
                    &url,
                    SuccessUpdate {
                        etag: Some(batch.last_etag),
                        for_documents: true,
                        last_modified: batch.last_last_modified,
                        ..Default::default()
                    },
                );
                PhaseOutcome::NoOp
            }
            Err(ReplicationError::Cancelled) => PhaseOutcome::Failed,
            Err(e) => {
                warn!(url = %url, error = %e, "Cursor bump failed");
                child.record_error("PeerError", &e.to_string());
                self.ledger.record_failure(&url, Some(&e.to_string()));
                PhaseOutcome::Failed
            }
        }
    }

    async fn send_document_batch(
        &self,
        batch: &DocumentBatch,
        child: &mut StatsScope,
    ) -> PhaseOutcome {
        let url = self.strategy.url().to_string();
        let wire = batch.wire_documents();
        let send_started = Instant::now();

        let mut result = self.client.send_documents(&self.strategy, &wire).await;
        if let Err(first) = &result {
            if matches!(first, ReplicationError::Cancelled) {
                return PhaseOutcome::Failed;
            }
            if self.ledger.is_first_failure(&url) {
                // First failure after a healthy period: retry once before
                // any accounting becomes visible.
                info!(url = %url, error = %first, "First send failure, retrying once");
                child.record_error("PeerError", &first.to_string());
                result = self.client.send_documents(&self.strategy, &wire).await;
            }
        }
        metrics::record_send_latency(&url, "documents", send_started.elapsed());

        match result {
            Ok(()) => {
                info!(
                    url = %url,
                    count = batch.documents.len(),
                    last_etag = %batch.last_etag,
                    "Shipped document batch"
                );
                metrics::record_documents_sent(&url, batch.documents.len());
                self.ledger.record_success(
                    &url,
                    SuccessUpdate {
                        etag: Some(batch.last_etag),
                        for_documents: true,
                        last_modified: batch.last_last_modified,
                        ..Default::default()
                    },
                );
                PhaseOutcome::Shipped
            }
            Err(ReplicationError::Cancelled) => PhaseOutcome::Failed,
            Err(e) => {
                warn!(url = %url, error = %e, "Document batch failed");
                child.record_error("PeerError", &e.to_string());
                // The batch may simply have been too big for the peer
                self.prefetcher.out_of_memory_happened();
                self.ledger.record_failure(&url, Some(&e.to_string()));
                PhaseOutcome::Failed
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Phase 3: attachments
    // ─────────────────────────────────────────────────────────────────────

    async fn replicate_attachments(
        &self,
        info: &SourceReplicationInformation,
        scope: &mut StatsScope,
    ) -> PhaseOutcome {
        let url = self.strategy.url().to_string();
        let mut child = StatsScope::start("attachments");

        let batch = match self
            .assembler
            .build_attachments(&self.store, &self.strategy, info)
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to build attachment batch");
                child.record_error("BatchBuildFailure", &e.to_string());
                scope.complete_child(child);
                return PhaseOutcome::NoOp;
            }
        };
        child.record(json!({
            "StartEtag": batch.start_etag.to_string(),
            "LastEtag": batch.last_etag.to_string(),
            "Attachments": batch.attachments.len(),
        }));

        if batch.attachments.is_empty() {
            let outcome = if batch.advanced() {
                match self
                    .client
                    .put_last_etag(&self.strategy, None, Some(batch.last_etag))
                    .await
                {
                    Ok(()) => {
                        metrics::record_etag_bump(&url);
                        self.ledger.record_success(
                            &url,
                            SuccessUpdate {
                                etag: Some(batch.last_etag),
                                for_documents: false,
                                ..Default::default()
                            },
                        );
                        PhaseOutcome::NoOp
                    }
                    Err(ReplicationError::Cancelled) => PhaseOutcome::Failed,
                    Err(e) => {
                        warn!(url = %url, error = %e, "Attachment cursor bump failed");
                        child.record_error("PeerError", &e.to_string());
                        self.ledger.record_failure(&url, Some(&e.to_string()));
                        PhaseOutcome::Failed
                    }
                }
            } else {
                PhaseOutcome::NoOp
            };
            scope.complete_child(child);
            return outcome;
        }

        let send_started = Instant::now();
        let mut result = self
            .client
            .send_attachments(&self.strategy, batch.payload.clone())
            .await;
        if let Err(first) = &result {
            if matches!(first, ReplicationError::Cancelled) {
                scope.complete_child(child);
                return PhaseOutcome::Failed;
            }
            if self.ledger.is_first_failure(&url) {
                info!(url = %url, error = %first, "First attachment send failure, retrying once");
                child.record_error("PeerError", &first.to_string());
                result = self
                    .client
                    .send_attachments(&self.strategy, batch.payload.clone())
                    .await;
            }
        }
        metrics::record_send_latency(&url, "attachments", send_started.elapsed());

        let outcome = match result {
            Ok(()) => {
                info!(
                    url = %url,
                    count = batch.attachments.len(),
                    last_etag = %batch.last_etag,
                    "Shipped attachment batch"
                );
                metrics::record_attachments_sent(&url, batch.attachments.len());
                self.ledger.record_success(
                    &url,
                    SuccessUpdate {
                        etag: Some(batch.last_etag),
                        for_documents: false,
                        ..Default::default()
                    },
                );
                PhaseOutcome::Shipped
            }
            Err(ReplicationError::Cancelled) => PhaseOutcome::Failed,
            Err(e) => {
                warn!(url = %url, error = %e, "Attachment batch failed");
                child.record_error("PeerError", &e.to_string());
                self.ledger.record_failure(&url, Some(&e.to_string()));
                PhaseOutcome::Failed
            }
        };
        scope.complete_child(child);
        outcome
    }
}
