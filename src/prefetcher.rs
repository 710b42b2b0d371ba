//! Prefetcher integration traits.
//!
//! A prefetcher assembles document batches ahead of the worker and owns
//! batch sizing: it grows its target on smooth progress and halves it when
//! told a send ran the peer out of memory. The agent keeps one prefetcher per
//! destination URL and disposes it when the URL disappears from the
//! configuration or the destination has been failing continuously for the
//! configured stale window.
//!
//! The host provides an implementation; tests use a recording mock.

use crate::document::ReplicatedDocument;
use crate::error::Result;
use crate::etag::Etag;
use std::sync::Arc;
use std::time::Duration;

/// What we need from a document prefetcher.
pub trait Prefetcher: Send + Sync + 'static {
    /// Next batch of documents with etag strictly greater than `after`,
    /// in ascending etag order. Empty means caught up.
    fn documents_after(&self, after: Etag) -> Result<Vec<ReplicatedDocument>>;

    /// Prefetcher-side filter applied after the destination's own filters.
    fn filter_document(&self, doc: &ReplicatedDocument) -> bool;

    /// Feed the auto-tuner with the documents actually loaded and the time
    /// the send took.
    fn update_auto_throttler(&self, docs: &[ReplicatedDocument], elapsed: Duration);

    /// Signal that a send failed in a way that suggests the batch was too
    /// large; the next batch target is halved.
    fn out_of_memory_happened(&self);

    /// Drop cached documents up to and including `upto`; they have been
    /// acknowledged by the destination.
    fn cleanup_documents(&self, upto: Etag);

    /// Release resources. Called once, when the agent stops tracking the
    /// destination.
    fn dispose(&self);
}

/// Creates prefetchers on demand, one per destination URL.
pub trait PrefetcherFactory: Send + Sync + 'static {
    fn create(&self, destination_url: &str) -> Arc<dyn Prefetcher>;
}
