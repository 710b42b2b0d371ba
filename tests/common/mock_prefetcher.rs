//! Seedable prefetcher doubles for integration tests.

use outbound_replication::document::ReplicatedDocument;
use outbound_replication::error::Result;
use outbound_replication::etag::Etag;
use outbound_replication::prefetcher::{Prefetcher, PrefetcherFactory};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prefetcher over a fixed, shared document set.
#[derive(Default)]
pub struct SeededPrefetcher {
    docs: Mutex<Vec<ReplicatedDocument>>,
    batch_size: AtomicUsize,
    pub out_of_memory_calls: AtomicUsize,
    pub cleanup_upto: Mutex<Option<Etag>>,
    pub disposed: AtomicBool,
}

impl SeededPrefetcher {
    pub fn new() -> Self {
        let prefetcher = Self::default();
        prefetcher.batch_size.store(1024, Ordering::Relaxed);
        prefetcher
    }

    pub fn seed(&self, docs: Vec<ReplicatedDocument>) {
        let mut stored = self.docs.lock().unwrap();
        stored.extend(docs);
        stored.sort_by_key(|d| d.etag);
    }
}

impl Prefetcher for SeededPrefetcher {
    fn documents_after(&self, after: Etag) -> Result<Vec<ReplicatedDocument>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .iter()
            .filter(|d| d.etag > after)
            .take(self.batch_size.load(Ordering::Relaxed))
            .cloned()
            .collect())
    }

    fn filter_document(&self, _doc: &ReplicatedDocument) -> bool {
        true
    }

    fn update_auto_throttler(&self, _docs: &[ReplicatedDocument], _elapsed: Duration) {}

    fn out_of_memory_happened(&self) {
        self.out_of_memory_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_documents(&self, upto: Etag) {
        *self.cleanup_upto.lock().unwrap() = Some(upto);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Relaxed);
    }
}

/// Factory handing each URL the same shared, pre-seeded prefetcher.
#[derive(Default)]
pub struct SeededPrefetcherFactory {
    shared: Mutex<Vec<(String, Arc<SeededPrefetcher>)>>,
    /// Documents every newly created prefetcher starts with.
    seed: Mutex<Vec<ReplicatedDocument>>,
}

impl SeededPrefetcherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, docs: Vec<ReplicatedDocument>) {
        self.seed.lock().unwrap().extend(docs);
    }

    pub fn created(&self) -> Vec<(String, Arc<SeededPrefetcher>)> {
        self.shared.lock().unwrap().clone()
    }

    pub fn for_url(&self, url: &str) -> Option<Arc<SeededPrefetcher>> {
        self.shared
            .lock()
            .unwrap()
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, p)| p.clone())
    }
}

impl PrefetcherFactory for SeededPrefetcherFactory {
    fn create(&self, destination_url: &str) -> Arc<dyn Prefetcher> {
        let prefetcher = Arc::new(SeededPrefetcher::new());
        prefetcher.seed(self.seed.lock().unwrap().clone());
        self.shared
            .lock()
            .unwrap()
            .push((destination_url.to_string(), prefetcher.clone()));
        prefetcher
    }
}
