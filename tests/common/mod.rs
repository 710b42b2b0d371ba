//! Shared test doubles for integration tests.
#![allow(dead_code, unused_imports)] // each test binary uses a different subset

pub mod mock_peer;
pub mod mock_prefetcher;
pub mod mock_store;

pub use mock_peer::SimulatedPeers;
pub use mock_prefetcher::{SeededPrefetcher, SeededPrefetcherFactory};
pub use mock_store::MemoryStore;

use outbound_replication::etag::Etag;

/// Mint an ascending test etag.
pub fn etag(n: u64) -> Etag {
    Etag::from_parts(0, n)
}
