// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication controller.
//!
//! The main orchestrator that ties together:
//! - Destination resolution via [`crate::destination::DestinationResolver`]
//! - Per-destination workers via [`crate::worker::DestinationWorker`]
//! - Failure accounting via [`crate::failure::FailureLedger`]
//! - Prefetcher lifecycle (one per destination URL)
//!
//! # Tick anatomy
//!
//! 1. Resolve destinations (warn once when there are none)
//! 2. Bump the attempt counter; on modification-triggered wakes, filter
//!    destinations through the failure throttle
//! 3. Reconcile prefetchers: dispose those whose URL disappeared or whose
//!    destination has been failing past the stale window
//! 4. Spawn at most one worker per destination (single-flight token)
//! 5. Join this tick's workers, then prune prefetcher caches up to each
//!    destination's acknowledged cursor
//! 6. Park until the next work notification (bounded 30 s slices) or the
//!    full interval elapses
//!
//! Shutdown stops accepting work, joins the in-flight workers (they
//! observe cancellation at the next HTTP boundary), and disposes all
//! prefetchers.

use crate::alerts::{AlertSink, LogAlertSink};
use crate::config::ReplicationConfig;
use crate::destination::{DestinationResolver, ReplicationStrategy};
use crate::failure::FailureLedger;
use crate::heartbeat::HeartbeatTable;
use crate::metrics;
use crate::peer_client::{PeerClient, PeerTransport};
use crate::prefetcher::{Prefetcher, PrefetcherFactory};
use crate::stats::DestinationStatsTable;
use crate::storage::{DocumentStore, SOURCES_PREFIX};
use crate::work::WorkContext;
use crate::worker::DestinationWorker;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Releases a destination's single-flight token on every exit path,
/// including worker panics.
struct SingleFlightGuard {
    token: Arc<AtomicI32>,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.token.store(0, Ordering::Release);
    }
}

/// The top-level replication loop.
///
/// Owns the per-URL prefetchers and single-flight tokens; workers are
/// short-lived, spawned at most once per destination per tick.
pub struct ReplicationController {
    config: ReplicationConfig,
    store: Arc<dyn DocumentStore>,
    prefetcher_factory: Arc<dyn PrefetcherFactory>,
    work: Arc<WorkContext>,
    stats: Arc<DestinationStatsTable>,
    ledger: Arc<FailureLedger>,
    heartbeats: Arc<HeartbeatTable>,
    resolver: DestinationResolver,
    client: Arc<PeerClient>,
    replication_attempts: AtomicU64,
    active_tokens: DashMap<String, Arc<AtomicI32>>,
    prefetchers: DashMap<String, Arc<dyn Prefetcher>>,
    warned_no_destinations: AtomicBool,
}

impl ReplicationController {
    /// Create a controller with the default (logging) alert sink.
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn PeerTransport>,
        prefetcher_factory: Arc<dyn PrefetcherFactory>,
    ) -> Self {
        Self::with_alerts(config, store, transport, prefetcher_factory, Arc::new(LogAlertSink))
    }

    /// Create a controller with a host-provided alert sink.
    pub fn with_alerts(
        config: ReplicationConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn PeerTransport>,
        prefetcher_factory: Arc<dyn PrefetcherFactory>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let work = Arc::new(WorkContext::new());
        let stats = Arc::new(DestinationStatsTable::new());
        let ledger = Arc::new(FailureLedger::new(store.clone(), stats.clone()));
        let heartbeats = Arc::new(HeartbeatTable::new(ledger.clone(), work.clone()));
        let resolver = DestinationResolver::new(store.clone(), &config.database_id, alerts);
        let client = Arc::new(PeerClient::new(
            transport,
            &config.local_url,
            &config.database_id,
            work.shutdown_receiver(),
        ));

        Self {
            config,
            store,
            prefetcher_factory,
            work,
            stats,
            ledger,
            heartbeats,
            resolver,
            client,
            replication_attempts: AtomicU64::new(0),
            active_tokens: DashMap::new(),
            prefetchers: DashMap::new(),
            warned_no_destinations: AtomicBool::new(false),
        }
    }

    /// The shared work/shutdown context. The host's write path calls
    /// `notify_about_work()` on it.
    pub fn work_context(&self) -> &Arc<WorkContext> {
        &self.work
    }

    /// Per-destination statistics, for admin surfaces.
    pub fn stats(&self) -> &Arc<DestinationStatsTable> {
        &self.stats
    }

    /// Inbound heartbeat handler, for the host's HTTP endpoint.
    pub fn heartbeats(&self) -> &Arc<HeartbeatTable> {
        &self.heartbeats
    }

    /// Signal shutdown; `run()` returns after joining in-flight workers.
    pub fn shutdown(&self) {
        self.work.shutdown();
    }

    /// Run until shutdown.
    ///
    /// Sibling notification runs once, concurrently with the first ticks.
    pub async fn run(self: Arc<Self>) {
        info!(
            local_url = %self.config.local_url,
            database_id = %self.config.database_id,
            "Starting replication controller"
        );

        let sibling = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.notify_siblings().await })
        };

        let mut work_triggered = false;
        while !self.work.is_shutdown() {
            self.run_once(work_triggered).await;
            work_triggered = self.wait_for_next_signal().await;
        }

        let _ = sibling.await;

        for entry in self.prefetchers.iter() {
            entry.value().dispose();
        }
        self.prefetchers.clear();
        info!("Replication controller stopped");
    }

    /// Run a single tick. Exposed for hosts that drive scheduling
    /// themselves (and for tests).
    ///
    /// `work_triggered` marks the wake as caused by local modifications;
    /// only those ticks apply the failure throttle, so the periodic timer
    /// still probes failing destinations.
    pub async fn run_once(&self, work_triggered: bool) {
        let destinations = self.resolver.resolve();
        metrics::record_tick(destinations.len());

        if destinations.is_empty() {
            if !self.warned_no_destinations.swap(true, Ordering::AcqRel) {
                warn!("No replication destinations configured");
            }
            return;
        }
        self.warned_no_destinations.store(false, Ordering::Release);

        let attempt = self.replication_attempts.fetch_add(1, Ordering::AcqRel) + 1;

        let candidates: Vec<ReplicationStrategy> = destinations
            .iter()
            .filter(|strategy| {
                if !work_triggered {
                    return true;
                }
                let allowed = self.ledger.is_not_failing(strategy.url(), attempt);
                if !allowed {
                    metrics::record_destination_skipped(strategy.url());
                }
                allowed
            })
            .cloned()
            .collect();

        self.reconcile_prefetchers(&destinations);

        let mut workers: JoinSet<bool> = JoinSet::new();
        for strategy in candidates {
            let url = strategy.url().to_string();
            let token = self
                .active_tokens
                .entry(url.clone())
                .or_insert_with(|| Arc::new(AtomicI32::new(0)))
                .clone();
            if token
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(url = %url, "Worker already in flight, skipping");
                continue;
            }

            let worker = DestinationWorker::new(
                self.store.clone(),
                self.client.clone(),
                strategy,
                self.prefetcher_for(&url),
                self.ledger.clone(),
                self.stats.clone(),
                self.work.clone(),
                self.config.batching.clone(),
            );
            workers.spawn(async move {
                let _guard = SingleFlightGuard { token };
                worker.replicate().await
            });
        }

        // Join this tick's workers; panics release the token via the
        // guard and surface here as a failed join.
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Replication worker panicked");
            }
        }

        // Acknowledged documents no longer need to sit in prefetcher caches
        for entry in self.prefetchers.iter() {
            if let Some(stats) = self.stats.get(entry.key()) {
                if let Some(etag) = stats.last_replicated_etag() {
                    entry.value().cleanup_documents(etag);
                }
            }
        }
    }

    /// Park until the next signal. Returns `true` when the wake was
    /// caused by a work notification rather than the interval timer.
    async fn wait_for_next_signal(&self) -> bool {
        let interval = self.config.schedule.run_interval_duration();
        let slice = self.config.schedule.work_wait_duration();
        let started = Instant::now();

        while !self.work.is_shutdown() {
            let remaining = interval.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return false;
            }
            if self.work.wait_for_work(slice.min(remaining), "replication").await {
                return true;
            }
        }
        false
    }

    /// Dispose prefetchers whose URL left the configuration or whose
    /// destination has been failing past the stale window.
    fn reconcile_prefetchers(&self, destinations: &[ReplicationStrategy]) {
        let live: HashSet<&str> = destinations.iter().map(|d| d.url()).collect();
        let stale_after = chrono::Duration::from_std(
            self.config.schedule.prefetcher_stale_duration(),
        )
        .unwrap_or_else(|_| chrono::Duration::minutes(3));

        self.prefetchers.retain(|url, prefetcher| {
            if !live.contains(url.as_str()) {
                info!(url = %url, "Disposing prefetcher, destination removed");
                metrics::record_prefetcher_disposed("gone");
                prefetcher.dispose();
                return false;
            }
            let failing_for = self.stats.get(url).and_then(|entry| entry.failing_for());
            if let Some(failing_for) = failing_for {
                if failing_for >= stale_after {
                    info!(
                        url = %url,
                        failing_for_secs = failing_for.num_seconds(),
                        "Disposing prefetcher, destination keeps failing"
                    );
                    metrics::record_prefetcher_disposed("stale");
                    prefetcher.dispose();
                    return false;
                }
            }
            true
        });
    }

    fn prefetcher_for(&self, url: &str) -> Arc<dyn Prefetcher> {
        self.prefetchers
            .entry(url.to_string())
            .or_insert_with(|| self.prefetcher_factory.create(url))
            .clone()
    }

    /// Announce ourselves to every known peer: the configured
    /// destinations plus every stored replication-source document.
    /// Failures are logged and never block startup.
    async fn notify_siblings(&self) {
        let mut targets: Vec<String> = self
            .resolver
            .resolve()
            .iter()
            .map(|strategy| strategy.url().to_string())
            .collect();

        let page = self.config.schedule.sources_page_size;
        let mut skip = 0;
        loop {
            let docs = match self.store.documents_with_id_prefix(SOURCES_PREFIX, skip, page) {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(error = %e, "Failed to scan replication sources");
                    break;
                }
            };
            if docs.is_empty() {
                break;
            }
            skip += docs.len();
            for doc in &docs {
                if let Some(url) = doc.data.get("Source").and_then(Value::as_str) {
                    if !url.is_empty() {
                        targets.push(url.to_string());
                    }
                }
            }
            if docs.len() < page {
                break;
            }
        }

        targets.sort();
        targets.dedup();
        info!(peer_count = targets.len(), "Notifying siblings");

        for target in targets {
            match self.client.heartbeat(&target).await {
                Ok(()) => metrics::record_sibling_heartbeat(true),
                Err(e) => {
                    debug!(url = %target, error = %e, "Sibling heartbeat failed");
                    metrics::record_sibling_heartbeat(false);
                }
            }
        }
    }
}
