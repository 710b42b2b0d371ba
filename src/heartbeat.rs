//! Inbound heartbeat tracking.
//!
//! Peers that replicate to us (or that we replicate to) POST heartbeats;
//! receiving one is proof of liveness and clears any failure accounting
//! for that URL, since the network path is demonstrably up.

use crate::failure::FailureLedger;
use crate::stats::SuccessUpdate;
use crate::work::WorkContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Map from peer URL to the last time we received a heartbeat from it.
pub struct HeartbeatTable {
    heartbeats: DashMap<String, DateTime<Utc>>,
    ledger: Arc<FailureLedger>,
    work: Arc<WorkContext>,
}

impl HeartbeatTable {
    pub fn new(ledger: Arc<FailureLedger>, work: Arc<WorkContext>) -> Self {
        Self {
            heartbeats: DashMap::new(),
            ledger,
            work,
        }
    }

    /// Handle an inbound heartbeat from `src`.
    ///
    /// Records a success (clearing failure state and the persistent
    /// failure doc), stamps the table, and nudges the work context so an
    /// idling controller re-evaluates the now-live destination.
    pub fn handle_heartbeat(&self, src: &str) {
        let now = Utc::now();
        debug!(src, "Received heartbeat");
        self.ledger.record_success(
            src,
            SuccessUpdate {
                last_heartbeat: Some(now),
                ..Default::default()
            },
        );
        self.heartbeats.insert(src.to_string(), now);
        self.work.notify_about_work();
    }

    /// True iff a heartbeat from `src` arrived at or after `since`.
    pub fn is_heartbeat_available(&self, src: &str, since: DateTime<Utc>) -> bool {
        self.heartbeats
            .get(src)
            .map(|received| *received.value() >= since)
            .unwrap_or(false)
    }

    /// Last heartbeat time for `src`, if any.
    pub fn last_heartbeat(&self, src: &str) -> Option<DateTime<Utc>> {
        self.heartbeats.get(src).map(|r| *r.value())
    }
}
