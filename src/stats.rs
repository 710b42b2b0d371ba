// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-destination statistics and nested timing scopes.
//!
//! Every destination URL ever seen gets a [`DestinationEntry`] that lives
//! for the process lifetime: failure accounting, cursor positions, and a
//! bounded most-recent-first ring of [`ScopeRecord`]s describing the last
//! replication attempts. Workers build records through [`StatsScope`],
//! which stamps execution time when a scope finishes.

use crate::etag::Etag;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// How many scope records are retained per destination.
const STATS_RING_CAPACITY: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Scope recording
// ─────────────────────────────────────────────────────────────────────────────

/// One completed timing scope: a name, its execution time, and whatever
/// was recorded inside it (arbitrary JSON, structured errors, and nested
/// scopes serialized in place).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub name: String,
    pub execution_time_ms: u64,
    pub records: Vec<Value>,
}

/// An in-progress timing scope.
///
/// Finish the scope with [`finish`](Self::finish) to stamp its execution
/// time; fold child scopes back into their parent with
/// [`complete_child`](Self::complete_child).
pub struct StatsScope {
    name: String,
    started: Instant,
    records: Vec<Value>,
}

impl StatsScope {
    /// Open a scope.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            records: Vec::new(),
        }
    }

    /// Record an arbitrary JSON value inside this scope.
    pub fn record(&mut self, value: Value) {
        self.records.push(value);
    }

    /// Record a structured error entry.
    pub fn record_error(&mut self, error_type: &str, message: &str) {
        self.records.push(json!({
            "Error": { "Type": error_type, "Message": message }
        }));
    }

    /// Finish a child scope and fold its record into this one.
    pub fn complete_child(&mut self, child: StatsScope) {
        let record = child.finish();
        self.records
            .push(serde_json::to_value(record).unwrap_or(Value::Null));
    }

    /// Stamp the execution time and produce the record.
    pub fn finish(self) -> ScopeRecord {
        ScopeRecord {
            name: self.name,
            execution_time_ms: self.started.elapsed().as_millis() as u64,
            records: self.records,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Destination stats
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable snapshot of one destination's state, for admin and
/// diagnostic surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationStats {
    pub url: String,
    pub failure_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub first_failure_in_cycle: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_replicated_etag: Option<Etag>,
    pub last_replicated_attachment_etag: Option<Etag>,
    pub last_etag_checked: Option<Etag>,
    pub last_replicated_last_modified: Option<DateTime<Utc>>,
    pub last_heartbeat_received: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_stats: Vec<ScopeRecord>,
}

/// Mutable, non-atomic portion of a destination entry.
///
/// Timestamps and cursors are heuristic data; they are written together
/// under one short-lived lock and never participate in control-flow races.
#[derive(Debug, Default)]
struct EntryInner {
    last_failure: Option<DateTime<Utc>>,
    first_failure_in_cycle: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_replicated_etag: Option<Etag>,
    last_replicated_attachment_etag: Option<Etag>,
    last_etag_checked: Option<Etag>,
    last_replicated_last_modified: Option<DateTime<Utc>>,
    last_heartbeat_received: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_stats: VecDeque<ScopeRecord>,
}

/// Fields a success may update, chosen by the caller.
#[derive(Debug, Default, Clone)]
pub struct SuccessUpdate {
    /// The cursor that was acknowledged.
    pub etag: Option<Etag>,
    /// True when `etag` is a document cursor, false for attachments.
    pub for_documents: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Live accounting for one destination URL.
pub struct DestinationEntry {
    url: String,
    failure_count: AtomicU64,
    inner: Mutex<EntryInner>,
}

impl DestinationEntry {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            failure_count: AtomicU64::new(0),
            inner: Mutex::new(EntryInner::default()),
        }
    }

    /// The destination URL this entry tracks.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current consecutive failure count.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Record one failure: bump the counter, stamp the timestamps, keep
    /// the first-failure-in-cycle mark, and overwrite the last error when
    /// a message was provided.
    ///
    /// Returns the new failure count.
    pub fn record_failure(&self, last_error: Option<&str>) -> u64 {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_failure = Some(now);
        if inner.first_failure_in_cycle.is_none() {
            inner.first_failure_in_cycle = Some(now);
        }
        if let Some(error) = last_error {
            if !error.is_empty() {
                inner.last_error = Some(error.to_string());
            }
        }
        count
    }

    /// Record a success: zero the counter, clear the failure cycle, and
    /// apply whatever the caller chose to update.
    pub fn record_success(&self, update: SuccessUpdate) {
        self.failure_count.store(0, Ordering::Release);
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.first_failure_in_cycle = None;
        inner.last_success = Some(Utc::now());
        if let Some(etag) = update.etag {
            if update.for_documents {
                inner.last_replicated_etag = Some(etag);
            } else {
                inner.last_replicated_attachment_etag = Some(etag);
            }
        }
        if update.last_modified.is_some() {
            inner.last_replicated_last_modified = update.last_modified;
        }
        if update.last_heartbeat.is_some() {
            inner.last_heartbeat_received = update.last_heartbeat;
        }
        if update.last_error.is_some() {
            inner.last_error = update.last_error;
        }
    }

    /// Update a cursor without touching failure accounting. Used when
    /// progress was made locally (everything filtered out) without a peer
    /// round-trip.
    pub fn set_cursor(&self, etag: Etag, for_documents: bool, last_modified: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        if for_documents {
            inner.last_replicated_etag = Some(etag);
        } else {
            inner.last_replicated_attachment_etag = Some(etag);
        }
        if last_modified.is_some() {
            inner.last_replicated_last_modified = last_modified;
        }
    }

    /// Remember the local head etag seen during negotiation.
    pub fn set_last_etag_checked(&self, etag: Etag) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_etag_checked = Some(etag);
    }

    /// The document cursor acknowledged by this destination, if any.
    pub fn last_replicated_etag(&self) -> Option<Etag> {
        self.inner.lock().expect("stats lock poisoned").last_replicated_etag
    }

    /// How long the destination has been failing within the current cycle,
    /// or `None` when healthy.
    pub fn failing_for(&self) -> Option<chrono::Duration> {
        let inner = self.inner.lock().expect("stats lock poisoned");
        match (inner.first_failure_in_cycle, inner.last_failure) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }

    /// Push a completed scope record to the front of the ring.
    pub fn push_stats(&self, record: ScopeRecord) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.last_stats.push_front(record);
        inner.last_stats.truncate(STATS_RING_CAPACITY);
    }

    /// Produce a serializable snapshot.
    pub fn snapshot(&self) -> DestinationStats {
        let inner = self.inner.lock().expect("stats lock poisoned");
        DestinationStats {
            url: self.url.clone(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            last_failure: inner.last_failure,
            first_failure_in_cycle: inner.first_failure_in_cycle,
            last_success: inner.last_success,
            last_replicated_etag: inner.last_replicated_etag,
            last_replicated_attachment_etag: inner.last_replicated_attachment_etag,
            last_etag_checked: inner.last_etag_checked,
            last_replicated_last_modified: inner.last_replicated_last_modified,
            last_heartbeat_received: inner.last_heartbeat_received,
            last_error: inner.last_error.clone(),
            last_stats: inner.last_stats.iter().cloned().collect(),
        }
    }
}

/// Concurrent map of destination URL → live entry.
///
/// Entries are created on first contact and never removed; a URL that
/// leaves the configuration keeps its history for diagnostics.
#[derive(Default)]
pub struct DestinationStatsTable {
    entries: DashMap<String, Arc<DestinationEntry>>,
}

impl DestinationStatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for a URL.
    pub fn entry(&self, url: &str) -> Arc<DestinationEntry> {
        self.entries
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(DestinationEntry::new(url)))
            .clone()
    }

    /// Get the entry for a URL if one exists.
    pub fn get(&self, url: &str) -> Option<Arc<DestinationEntry>> {
        self.entries.get(url).map(|r| r.value().clone())
    }

    /// Snapshot every destination.
    pub fn snapshots(&self) -> Vec<DestinationStats> {
        self.entries.iter().map(|r| r.value().snapshot()).collect()
    }

    /// The smallest acknowledged document cursor across all destinations,
    /// usable as a tombstone purge bound. `None` when any destination has
    /// not acknowledged anything yet.
    pub fn least_replicated_etag(&self) -> Option<Etag> {
        let mut least: Option<Etag> = None;
        for entry in self.entries.iter() {
            match entry.value().last_replicated_etag() {
                None => return None,
                Some(etag) => {
                    least = Some(match least {
                        None => etag,
                        Some(current) => current.min(etag),
                    });
                }
            }
        }
        least
    }
}
