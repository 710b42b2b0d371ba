// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure accounting and proportional back-off.
//!
//! Two layers of state:
//!
//! - in-process counters/timestamps on the destination's
//!   [`DestinationEntry`](crate::stats::DestinationEntry);
//! - a persistent failure document in the local store, keyed by the
//!   escaped destination URL, which survives restarts and feeds the
//!   throttle bands.
//!
//! # Throttle bands
//!
//! A destination with persisted failure count `F` is attempted on tick
//! number `A` according to:
//!
//! | F | attempt when |
//! |---|---|
//! | absent or ≤ 10 | always |
//! | 11–100 | `A % 2 == 0` |
//! | 101–1000 | `A % 5 == 0` |
//! | > 1000 | `A % 10 == 0` |
//!
//! The very first failure after a healthy period is special: callers may
//! grant one immediate retry before the failure becomes externally
//! visible (see [`FailureLedger::is_first_failure`]).

use crate::stats::{DestinationStatsTable, SuccessUpdate};
use crate::storage::{DocumentStore, DESTINATION_FAILURE_PREFIX};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Persistent failure record for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationFailureInformation {
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "FailureCount")]
    pub failure_count: u64,
}

/// Escape a destination URL for use as a document key suffix: the scheme
/// prefix, slashes, and colons are stripped, then the rest is URI-encoded.
pub fn escape_destination_url(url: &str) -> String {
    let stripped = url.strip_prefix("http://").unwrap_or(url);
    let cleaned: String = stripped.chars().filter(|c| *c != '/' && *c != ':').collect();
    utf8_percent_encode(&cleaned, NON_ALPHANUMERIC).to_string()
}

/// Document key holding the persistent failure record for `url`.
pub fn failure_doc_key(url: &str) -> String {
    format!("{}{}", DESTINATION_FAILURE_PREFIX, escape_destination_url(url))
}

/// Failure accounting over the stats table plus the persistent store.
pub struct FailureLedger {
    store: Arc<dyn DocumentStore>,
    stats: Arc<DestinationStatsTable>,
}

impl FailureLedger {
    pub fn new(store: Arc<dyn DocumentStore>, stats: Arc<DestinationStatsTable>) -> Self {
        Self { store, stats }
    }

    /// Decide whether `url` should be attempted on tick `attempt`, based
    /// on its persisted failure depth.
    pub fn is_not_failing(&self, url: &str, attempt: u64) -> bool {
        let failure_count = match self.persisted_failure_count(url) {
            Some(count) => count,
            None => return true,
        };

        let allowed = match failure_count {
            0..=10 => true,
            11..=100 => attempt % 2 == 0,
            101..=1000 => attempt % 5 == 0,
            _ => attempt % 10 == 0,
        };
        if !allowed {
            debug!(
                url,
                failure_count, attempt, "Skipping failing destination this tick"
            );
        }
        allowed
    }

    /// True iff no failure has been recorded since the last success.
    ///
    /// Workers use this to grant exactly one immediate retry on the
    /// healthy→failing transition.
    pub fn is_first_failure(&self, url: &str) -> bool {
        self.stats.entry(url).failure_count() == 0
    }

    /// Record one failure in process state and in the persistent doc.
    pub fn record_failure(&self, url: &str, last_error: Option<&str>) {
        let count = self.stats.entry(url).record_failure(last_error);
        crate::metrics::set_destination_failure_count(url, count);

        let key = failure_doc_key(url);
        let persisted = self
            .read_failure_doc(&key)
            .map(|info| info.failure_count)
            .unwrap_or(0);
        let info = DestinationFailureInformation {
            destination: url.to_string(),
            failure_count: persisted + 1,
        };
        let data = match serde_json::to_value(&info) {
            Ok(value) => value,
            Err(e) => {
                warn!(url, error = %e, "Failed to serialize failure document");
                return;
            }
        };
        if let Err(e) = self.store.put(&key, None, data, json!({})) {
            warn!(url, error = %e, "Failed to persist failure document");
        }
    }

    /// Record a success: reset in-process state, apply the caller's cursor
    /// update, and delete the persistent failure doc.
    pub fn record_success(&self, url: &str, update: SuccessUpdate) {
        self.stats.entry(url).record_success(update);
        crate::metrics::set_destination_failure_count(url, 0);

        let key = failure_doc_key(url);
        if let Err(e) = self.store.delete(&key, None) {
            warn!(url, error = %e, "Failed to delete failure document");
        }
    }

    fn persisted_failure_count(&self, url: &str) -> Option<u64> {
        self.read_failure_doc(&failure_doc_key(url))
            .map(|info| info.failure_count)
    }

    fn read_failure_doc(&self, key: &str) -> Option<DestinationFailureInformation> {
        match self.store.get(key) {
            Ok(Some(doc)) => serde_json::from_value(doc.data).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read failure document");
                None
            }
        }
    }
}
