//! Misconfiguration alerts.
//!
//! The agent raises exactly one alert per misconfiguration episode (the
//! destinations document naming a foreign source database). The sink is
//! host-provided; the default just logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

/// An operator-facing alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Alerts with the same key are collapsed by the sink.
    pub unique_key: String,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
            unique_key: unique_key.into(),
        }
    }
}

/// Where alerts go. Host-provided.
pub trait AlertSink: Send + Sync + 'static {
    fn add(&self, alert: Alert);
}

/// Default sink: logs the alert at error level.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn add(&self, alert: Alert) {
        error!(title = %alert.title, key = %alert.unique_key, "{}", alert.message);
    }
}
