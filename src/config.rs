//! Configuration for the replication agent.
//!
//! Configuration is passed to
//! [`ReplicationController::new()`](crate::controller::ReplicationController::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use outbound_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     local_url: "http://localhost:8080".into(),
//!     database_id: "4fd0b2f4-7b34-4c52-a116-5d2c6a2f9bd1".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_url: String            # How peers address this node
//! ├── database_id: String          # This database's identity (guid)
//! ├── schedule: ScheduleConfig     # Tick cadence, work-wait bound
//! ├── batching: BatchingConfig     # Tombstone caps, attachment bounds
//! └── http: HttpConfig             # Transport timeouts
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationController::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for the replication agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The URL peers use to address this node. Sent as the `from` query
    /// parameter on every remote operation so the peer can attribute the
    /// traffic and answer heartbeats.
    pub local_url: String,

    /// This database's identity. The destinations document must name it as
    /// its `Source`, and peers key their acknowledged cursors by it.
    pub database_id: String,

    /// Tick cadence and wake-up behavior.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Batch assembly bounds.
    #[serde(default)]
    pub batching: BatchingConfig,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_url: "http://localhost:8080".to_string(),
            database_id: "00000000-0000-0000-0000-000000000000".to_string(),
            schedule: ScheduleConfig::default(),
            batching: BatchingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing with tight timings.
    pub fn for_testing(local_url: &str, database_id: &str) -> Self {
        Self {
            local_url: local_url.to_string(),
            database_id: database_id.to_string(),
            schedule: ScheduleConfig::testing(),
            batching: BatchingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig: tick cadence
// ═══════════════════════════════════════════════════════════════════════════════

/// When the controller wakes and how long it lets things linger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Full interval between unforced ticks, as a duration string
    /// (e.g. "5m"). A work notification from the store wakes the loop
    /// earlier.
    #[serde(default = "default_run_interval")]
    pub run_interval: String,

    /// Upper bound on a single work-wait slice (e.g. "30s"). The loop
    /// re-checks shutdown at least this often while idle.
    #[serde(default = "default_work_wait")]
    pub work_wait: String,

    /// How long a destination may fail continuously before its prefetcher
    /// is disposed (e.g. "3m").
    #[serde(default = "default_prefetcher_stale_after")]
    pub prefetcher_stale_after: String,

    /// Page size used when scanning stored replication-source documents
    /// for sibling notification.
    #[serde(default = "default_sources_page_size")]
    pub sources_page_size: usize,
}

fn default_run_interval() -> String {
    "5m".to_string()
}

fn default_work_wait() -> String {
    "30s".to_string()
}

fn default_prefetcher_stale_after() -> String {
    "3m".to_string()
}

fn default_sources_page_size() -> usize {
    128
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            run_interval: default_run_interval(),
            work_wait: default_work_wait(),
            prefetcher_stale_after: default_prefetcher_stale_after(),
            sources_page_size: 128,
        }
    }
}

impl ScheduleConfig {
    /// Fast cadence for tests.
    pub fn testing() -> Self {
        Self {
            run_interval: "50ms".to_string(),
            work_wait: "10ms".to_string(),
            prefetcher_stale_after: "100ms".to_string(),
            sources_page_size: 128,
        }
    }

    /// Parse `run_interval`, falling back to 5 minutes.
    pub fn run_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.run_interval).unwrap_or(Duration::from_secs(300))
    }

    /// Parse `work_wait`, falling back to 30 seconds.
    pub fn work_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.work_wait).unwrap_or(Duration::from_secs(30))
    }

    /// Parse `prefetcher_stale_after`, falling back to 3 minutes.
    pub fn prefetcher_stale_duration(&self) -> Duration {
        humantime::parse_duration(&self.prefetcher_stale_after).unwrap_or(Duration::from_secs(180))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchingConfig: assembler bounds
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounds applied while assembling outgoing batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Floor for the document-tombstone read cap. The effective cap is
    /// `max(doc_tombstone_floor, docs_in_batch) + 1`.
    #[serde(default = "default_doc_tombstone_floor")]
    pub doc_tombstone_floor: usize,

    /// Floor for the attachment-tombstone read cap. The effective cap is
    /// `max(attachment_tombstone_floor, attachments_in_batch) + 1`.
    #[serde(default = "default_attachment_tombstone_floor")]
    pub attachment_tombstone_floor: usize,

    /// Maximum attachments per batch.
    #[serde(default = "default_attachment_batch_items")]
    pub attachment_batch_items: usize,

    /// Maximum accumulated attachment payload per batch, in bytes.
    #[serde(default = "default_attachment_batch_bytes")]
    pub attachment_batch_bytes: u64,

    /// Filtered-out counts above this threshold force an empty-batch etag
    /// bump to the peer, so a destination behind a wall of system or
    /// echoed documents still advances.
    #[serde(default = "default_etag_bump_threshold")]
    pub etag_bump_threshold: usize,
}

fn default_doc_tombstone_floor() -> usize {
    1024
}

fn default_attachment_tombstone_floor() -> usize {
    100
}

fn default_attachment_batch_items() -> usize {
    100
}

fn default_attachment_batch_bytes() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_etag_bump_threshold() -> usize {
    15
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            doc_tombstone_floor: 1024,
            attachment_tombstone_floor: 100,
            attachment_batch_items: 100,
            attachment_batch_bytes: 10 * 1024 * 1024,
            etag_bump_threshold: 15,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HttpConfig: transport settings
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP transport settings for peer operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout as a duration string (e.g. "30s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Connect timeout as a duration string (e.g. "5s").
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl HttpConfig {
    /// Parse `request_timeout`, falling back to 30 seconds.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Parse `connect_timeout`, falling back to 5 seconds.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
