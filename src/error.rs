// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication agent.
//!
//! Errors are categorized by where they occur and whether the failure is
//! transient. Transient errors feed the [`FailureLedger`](crate::failure::FailureLedger)
//! and are retried on later ticks with proportional back-off; permanent
//! errors are surfaced once and the offending unit (a destination entry,
//! a batch) is skipped.
//!
//! # Error Categories
//!
//! | Error Type | Transient | Description |
//! |------------|-----------|-------------|
//! | `PeerUnreachable` | Yes | Network error, timeout, connection refused |
//! | `PeerRejected` | No | HTTP 400/404 - replication not enabled on the peer |
//! | `Peer` | Yes | Any other HTTP error from the peer |
//! | `BatchBuild` | Yes | Storage or filter failure while assembling a batch |
//! | `Storage` | Yes | Local store read/write failure |
//! | `MisconfiguredSource` | No | Destinations document belongs to another database |
//! | `BadDestination` | No | A destination entry could not be turned into a strategy |
//! | `Cancelled` | No | Shutdown observed mid-operation |

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating to peers.
///
/// Use [`is_transient()`](Self::is_transient) to decide whether the
/// operation should be recorded in the failure ledger and retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The peer could not be reached at the transport level.
    ///
    /// Covers DNS failures, refused connections, and timeouts.
    /// Transient - counts toward the destination's failure depth.
    #[error("peer unreachable ({url}): {message}")]
    PeerUnreachable { url: String, message: String },

    /// The peer answered 400 or 404 during negotiation.
    ///
    /// Means replication is not enabled (or the database does not exist)
    /// on the remote side. Not transient - retrying the same request will
    /// keep failing until the peer is reconfigured.
    #[error("replication not enabled on peer {url} (HTTP {status})")]
    PeerRejected { url: String, status: u16 },

    /// Any other HTTP-level error from the peer.
    ///
    /// The message carries the peer's structured `Error` body when one
    /// could be parsed, otherwise the status description.
    #[error("peer error ({url}, HTTP {status}): {message}")]
    Peer {
        url: String,
        status: u16,
        message: String,
    },

    /// Batch assembly failed inside the storage transaction.
    ///
    /// Recorded in the destination's stats; the worker continues with an
    /// empty batch rather than aborting the tick.
    #[error("batch build failure: {0}")]
    BatchBuild(String),

    /// Local store read or write failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The destinations document names a different source database.
    ///
    /// Raised once per misconfiguration episode; the resolver emits a
    /// one-shot alert and returns no destinations.
    #[error("destinations document source is {actual}, expected {expected}")]
    MisconfiguredSource { expected: String, actual: String },

    /// One destination entry could not be resolved into a strategy.
    ///
    /// Logged and skipped; other destinations are unaffected.
    #[error("bad destination entry: {0}")]
    BadDestination(String),

    /// Shutdown was observed while the operation was in flight.
    ///
    /// Unwinds without recording a failure.
    #[error("operation cancelled")]
    Cancelled,
}

impl ReplicationError {
    /// Check if this error is transient.
    ///
    /// Transient errors are recorded in the failure ledger and retried on
    /// later ticks. Non-transient errors indicate configuration problems
    /// or deliberate cancellation.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PeerUnreachable { .. } => true,
            Self::Peer { .. } => true,
            Self::BatchBuild(_) => true,
            Self::Storage(_) => true,
            Self::PeerRejected { .. } => false,
            Self::MisconfiguredSource { .. } => false,
            Self::BadDestination(_) => false,
            Self::Cancelled => false,
        }
    }

    /// True when the error should be recorded against the destination.
    ///
    /// Cancellation never counts as a destination failure; a 400/404
    /// rejection does, so the back-off bands still apply to a peer that
    /// has replication switched off.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
