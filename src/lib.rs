// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Outbound Replication
//!
//! A push-based replication agent that ships newly written documents and
//! attachments from a local document store to a set of peer endpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         outbound-replication                             │
//! │                                                                          │
//! │  ┌────────────────┐   ┌─────────────────┐   ┌─────────────────────────┐  │
//! │  │ Controller     │──►│ Destination     │──►│ DestinationWorker       │  │
//! │  │ (tick loop)    │   │ Resolver        │   │ (negotiate/docs/attach) │  │
//! │  └────────────────┘   └─────────────────┘   └─────────────────────────┘  │
//! │         │                                              │                 │
//! │         ▼                                              ▼                 │
//! │  ┌────────────────┐   ┌─────────────────┐   ┌─────────────────────────┐  │
//! │  │ Prefetchers    │   │ BatchAssembler  │   │ PeerClient (HTTP)       │  │
//! │  │ (per URL)      │   │ (docs+tombstone)│   │ lastEtag / replicateDocs│  │
//! │  └────────────────┘   └─────────────────┘   └─────────────────────────┘  │
//! │         │                                              │                 │
//! │         ▼                                              ▼                 │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │ FailureLedger + DestinationStats + HeartbeatTable (shared state)   │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery model
//!
//! Delivery is at-least-once and idempotent: each destination remembers the
//! last etag it acknowledged, the worker negotiates that cursor before every
//! batch, and batches are strictly ascending in etag. Deletions travel as
//! tombstones interleaved into the document stream. A destination that keeps
//! failing is attempted less and less often, proportional to its recorded
//! failure depth.

pub mod alerts;
pub mod batch;
pub mod config;
pub mod controller;
pub mod destination;
pub mod document;
pub mod error;
pub mod etag;
pub mod failure;
pub mod heartbeat;
pub mod metrics;
pub mod peer_client;
pub mod prefetcher;
pub mod stats;
pub mod storage;
pub mod work;
pub mod worker;

// Re-exports for convenience
pub use config::ReplicationConfig;
pub use controller::ReplicationController;
pub use destination::{DestinationResolver, ReplicationDestination, ReplicationStrategy};
pub use error::{ReplicationError, Result};
pub use etag::Etag;
pub use failure::FailureLedger;
pub use heartbeat::HeartbeatTable;
pub use peer_client::{PeerClient, PeerTransport, SourceReplicationInformation};
pub use stats::{DestinationStats, DestinationStatsTable};
pub use work::WorkContext;
