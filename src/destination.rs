// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination configuration and per-destination send strategies.
//!
//! The set of destinations is configuration-as-data: a document in the
//! local store, re-read on every controller tick, so operators can add or
//! remove peers at runtime. Each entry resolves to a
//! [`ReplicationStrategy`] carrying the effective URL, credentials, and
//! the filter rules that decide what is sent there.

use crate::alerts::{Alert, AlertSink};
use crate::document::{
    is_system_document_id, AttachmentInformation, METADATA_REPLICATION_CONFLICT,
    METADATA_REPLICATION_SOURCE,
};
use crate::error::{ReplicationError, Result};
use crate::storage::{DocumentStore, DESTINATIONS_DOC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether documents that originated on a third node are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransitiveReplicationBehavior {
    /// Only documents first written locally travel to this destination.
    #[default]
    None,
    /// Documents received from other peers are forwarded too.
    Replicate,
}

/// One destination entry as stored in the destinations document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationDestination {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Database", default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(rename = "ApiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(rename = "Username", default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "Password", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "Domain", default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "TransitiveReplicationBehavior", default)]
    pub transitive_behavior: TransitiveReplicationBehavior,
    #[serde(rename = "Disabled", default)]
    pub disabled: bool,
    #[serde(
        rename = "ClientVisibleUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_visible_url: Option<String>,
}

/// The destinations configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationDestinationsDoc {
    #[serde(rename = "Source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "Destinations", default)]
    pub destinations: Vec<ReplicationDestination>,
}

/// Basic credentials for a destination.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

/// A resolved destination: effective URL plus the rules governing what is
/// sent there. Ephemeral - rebuilt on every controller tick.
#[derive(Debug, Clone)]
pub struct ReplicationStrategy {
    pub destination: ReplicationDestination,
    /// Effective base URL, including the `/databases/{name}` segment when
    /// the entry targets a named database.
    url: String,
    /// The local database id; documents whose recorded source is neither
    /// this nor absent are third-party and subject to transitivity rules.
    pub current_database_id: String,
}

impl ReplicationStrategy {
    /// Build a strategy from a destination entry.
    pub fn from_destination(
        destination: ReplicationDestination,
        local_database_id: &str,
    ) -> Result<Self> {
        let root = destination.url.trim_end_matches('/');
        if root.is_empty() {
            return Err(ReplicationError::BadDestination(
                "destination has an empty url".to_string(),
            ));
        }
        let url = match &destination.database {
            Some(db) if !db.is_empty() => format!("{}/databases/{}", root, db),
            _ => root.to_string(),
        };
        Ok(Self {
            destination,
            url,
            current_database_id: local_database_id.to_string(),
        })
    }

    /// The effective base URL for peer operations.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Credentials for the transport, when the entry carries any.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.destination.username, &self.destination.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
                domain: self.destination.domain.clone(),
            }),
            _ => None,
        }
    }

    /// True when the metadata says the item was first written on the
    /// destination itself - sending it back would ping-pong.
    pub fn origins_from_destination(&self, destination_id: &str, metadata: &Value) -> bool {
        metadata
            .get(METADATA_REPLICATION_SOURCE)
            .and_then(Value::as_str)
            .map(|source| source == destination_id)
            .unwrap_or(false)
    }

    /// True for keys in the system namespace.
    pub fn is_system_document_id(&self, key: &str) -> bool {
        is_system_document_id(key)
    }

    /// Decide whether a document travels to this destination.
    ///
    /// `destination_id` is the remote server instance id learned during
    /// negotiation.
    pub fn filter_documents(&self, destination_id: &str, key: &str, metadata: &Value) -> bool {
        if self.is_system_document_id(key) {
            return false;
        }
        if metadata
            .get(METADATA_REPLICATION_CONFLICT)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return false;
        }
        if self.origins_from_destination(destination_id, metadata) {
            return false;
        }
        if self.destination.transitive_behavior == TransitiveReplicationBehavior::None {
            if let Some(source) = metadata.get(METADATA_REPLICATION_SOURCE).and_then(Value::as_str) {
                if source != self.current_database_id {
                    return false;
                }
            }
        }
        true
    }

    /// Decide whether an attachment travels to this destination.
    pub fn filter_attachments(&self, attachment: &AttachmentInformation, destination_id: &str) -> bool {
        if self.origins_from_destination(destination_id, &attachment.metadata) {
            return false;
        }
        if self.destination.transitive_behavior == TransitiveReplicationBehavior::None {
            if let Some(source) = attachment.replication_source() {
                if source != self.current_database_id {
                    return false;
                }
            }
        }
        true
    }
}

/// Reads the destinations document and resolves it into strategies.
pub struct DestinationResolver {
    store: Arc<dyn DocumentStore>,
    local_database_id: String,
    alerts: Arc<dyn AlertSink>,
    /// Set once the misconfiguration alert fired; cleared when the
    /// document is healthy again.
    misconfiguration_alerted: AtomicBool,
}

impl DestinationResolver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        local_database_id: &str,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            local_database_id: local_database_id.to_string(),
            alerts,
            misconfiguration_alerted: AtomicBool::new(false),
        }
    }

    /// Resolve the current destination set.
    ///
    /// Misconfiguration (foreign `Source`) yields an empty set and a
    /// one-shot alert; individual bad entries are logged and skipped.
    pub fn resolve(&self) -> Vec<ReplicationStrategy> {
        let doc = match self.store.get(DESTINATIONS_DOC) {
            Ok(Some(doc)) => doc,
            Ok(None) => return vec![],
            Err(e) => {
                warn!(error = %e, "Failed to read destinations document");
                return vec![];
            }
        };

        let parsed: ReplicationDestinationsDoc = match serde_json::from_value(doc.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Destinations document is malformed");
                return vec![];
            }
        };

        if let Some(source) = &parsed.source {
            if source != &self.local_database_id {
                if !self.misconfiguration_alerted.swap(true, Ordering::AcqRel) {
                    self.alerts.add(Alert::new(
                        "Replication source mismatch",
                        format!(
                            "Replication destinations document belongs to database {} but this database is {}; replication is suspended until the document is corrected",
                            source, self.local_database_id
                        ),
                        "Replication/SourceMismatch",
                    ));
                }
                return vec![];
            }
        }
        // Healthy document: a later mismatch should alert again
        self.misconfiguration_alerted.store(false, Ordering::Release);

        let mut strategies = Vec::with_capacity(parsed.destinations.len());
        for destination in parsed.destinations {
            if destination.disabled {
                debug!(url = %destination.url, "Skipping disabled destination");
                continue;
            }
            match ReplicationStrategy::from_destination(destination, &self.local_database_id) {
                Ok(strategy) => strategies.push(strategy),
                Err(e) => warn!(error = %e, "Skipping destination entry"),
            }
        }
        strategies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests_support::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingAlerts {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingAlerts {
        fn new() -> Self {
            Self {
                alerts: Mutex::new(vec![]),
            }
        }

        fn count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    impl AlertSink for RecordingAlerts {
        fn add(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    fn destinations_doc(source: &str, urls: &[&str]) -> Value {
        json!({
            "Source": source,
            "Destinations": urls.iter().map(|u| json!({"Url": u})).collect::<Vec<_>>()
        })
    }

    fn strategy(url: &str) -> ReplicationStrategy {
        ReplicationStrategy::from_destination(
            ReplicationDestination {
                url: url.to_string(),
                ..Default::default()
            },
            "local-db",
        )
        .unwrap()
    }

    #[test]
    fn test_url_with_database_segment() {
        let s = ReplicationStrategy::from_destination(
            ReplicationDestination {
                url: "http://peer:8080/".to_string(),
                database: Some("north".to_string()),
                ..Default::default()
            },
            "local-db",
        )
        .unwrap();
        assert_eq!(s.url(), "http://peer:8080/databases/north");
    }

    #[test]
    fn test_empty_url_is_bad_entry() {
        let err = ReplicationStrategy::from_destination(
            ReplicationDestination::default(),
            "local-db",
        )
        .unwrap_err();
        assert!(matches!(err, ReplicationError::BadDestination(_)));
    }

    #[test]
    fn test_filter_rejects_system_documents() {
        let s = strategy("http://peer:8080");
        assert!(!s.filter_documents("dest-1", "Raven/Replication/Destinations", &json!({})));
        assert!(s.filter_documents("dest-1", "users/1", &json!({})));
    }

    #[test]
    fn test_filter_rejects_echoes() {
        let s = strategy("http://peer:8080");
        let metadata = json!({ METADATA_REPLICATION_SOURCE: "dest-1" });
        assert!(!s.filter_documents("dest-1", "users/1", &metadata));
    }

    #[test]
    fn test_filter_rejects_third_party_without_transitive() {
        let s = strategy("http://peer:8080");
        let metadata = json!({ METADATA_REPLICATION_SOURCE: "some-other-db" });
        assert!(!s.filter_documents("dest-1", "users/1", &metadata));

        // Locally originated documents always pass
        let local = json!({ METADATA_REPLICATION_SOURCE: "local-db" });
        assert!(s.filter_documents("dest-1", "users/1", &local));
    }

    #[test]
    fn test_filter_forwards_third_party_with_transitive() {
        let s = ReplicationStrategy::from_destination(
            ReplicationDestination {
                url: "http://peer:8080".to_string(),
                transitive_behavior: TransitiveReplicationBehavior::Replicate,
                ..Default::default()
            },
            "local-db",
        )
        .unwrap();
        let metadata = json!({ METADATA_REPLICATION_SOURCE: "some-other-db" });
        assert!(s.filter_documents("dest-1", "users/1", &metadata));
        // Echo suppression still applies
        let echo = json!({ METADATA_REPLICATION_SOURCE: "dest-1" });
        assert!(!s.filter_documents("dest-1", "users/1", &echo));
    }

    #[test]
    fn test_filter_rejects_conflict_artifacts() {
        let s = strategy("http://peer:8080");
        let metadata = json!({ METADATA_REPLICATION_CONFLICT: true });
        assert!(!s.filter_documents("dest-1", "users/1", &metadata));
    }

    #[test]
    fn test_filter_attachments_source_rules() {
        let s = strategy("http://peer:8080");
        let local = AttachmentInformation {
            key: "images/1".to_string(),
            etag: crate::etag::Etag::from_parts(0, 1),
            metadata: json!({}),
            size: 10,
        };
        assert!(s.filter_attachments(&local, "dest-1"));

        let echoed = AttachmentInformation {
            metadata: json!({ METADATA_REPLICATION_SOURCE: "dest-1" }),
            ..local.clone()
        };
        assert!(!s.filter_attachments(&echoed, "dest-1"));
    }

    #[test]
    fn test_resolver_missing_doc_is_empty() {
        let store = Arc::new(MemoryStore::default());
        let alerts = Arc::new(RecordingAlerts::new());
        let resolver = DestinationResolver::new(store, "local-db", alerts.clone());
        assert!(resolver.resolve().is_empty());
        assert_eq!(alerts.count(), 0);
    }

    #[test]
    fn test_resolver_reads_and_skips_disabled() {
        let store = Arc::new(MemoryStore::default());
        store
            .put(
                DESTINATIONS_DOC,
                None,
                json!({
                    "Source": "local-db",
                    "Destinations": [
                        {"Url": "http://a:8080"},
                        {"Url": "http://b:8080", "Disabled": true},
                        {"Url": ""}
                    ]
                }),
                json!({}),
            )
            .unwrap();
        let alerts = Arc::new(RecordingAlerts::new());
        let resolver = DestinationResolver::new(store, "local-db", alerts);
        let strategies = resolver.resolve();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].url(), "http://a:8080");
    }

    #[test]
    fn test_resolver_misconfigured_source_alerts_once_and_resets() {
        let store = Arc::new(MemoryStore::default());
        store
            .put(
                DESTINATIONS_DOC,
                None,
                destinations_doc("other-db", &["http://a:8080"]),
                json!({}),
            )
            .unwrap();
        let alerts = Arc::new(RecordingAlerts::new());
        let resolver = DestinationResolver::new(store.clone(), "local-db", alerts.clone());

        assert!(resolver.resolve().is_empty());
        assert!(resolver.resolve().is_empty());
        assert_eq!(alerts.count(), 1, "alert must be one-shot");

        // Correcting the document resets the suppression flag
        store
            .put(
                DESTINATIONS_DOC,
                None,
                destinations_doc("local-db", &["http://a:8080"]),
                json!({}),
            )
            .unwrap();
        assert_eq!(resolver.resolve().len(), 1);

        // Breaking it again raises a fresh alert
        store
            .put(
                DESTINATIONS_DOC,
                None,
                destinations_doc("other-db", &["http://a:8080"]),
                json!({}),
            )
            .unwrap();
        assert!(resolver.resolve().is_empty());
        assert_eq!(alerts.count(), 2);
    }

    #[test]
    fn test_destination_serde_pascal_case() {
        let json_text = r#"{
            "Url": "http://peer:8080",
            "Database": "north",
            "TransitiveReplicationBehavior": "Replicate",
            "Disabled": false
        }"#;
        let dest: ReplicationDestination = serde_json::from_str(json_text).unwrap();
        assert_eq!(dest.url, "http://peer:8080");
        assert_eq!(dest.database.as_deref(), Some("north"));
        assert_eq!(
            dest.transitive_behavior,
            TransitiveReplicationBehavior::Replicate
        );
    }
}
