// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote operations against peer endpoints.
//!
//! [`PeerClient`] is a thin wrapper over an HTTP transport providing the
//! five remote operations of the replication protocol:
//!
//! | Operation | Request |
//! |---|---|
//! | negotiate | `GET /replication/lastEtag?from=…&currentEtag=…&dbid=…` |
//! | cursor bump | `PUT /replication/lastEtag?from=…&dbid=…[&docEtag=…][&attachmentEtag=…]` |
//! | documents | `POST /replication/replicateDocs?from=…&dbid=…&count=…` (JSON array) |
//! | attachments | `POST /replication/replicateAttachments?from=…&dbid=…` (BSON array) |
//! | heartbeat | `POST /replication/heartbeat?from=…&dbid=…` |
//!
//! A 400 or 404 during negotiation means replication is not enabled on the
//! peer; that is a normal, typed outcome ([`NegotiateOutcome::NotEnabled`]),
//! not an error path. Every other HTTP failure is transient: the body is
//! parsed best-effort for a structured `{ "Error": "…" }` message.
//!
//! The transport is a narrow trait so tests can script peers in memory;
//! [`HttpTransport`] is the production implementation.

use crate::config::HttpConfig;
use crate::destination::{Credentials, ReplicationStrategy};
use crate::error::{ReplicationError, Result};
use crate::etag::Etag;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Type alias for boxed async futures (keeps the trait object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the peer reports about our replication state during negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReplicationInformation {
    /// Last document etag of ours the peer acknowledged.
    #[serde(rename = "LastDocumentEtag", default)]
    pub last_document_etag: Etag,
    /// Last attachment etag of ours the peer acknowledged.
    #[serde(rename = "LastAttachmentEtag", default)]
    pub last_attachment_etag: Etag,
    /// The peer's server instance id; used to suppress echoes.
    #[serde(rename = "ServerInstanceId", default)]
    pub server_instance_id: String,
    /// How the peer refers to us.
    #[serde(rename = "Source", default)]
    pub source: Option<String>,
}

/// Outcome of the negotiation call.
#[derive(Debug)]
pub enum NegotiateOutcome {
    /// The peer answered with its view of our cursors.
    Info(SourceReplicationInformation),
    /// The peer answered 400/404: replication is not enabled there.
    NotEnabled { status: u16 },
}

/// HTTP method for a peer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMethod {
    Get,
    Put,
    Post,
}

/// Request body kind.
#[derive(Debug, Clone)]
pub enum PeerBody {
    Empty,
    Json(Value),
    Bson(Vec<u8>),
}

/// One request for the transport to execute.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub method: PeerMethod,
    pub url: String,
    pub body: PeerBody,
    pub credentials: Option<Credentials>,
    pub api_key: Option<String>,
}

/// Raw response from the transport.
#[derive(Debug, Clone)]
pub struct PeerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl PeerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes peer requests. Network-level failures come back as
/// [`ReplicationError::PeerUnreachable`]; HTTP status handling belongs to
/// the [`PeerClient`].
pub trait PeerTransport: Send + Sync + 'static {
    fn execute(&self, request: PeerRequest) -> BoxFuture<'_, Result<PeerResponse>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Production transport
// ─────────────────────────────────────────────────────────────────────────────

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .connect_timeout(config.connect_timeout_duration())
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl PeerTransport for HttpTransport {
    fn execute(&self, request: PeerRequest) -> BoxFuture<'_, Result<PeerResponse>> {
        Box::pin(async move {
            let mut builder = match request.method {
                PeerMethod::Get => self.client.get(&request.url),
                PeerMethod::Put => self.client.put(&request.url),
                PeerMethod::Post => self.client.post(&request.url),
            };

            if let Some(credentials) = &request.credentials {
                let username = match &credentials.domain {
                    Some(domain) => format!("{}\\{}", domain, credentials.username),
                    None => credentials.username.clone(),
                };
                builder = builder.basic_auth(username, Some(credentials.password.clone()));
            }
            if let Some(api_key) = &request.api_key {
                builder = builder.header("Api-Key", api_key);
            }

            builder = match request.body {
                PeerBody::Empty => builder,
                PeerBody::Json(value) => builder.json(&value),
                PeerBody::Bson(bytes) => builder
                    .header("Content-Type", "application/bson")
                    .body(bytes),
            };

            let response = builder.send().await.map_err(|e| {
                ReplicationError::PeerUnreachable {
                    url: request.url.clone(),
                    message: e.to_string(),
                }
            })?;

            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .unwrap_or_default();
            Ok(PeerResponse { status, body })
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer client
// ─────────────────────────────────────────────────────────────────────────────

/// The replication protocol client for one local database, shared by all
/// destination workers.
pub struct PeerClient {
    transport: Arc<dyn PeerTransport>,
    local_url: String,
    database_id: String,
    shutdown: watch::Receiver<bool>,
}

impl PeerClient {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        local_url: &str,
        database_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            local_url: local_url.to_string(),
            database_id: database_id.to_string(),
            shutdown,
        }
    }

    /// Ask the peer for the last etags it acknowledged from us.
    ///
    /// `current_etag` is our local head, sent so the peer can spot a
    /// source that was restored from backup.
    pub async fn get_last_etag(
        &self,
        strategy: &ReplicationStrategy,
        current_etag: Etag,
    ) -> Result<NegotiateOutcome> {
        let url = format!(
            "{}/replication/lastEtag?from={}&currentEtag={}&dbid={}",
            strategy.url(),
            query_encode(&self.local_url),
            current_etag,
            self.database_id
        );
        let response = self
            .execute(request(PeerMethod::Get, url.clone(), PeerBody::Empty, strategy))
            .await?;

        if response.status == 400 || response.status == 404 {
            debug!(url = %strategy.url(), status = response.status, "Replication not enabled on peer");
            return Ok(NegotiateOutcome::NotEnabled {
                status: response.status,
            });
        }
        if !response.is_success() {
            return Err(self.peer_error(strategy, &response));
        }

        let info: SourceReplicationInformation = serde_json::from_slice(&response.body)
            .map_err(|e| ReplicationError::Peer {
                url: strategy.url().to_string(),
                status: response.status,
                message: format!("malformed negotiation response: {}", e),
            })?;
        Ok(NegotiateOutcome::Info(info))
    }

    /// Advance the peer's cursors without shipping data.
    pub async fn put_last_etag(
        &self,
        strategy: &ReplicationStrategy,
        doc_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<()> {
        let mut url = format!(
            "{}/replication/lastEtag?from={}&dbid={}",
            strategy.url(),
            query_encode(&self.local_url),
            self.database_id
        );
        if let Some(etag) = doc_etag {
            url.push_str(&format!("&docEtag={}", etag));
        }
        if let Some(etag) = attachment_etag {
            url.push_str(&format!("&attachmentEtag={}", etag));
        }
        let response = self
            .execute(request(PeerMethod::Put, url, PeerBody::Empty, strategy))
            .await?;
        if !response.is_success() {
            return Err(self.peer_error(strategy, &response));
        }
        Ok(())
    }

    /// Ship a document batch.
    pub async fn send_documents(
        &self,
        strategy: &ReplicationStrategy,
        documents: &[Value],
    ) -> Result<()> {
        let url = format!(
            "{}/replication/replicateDocs?from={}&dbid={}&count={}",
            strategy.url(),
            query_encode(&self.local_url),
            self.database_id,
            documents.len()
        );
        let response = self
            .execute(request(
                PeerMethod::Post,
                url,
                PeerBody::Json(Value::Array(documents.to_vec())),
                strategy,
            ))
            .await?;
        if !response.is_success() {
            return Err(self.peer_error(strategy, &response));
        }
        Ok(())
    }

    /// Ship an attachment batch.
    ///
    /// The wire body is a root-level BSON array: a document whose element
    /// keys are the array indices.
    pub async fn send_attachments(
        &self,
        strategy: &ReplicationStrategy,
        attachments: Vec<bson::Document>,
    ) -> Result<()> {
        let mut root = bson::Document::new();
        for (index, doc) in attachments.into_iter().enumerate() {
            root.insert(index.to_string(), doc);
        }
        let mut bytes = Vec::new();
        root.to_writer(&mut bytes).map_err(|e| ReplicationError::Peer {
            url: strategy.url().to_string(),
            status: 0,
            message: format!("failed to encode attachment batch: {}", e),
        })?;

        let url = format!(
            "{}/replication/replicateAttachments?from={}&dbid={}",
            strategy.url(),
            query_encode(&self.local_url),
            self.database_id
        );
        let response = self
            .execute(request(PeerMethod::Post, url, PeerBody::Bson(bytes), strategy))
            .await?;
        if !response.is_success() {
            return Err(self.peer_error(strategy, &response));
        }
        Ok(())
    }

    /// Announce ourselves to a peer. Failures are the caller's to log;
    /// heartbeats never gate anything.
    pub async fn heartbeat(&self, peer_url: &str) -> Result<()> {
        let url = format!(
            "{}/replication/heartbeat?from={}&dbid={}",
            peer_url.trim_end_matches('/'),
            query_encode(&self.local_url),
            self.database_id
        );
        let response = self
            .execute(PeerRequest {
                method: PeerMethod::Post,
                url,
                body: PeerBody::Empty,
                credentials: None,
                api_key: None,
            })
            .await?;
        if !response.is_success() {
            return Err(ReplicationError::Peer {
                url: peer_url.to_string(),
                status: response.status,
                message: parse_error_body(&response.body)
                    .unwrap_or_else(|| status_description(response.status)),
            });
        }
        Ok(())
    }

    /// Execute with cancellation: shutdown observed mid-flight surfaces as
    /// [`ReplicationError::Cancelled`] instead of a peer failure.
    async fn execute(&self, request: PeerRequest) -> Result<PeerResponse> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(ReplicationError::Cancelled);
        }
        tokio::select! {
            result = self.transport.execute(request) => result,
            _ = shutdown.changed() => Err(ReplicationError::Cancelled),
        }
    }

    fn peer_error(&self, strategy: &ReplicationStrategy, response: &PeerResponse) -> ReplicationError {
        let message = parse_error_body(&response.body)
            .unwrap_or_else(|| status_description(response.status));
        warn!(url = %strategy.url(), status = response.status, message = %message, "Peer request failed");
        ReplicationError::Peer {
            url: strategy.url().to_string(),
            status: response.status,
            message,
        }
    }
}

fn request(
    method: PeerMethod,
    url: String,
    body: PeerBody,
    strategy: &ReplicationStrategy,
) -> PeerRequest {
    PeerRequest {
        method,
        url,
        body,
        credentials: strategy.credentials(),
        api_key: strategy.destination.api_key.clone(),
    }
}

/// Best-effort parse of a structured `{ "Error": "…" }` body.
fn parse_error_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("Error").and_then(Value::as_str).map(str::to_string)
}

fn status_description(status: u16) -> String {
    match status {
        500 => "internal server error".to_string(),
        502 => "bad gateway".to_string(),
        503 => "service unavailable".to_string(),
        504 => "gateway timeout".to_string(),
        other => format!("HTTP {}", other),
    }
}

fn query_encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::ReplicationDestination;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted transport: records requests, pops responses front-first.
    struct ScriptedTransport {
        requests: Mutex<Vec<PeerRequest>>,
        responses: Mutex<Vec<Result<PeerResponse>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<PeerResponse>>) -> Self {
            Self {
                requests: Mutex::new(vec![]),
                responses: Mutex::new(responses),
            }
        }

        fn requests(&self) -> Vec<PeerRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl PeerTransport for ScriptedTransport {
        fn execute(&self, request: PeerRequest) -> BoxFuture<'_, Result<PeerResponse>> {
            self.requests.lock().unwrap().push(request);
            let response = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    Ok(PeerResponse {
                        status: 200,
                        body: vec![],
                    })
                } else {
                    responses.remove(0)
                }
            };
            Box::pin(async move { response })
        }
    }

    fn ok(status: u16, body: &str) -> Result<PeerResponse> {
        Ok(PeerResponse {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    fn strategy() -> ReplicationStrategy {
        ReplicationStrategy::from_destination(
            ReplicationDestination {
                url: "http://peer:8080".to_string(),
                ..Default::default()
            },
            "local-db",
        )
        .unwrap()
    }

    fn client(transport: Arc<ScriptedTransport>) -> (PeerClient, watch::Sender<bool>) {
        // The sender must outlive the client: a dropped shutdown channel
        // reads as cancellation.
        let (tx, rx) = watch::channel(false);
        (
            PeerClient::new(transport, "http://local:9090", "local-db", rx),
            tx,
        )
    }

    #[tokio::test]
    async fn test_negotiate_parses_info() {
        let body = json!({
            "LastDocumentEtag": Etag::from_parts(0, 5).to_string(),
            "LastAttachmentEtag": Etag::ZERO.to_string(),
            "ServerInstanceId": "dest-1",
            "Source": "http://local:9090"
        })
        .to_string();
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, &body)]));
        let (client, _shutdown) = client(transport.clone());

        let outcome = client
            .get_last_etag(&strategy(), Etag::from_parts(0, 9))
            .await
            .unwrap();
        match outcome {
            NegotiateOutcome::Info(info) => {
                assert_eq!(info.last_document_etag, Etag::from_parts(0, 5));
                assert_eq!(info.server_instance_id, "dest-1");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.starts_with("http://peer:8080/replication/lastEtag?"));
        assert!(requests[0].url.contains("currentEtag="));
        assert!(requests[0].url.contains("dbid=local-db"));
    }

    #[tokio::test]
    async fn test_negotiate_400_is_typed_outcome() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(404, "")]));
        let (client, _shutdown) = client(transport);
        let outcome = client.get_last_etag(&strategy(), Etag::ZERO).await.unwrap();
        assert!(matches!(outcome, NegotiateOutcome::NotEnabled { status: 404 }));
    }

    #[tokio::test]
    async fn test_negotiate_other_error_parses_body() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            500,
            r#"{"Error": "esent cache full"}"#,
        )]));
        let (client, _shutdown) = client(transport);
        let err = client.get_last_etag(&strategy(), Etag::ZERO).await.unwrap_err();
        match err {
            ReplicationError::Peer { status, message, .. } => {
                assert_eq!(status, 500);
                assert_eq!(message, "esent cache full");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_documents_count_and_body() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, "")]));
        let (client, _shutdown) = client(transport.clone());
        let docs = vec![json!({"@metadata": {"@id": "users/1"}})];
        client.send_documents(&strategy(), &docs).await.unwrap();

        let requests = transport.requests();
        assert!(requests[0].url.contains("/replication/replicateDocs?"));
        assert!(requests[0].url.contains("count=1"));
        match &requests[0].body {
            PeerBody::Json(Value::Array(items)) => assert_eq!(items.len(), 1),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_put_last_etag_params() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, "")]));
        let (client, _shutdown) = client(transport.clone());
        client
            .put_last_etag(&strategy(), Some(Etag::from_parts(0, 20)), None)
            .await
            .unwrap();

        let url = &transport.requests()[0].url;
        assert!(url.contains("docEtag="));
        assert!(!url.contains("attachmentEtag="));
        assert_eq!(transport.requests()[0].method, PeerMethod::Put);
    }

    #[tokio::test]
    async fn test_send_attachments_bson_root_array() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, "")]));
        let (client, _shutdown) = client(transport.clone());
        let attachment = bson::doc! {
            "@id": "images/1",
            "@etag": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![0u8; 16] },
            "data": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![1, 2, 3] },
        };
        client
            .send_attachments(&strategy(), vec![attachment])
            .await
            .unwrap();

        let requests = transport.requests();
        assert!(requests[0].url.contains("/replication/replicateAttachments?"));
        let bytes = match &requests[0].body {
            PeerBody::Bson(bytes) => bytes.clone(),
            other => panic!("unexpected body: {:?}", other),
        };
        let decoded = bson::Document::from_reader(&mut bytes.as_slice()).unwrap();
        let first = decoded.get_document("0").unwrap();
        assert_eq!(first.get_str("@id").unwrap(), "images/1");
    }

    #[tokio::test]
    async fn test_heartbeat_url() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, "")]));
        let (client, _shutdown) = client(transport.clone());
        client.heartbeat("http://peer:8080/").await.unwrap();
        let url = &transport.requests()[0].url;
        assert!(url.starts_with("http://peer:8080/replication/heartbeat?"));
        assert!(url.contains("from=http%3A%2F%2Flocal%3A9090"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_call() {
        struct NeverTransport;
        impl PeerTransport for NeverTransport {
            fn execute(&self, _request: PeerRequest) -> BoxFuture<'_, Result<PeerResponse>> {
                Box::pin(async {
                    std::future::pending::<()>().await;
                    unreachable!()
                })
            }
        }

        let (tx, rx) = watch::channel(false);
        let client = PeerClient::new(Arc::new(NeverTransport), "http://local:9090", "db", rx);

        let handle = tokio::spawn(async move {
            client.heartbeat("http://peer:8080").await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicationError::Cancelled));
    }

    #[tokio::test]
    async fn test_transport_network_error_is_unreachable() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            ReplicationError::PeerUnreachable {
                url: "http://peer:8080".to_string(),
                message: "connection refused".to_string(),
            },
        )]));
        let (client, _shutdown) = client(transport);
        let err = client.send_documents(&strategy(), &[]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::PeerUnreachable { .. }));
        assert!(err.is_transient());
    }
}
