//! Simulated peer endpoints for integration tests.
//!
//! Implements [`PeerTransport`] over an in-memory map of peers that
//! behave like real receiving nodes: they remember the last etags they
//! acknowledged, answer negotiation from that state, and advance their
//! cursors when batches arrive. Failures can be scripted per peer.

use outbound_replication::error::{ReplicationError, Result};
use outbound_replication::etag::Etag;
use outbound_replication::peer_client::{
    BoxFuture, PeerBody, PeerMethod, PeerRequest, PeerResponse, PeerTransport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct PeerState {
    last_document_etag: Etag,
    last_attachment_etag: Etag,
    server_instance_id: String,
    not_enabled: bool,
    /// Scripted failures for the next send operations: (status, body).
    fail_sends: Vec<(u16, String)>,
    /// Fail everything at the network level.
    unreachable: bool,
    received_documents: Vec<Value>,
    document_batches: Vec<usize>,
    attachment_batches: Vec<usize>,
    heartbeats: usize,
    requests: Vec<String>,
}

/// All simulated peers, keyed by base URL.
#[derive(Default)]
pub struct SimulatedPeers {
    peers: Mutex<HashMap<String, PeerState>>,
}

impl SimulatedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, url: &str, server_instance_id: &str) {
        self.peers.lock().unwrap().insert(
            url.to_string(),
            PeerState {
                server_instance_id: server_instance_id.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn set_not_enabled(&self, url: &str, not_enabled: bool) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(url) {
            peer.not_enabled = not_enabled;
        }
    }

    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(url) {
            peer.unreachable = unreachable;
        }
    }

    /// Script the next `count` send operations to fail with `status`.
    pub fn fail_sends(&self, url: &str, count: usize, status: u16, body: &str) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(url) {
            for _ in 0..count {
                peer.fail_sends.push((status, body.to_string()));
            }
        }
    }

    pub fn last_document_etag(&self, url: &str) -> Etag {
        self.peers.lock().unwrap()[url].last_document_etag
    }

    pub fn last_attachment_etag(&self, url: &str) -> Etag {
        self.peers.lock().unwrap()[url].last_attachment_etag
    }

    pub fn received_documents(&self, url: &str) -> Vec<Value> {
        self.peers.lock().unwrap()[url].received_documents.clone()
    }

    pub fn document_batches(&self, url: &str) -> Vec<usize> {
        self.peers.lock().unwrap()[url].document_batches.clone()
    }

    pub fn attachment_batches(&self, url: &str) -> Vec<usize> {
        self.peers.lock().unwrap()[url].attachment_batches.clone()
    }

    pub fn heartbeat_count(&self, url: &str) -> usize {
        self.peers.lock().unwrap()[url].heartbeats
    }

    pub fn request_count(&self, url: &str, path_part: &str) -> usize {
        self.peers.lock().unwrap()[url]
            .requests
            .iter()
            .filter(|r| r.contains(path_part))
            .count()
    }

    fn handle(&self, request: &PeerRequest) -> Result<PeerResponse> {
        let mut peers = self.peers.lock().unwrap();
        let url = request.url.clone();
        let peer = peers
            .iter_mut()
            .find(|(base, _)| url.starts_with(base.as_str()))
            .map(|(_, state)| state);
        let peer = match peer {
            Some(peer) => peer,
            None => {
                return Err(ReplicationError::PeerUnreachable {
                    url,
                    message: "no such host".to_string(),
                })
            }
        };
        peer.requests.push(url.clone());

        if peer.unreachable {
            return Err(ReplicationError::PeerUnreachable {
                url,
                message: "connection refused".to_string(),
            });
        }

        if url.contains("/replication/heartbeat") {
            peer.heartbeats += 1;
            return Ok(ok_empty());
        }

        if url.contains("/replication/lastEtag") {
            if request.method == PeerMethod::Get {
                if peer.not_enabled {
                    return Ok(PeerResponse {
                        status: 404,
                        body: vec![],
                    });
                }
                let body = json!({
                    "LastDocumentEtag": peer.last_document_etag.to_string(),
                    "LastAttachmentEtag": peer.last_attachment_etag.to_string(),
                    "ServerInstanceId": peer.server_instance_id,
                })
                .to_string();
                return Ok(PeerResponse {
                    status: 200,
                    body: body.into_bytes(),
                });
            }
            // PUT: cursor bump
            if let Some(etag) = query_etag(&url, "docEtag") {
                peer.last_document_etag = etag;
            }
            if let Some(etag) = query_etag(&url, "attachmentEtag") {
                peer.last_attachment_etag = etag;
            }
            return Ok(ok_empty());
        }

        if url.contains("/replication/replicateDocs") {
            if let Some((status, body)) = pop_failure(&mut peer.fail_sends) {
                return Ok(PeerResponse {
                    status,
                    body: body.into_bytes(),
                });
            }
            let docs = match &request.body {
                PeerBody::Json(Value::Array(items)) => items.clone(),
                other => panic!("replicateDocs expects a JSON array, got {:?}", other),
            };
            for doc in &docs {
                if let Some(etag) = doc["@metadata"]["@etag"]
                    .as_str()
                    .and_then(Etag::parse)
                {
                    if etag > peer.last_document_etag {
                        peer.last_document_etag = etag;
                    }
                }
            }
            peer.document_batches.push(docs.len());
            peer.received_documents.extend(docs);
            return Ok(ok_empty());
        }

        if url.contains("/replication/replicateAttachments") {
            if let Some((status, body)) = pop_failure(&mut peer.fail_sends) {
                return Ok(PeerResponse {
                    status,
                    body: body.into_bytes(),
                });
            }
            let bytes = match &request.body {
                PeerBody::Bson(bytes) => bytes.clone(),
                other => panic!("replicateAttachments expects BSON, got {:?}", other),
            };
            let root = bson::Document::from_reader(&mut bytes.as_slice())
                .expect("attachment body is valid BSON");
            let mut count = 0;
            for (_, entry) in root.iter() {
                let entry = entry
                    .as_document()
                    .expect("attachment entries are documents");
                count += 1;
                if let Ok(binary) = entry.get_binary_generic("@etag") {
                    if binary.len() == 16 {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(binary);
                        let etag = Etag::from_bytes(bytes);
                        if etag > peer.last_attachment_etag {
                            peer.last_attachment_etag = etag;
                        }
                    }
                }
            }
            peer.attachment_batches.push(count);
            return Ok(ok_empty());
        }

        Ok(PeerResponse {
            status: 404,
            body: vec![],
        })
    }
}

impl PeerTransport for SimulatedPeers {
    fn execute(&self, request: PeerRequest) -> BoxFuture<'_, Result<PeerResponse>> {
        let result = self.handle(&request);
        Box::pin(async move { result })
    }
}

fn ok_empty() -> PeerResponse {
    PeerResponse {
        status: 200,
        body: vec![],
    }
}

fn pop_failure(queue: &mut Vec<(u16, String)>) -> Option<(u16, String)> {
    if queue.is_empty() {
        None
    } else {
        Some(queue.remove(0))
    }
}

fn query_etag(url: &str, param: &str) -> Option<Etag> {
    let marker = format!("{}=", param);
    let start = url.find(&marker)? + marker.len();
    let rest = &url[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    Etag::parse(&rest[..end])
}
