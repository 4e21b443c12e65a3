pub mod http;
pub mod tunnel;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{AgentError, Result};
use crate::instructions::ExecutionResult;

/// A C2 transport. One instance per protocol; the upstream destination
/// address is the only mutable piece and is set by the channel manager (or a
/// tunnel) before use.
#[async_trait]
pub trait Contact: Send + Sync {
    /// Performs one beacon round-trip. `None` on any transport failure.
    async fn get_beacon_bytes(&self, profile: &Value) -> Option<Vec<u8>>;

    /// Fetches payload bytes and the server-side filename. Empty bytes
    /// signal failure.
    async fn get_payload_bytes(&self, profile: &Value, payload: &str) -> (Vec<u8>, String);

    /// Fire-and-forget result delivery; errors are logged only.
    async fn send_execution_results(&self, profile: &Value, result: &ExecutionResult);

    async fn upload_file_bytes(&self, profile: &Value, upload_name: &str, data: &[u8])
        -> Result<()>;

    /// Pure predicate: can this contact serve the given profile? May return
    /// profile modifications (e.g. a server-issued paw) for the agent to
    /// apply on acceptance.
    fn c2_requirements_met(
        &self,
        profile: &Value,
        config: &ContactConfig,
    ) -> (bool, Option<HashMap<String, String>>);

    fn set_upstream_dest_addr(&self, addr: &str);

    fn get_name(&self) -> String;
}

/// Channel setup parameters handed to `c2_requirements_met`.
#[derive(Debug, Clone, Default)]
pub struct ContactConfig {
    pub protocol: String,
    pub server_addr: String,
    pub upstream_dest_addr: String,
    pub key: String,
    pub http_proxy_gateway: String,
}

impl ContactConfig {
    pub fn new(server: &str, protocol: &str, key: &str, http_proxy_gateway: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            server_addr: server.to_string(),
            upstream_dest_addr: server.to_string(),
            key: key.to_string(),
            http_proxy_gateway: http_proxy_gateway.to_string(),
        }
    }
}

/// Name-keyed inventory of contacts, built at startup and handed to the
/// agent constructor.
#[derive(Default, Clone)]
pub struct ContactRegistry {
    contacts: HashMap<String, Arc<dyn Contact>>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // HTTP is the canonical default and is always present.
    pub fn with_defaults(http_proxy_gateway: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http::HttpContact::new(http_proxy_gateway)));
        registry
    }

    pub fn register(&mut self, contact: Arc<dyn Contact>) {
        self.contacts.insert(contact.get_name(), contact);
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Contact>> {
        self.contacts
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::ContactUnknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contacts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Contact>)> {
        self.contacts.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
