use log::info;
use tokio::sync::oneshot;

use super::Agent;
use crate::contact::tunnel::TunnelConfig;
use crate::errors::{AgentError, Result};

impl Agent {
    /// Brings up the configured tunnel and reroutes every contact through
    /// its local endpoint. Tunnel failures leave the agent on direct comms.
    pub async fn start_tunnel(&mut self, config: &TunnelConfig) -> Result<()> {
        self.using_tunnel = false;
        let tunnel = self.tunnels.get_by_name(&config.protocol).ok_or_else(|| {
            AgentError::TunnelInit(
                config.protocol.clone(),
                "no tunnel registered for protocol".to_string(),
            )
        })?;
        tunnel
            .initialize(config)
            .map_err(|e| AgentError::TunnelInit(tunnel.get_name(), e.to_string()))?;

        info!("Starting {} tunnel", tunnel.get_name());
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tunnel.clone();
        tokio::spawn(async move { task.run(ready_tx).await });

        match ready_rx.await {
            Ok(true) => {
                let local_addr = tunnel.get_local_addr();
                info!(
                    "{} tunnel ready and listening on {}",
                    tunnel.get_name(),
                    local_addr
                );
                self.route_contacts_through(&local_addr);
                self.tunnel = Some(tunnel);
                self.using_tunnel = true;
                Ok(())
            }
            _ => Err(AgentError::TunnelStart(tunnel.get_name())),
        }
    }

    fn route_contacts_through(&self, addr: &str) {
        for (_, contact) in self.contacts.iter() {
            contact.set_upstream_dest_addr(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::tunnel::{Tunnel, TunnelRegistry};
    use crate::proxy::ReceiverRegistry;
    use crate::testutil::{build_agent_with, default_options, http_registry, MockTunnel};
    use std::sync::Arc;

    fn tunnel_config(protocol: &str) -> TunnelConfig {
        TunnelConfig {
            protocol: protocol.to_string(),
            tunnel_dest: "http://c2:8888".to_string(),
            ..TunnelConfig::default()
        }
    }

    #[tokio::test]
    async fn ready_tunnel_reroutes_every_contact() {
        let (mock, contacts) = http_registry();
        let mut tunnels = TunnelRegistry::new();
        let tunnel = Arc::new(MockTunnel::new("TCP", "http://127.0.0.1:7777", true));
        tunnels.register(tunnel.clone());
        let mut agent = build_agent_with(
            contacts,
            ReceiverRegistry::new(),
            tunnels,
            default_options("http://c2:8888"),
        );

        agent.start_tunnel(&tunnel_config("TCP")).await.unwrap();
        assert!(agent.using_tunnel);
        assert!(*tunnel.initialized.lock().unwrap());
        assert_eq!(
            mock.upstream_addresses().last().unwrap(),
            "http://127.0.0.1:7777"
        );
        assert_eq!(tunnel.get_remote_addr(), "http://c2:8888");
    }

    #[tokio::test]
    async fn unready_tunnel_is_abandoned() {
        let (_, contacts) = http_registry();
        let mut tunnels = TunnelRegistry::new();
        tunnels.register(Arc::new(MockTunnel::new("TCP", "http://127.0.0.1:7777", false)));
        let mut agent = build_agent_with(
            contacts,
            ReceiverRegistry::new(),
            tunnels,
            default_options("http://c2:8888"),
        );

        assert!(matches!(
            agent.start_tunnel(&tunnel_config("TCP")).await,
            Err(AgentError::TunnelStart(_))
        ));
        assert!(!agent.using_tunnel);
    }

    #[tokio::test]
    async fn unknown_tunnel_protocol_is_an_init_error() {
        let (_, contacts) = http_registry();
        let mut agent = build_agent_with(
            contacts,
            ReceiverRegistry::new(),
            TunnelRegistry::new(),
            default_options("http://c2:8888"),
        );

        assert!(matches!(
            agent.start_tunnel(&tunnel_config("SSH")).await,
            Err(AgentError::TunnelInit(_, _))
        ));
    }

    #[tokio::test]
    async fn channels_set_while_tunneled_keep_the_tunnel_route() {
        let (mock, contacts) = http_registry();
        let mut tunnels = TunnelRegistry::new();
        tunnels.register(Arc::new(MockTunnel::new("TCP", "http://127.0.0.1:7777", true)));
        let mut agent = build_agent_with(
            contacts,
            ReceiverRegistry::new(),
            tunnels,
            default_options("http://c2:8888"),
        );

        agent.start_tunnel(&tunnel_config("TCP")).await.unwrap();
        agent.set_initial_comms_channel().await.unwrap();
        // The channel was made current, but routing still points at the
        // tunnel entrance.
        assert_eq!(
            mock.upstream_addresses().last().unwrap(),
            "http://127.0.0.1:7777"
        );
    }
}
