use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

use super::Agent;
use crate::discovery;
use crate::errors::{AgentError, Result};

const RECEIVER_JOIN_DEADLINE_SECS: u64 = 5;

impl Agent {
    /// Starts every registered receiver that accepts the current upstream.
    /// Failures skip the receiver; the agent keeps running.
    pub async fn activate_local_receivers(&mut self) {
        let Some(contact) = self.current_contact() else {
            warn!("No communication channel set; skipping receiver activation");
            return;
        };
        let (barrier_tx, barrier_rx) = mpsc::channel::<()>(1);
        let upstream = self.current_server();
        for (name, receiver) in self.receiver_registry().iter() {
            match receiver
                .initialize(&upstream, contact.clone(), barrier_tx.clone())
                .await
            {
                Ok(()) => {
                    info!("Initialized peer receiver {}", name);
                    let addresses = receiver.get_receiver_addresses();
                    if !addresses.is_empty() {
                        self.local_receiver_addresses
                            .entry(name.clone())
                            .or_default()
                            .extend(addresses);
                    }
                    let task = receiver.clone();
                    self.push_receiver_handle(tokio::spawn(async move { task.run().await }));
                    self.local_receivers.push(receiver.clone());
                }
                Err(e) => warn!("Error when initializing peer receiver {}: {}", name, e),
            }
        }
        drop(barrier_tx);
        self.set_barrier_receiver(barrier_rx);
        self.profile.proxy_receivers = self.local_receiver_addresses.clone();
    }

    /// Asks every receiver to stop and joins them through the shared
    /// barrier, bounded at five seconds per receiver.
    pub async fn terminate_local_receivers(&mut self) {
        if self.local_receivers.is_empty() {
            return;
        }
        for receiver in &self.local_receivers {
            info!("Terminating peer receiver {}", receiver.get_name());
            receiver.terminate().await;
        }
        if let Some(mut barrier_rx) = self.take_barrier_receiver() {
            let deadline =
                Duration::from_secs(RECEIVER_JOIN_DEADLINE_SECS * self.local_receivers.len() as u64);
            let drained = tokio::time::timeout(deadline, async {
                while barrier_rx.recv().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Peer receivers did not stop within deadline; abandoning them");
            }
        }
        for handle in self.drain_receiver_handles() {
            handle.abort();
        }
        self.local_receivers.clear();
    }

    /// Tries to ride a peer receiver upstream. Walks the available pool in
    /// insertion order, each address list from the back; invalid endpoints
    /// are dropped, the first accepted one is moved to the exhausted pool.
    pub async fn switch_to_first_available_peer(&mut self) -> Result<()> {
        if self.available_peer_receivers.is_empty() {
            if self.exhausted_peer_receivers.is_empty() {
                return Err(AgentError::NoPeersAvailable);
            }
            self.refresh_available_peer_receivers().await;
            return Err(AgentError::AllExhausted);
        }
        let key = self.current_key();
        let protocols: Vec<String> = self.available_peer_receivers.keys().cloned().collect();
        for protocol in protocols {
            loop {
                let Some(address) = self
                    .available_peer_receivers
                    .get(&protocol)
                    .and_then(|addresses| addresses.last().cloned())
                else {
                    break;
                };
                match self
                    .validate_and_set_comms_channel(&address, &protocol, &key)
                    .await
                {
                    Ok(()) => {
                        info!(
                            "Set agent comms to peer receiver {} at {}",
                            protocol, address
                        );
                        self.mark_peer_receiver_used(&protocol, &address);
                        self.display_peer_pools();
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            "Error attempting peer contact {} at {}: {}",
                            protocol, address, e
                        );
                        warn!("Removing {}/{} from the peer pool", protocol, address);
                        self.drop_available_peer(&protocol, &address);
                    }
                }
            }
            if self
                .available_peer_receivers
                .get(&protocol)
                .map(|addresses| addresses.is_empty())
                .unwrap_or(false)
            {
                self.available_peer_receivers.shift_remove(&protocol);
            }
        }
        Err(AgentError::NoCompatiblePeers)
    }

    // Moves an endpoint from available to exhausted so it is not retried
    // before the remaining ones.
    fn mark_peer_receiver_used(&mut self, protocol: &str, address: &str) {
        self.exhausted_peer_receivers
            .entry(protocol.to_string())
            .or_default()
            .push(address.to_string());
        self.drop_available_peer(protocol, address);
    }

    fn drop_available_peer(&mut self, protocol: &str, address: &str) {
        if let Some(addresses) = self.available_peer_receivers.get_mut(protocol) {
            addresses.retain(|existing| existing != address);
            if addresses.is_empty() {
                self.available_peer_receivers.shift_remove(protocol);
            }
        }
    }

    // Only called once the available pool is empty: recycle the exhausted
    // endpoints and look for fresh ones.
    async fn refresh_available_peer_receivers(&mut self) {
        self.available_peer_receivers = std::mem::take(&mut self.exhausted_peer_receivers);
        self.discover_peers().await;
    }

    /// Browses the local network for peer receivers and merges anything
    /// genuinely new into the available pool.
    pub async fn discover_peers(&mut self) {
        let (tx, mut rx) = mpsc::channel(32);
        tokio::task::spawn_blocking(move || discovery::browse_peer_services(tx));
        while let Some((protocol, ip_port)) = rx.recv().await {
            self.merge_new_peers(&protocol, &ip_port);
        }
    }

    /// Adds a discovered endpoint unless it is already known — in either
    /// pool, or as one of this agent's own receiver addresses.
    pub fn merge_new_peers(&mut self, protocol: &str, ip_port: &str) {
        let peer = format!("{}://{}", protocol.to_lowercase(), ip_port);
        let known = self
            .available_peer_receivers
            .get(protocol)
            .into_iter()
            .flatten()
            .chain(
                self.exhausted_peer_receivers
                    .get(protocol)
                    .into_iter()
                    .flatten(),
            )
            .any(|existing| existing == &peer);
        if known {
            return;
        }
        if let Some(local) = self.local_receiver_addresses.get(protocol) {
            if local.iter().any(|address| address == &peer) {
                return;
            }
        }
        self.available_peer_receivers
            .entry(protocol.to_string())
            .or_default()
            .push(peer.clone());
        info!("New peer added: {}", peer);
    }

    fn display_peer_pools(&self) {
        info!("Peer receivers used so far:");
        for (protocol, addresses) in &self.exhausted_peer_receivers {
            for address in addresses {
                info!("\t{} : {}", protocol, address);
            }
        }
        info!("Peer receivers left to try:");
        for (protocol, addresses) in &self.available_peer_receivers {
            for address in addresses {
                info!("\t{} : {}", protocol, address);
            }
        }
    }
}
