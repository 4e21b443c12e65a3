use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::errors::Result;

/// A local forwarder that rewrites each contact's upstream address. Concrete
/// tunnels are build-time extensions; the default registry ships empty.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn get_name(&self) -> String;

    fn initialize(&self, config: &TunnelConfig) -> Result<()>;

    /// Runs until agent termination. Must signal readiness exactly once:
    /// `true` when listening, `false` when startup failed.
    async fn run(&self, ready: oneshot::Sender<bool>);

    /// Agent-side address of the tunnel entrance.
    fn get_local_addr(&self) -> String;

    /// Address the tunnel ultimately connects to.
    fn get_remote_addr(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub protocol: String,
    pub tunnel_addr: String,
    pub username: String,
    pub password: String,
    pub tunnel_dest: String,
}

#[derive(Default, Clone)]
pub struct TunnelRegistry {
    tunnels: HashMap<String, Arc<dyn Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.tunnels.insert(tunnel.get_name(), tunnel);
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Tunnel>> {
        self.tunnels.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tunnels.keys().cloned().collect();
        names.sort();
        names
    }
}
