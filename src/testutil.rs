// Shared mocks wired through the explicit registries.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentOptions, C2Config};
use crate::contact::tunnel::{Tunnel, TunnelConfig, TunnelRegistry};
use crate::contact::{Contact, ContactConfig, ContactRegistry};
use crate::errors::{AgentError, Result};
use crate::execute::{Executor, ExecutorRegistry};
use crate::instructions::ExecutionResult;
use crate::proxy::{PeerReceiver, ReceiverRegistry};

/// Agent wired with a mock executor and the given contacts; no receivers,
/// no tunnels, self-delete off.
pub fn build_agent(contacts: ContactRegistry, options: AgentOptions) -> Agent {
    build_agent_with(contacts, ReceiverRegistry::new(), TunnelRegistry::new(), options)
}

pub fn build_agent_with(
    contacts: ContactRegistry,
    receivers: ReceiverRegistry,
    tunnels: TunnelRegistry,
    options: AgentOptions,
) -> Agent {
    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(MockExecutor::new("mock")));
    Agent::new(options, contacts, tunnels, executors, receivers).unwrap()
}

pub fn default_options(server: &str) -> AgentOptions {
    AgentOptions {
        server: server.to_string(),
        self_delete: false,
        c2: C2Config {
            c2_name: "HTTP".to_string(),
            ..C2Config::default()
        },
        ..AgentOptions::default()
    }
}

pub fn http_registry() -> (Arc<MockContact>, ContactRegistry) {
    let mock = Arc::new(MockContact::new("HTTP"));
    let mut contacts = ContactRegistry::new();
    contacts.register(mock.clone());
    (mock, contacts)
}

/// Scripted contact: beacon responses are popped from a queue; an empty
/// queue means the transport is dead.
pub struct MockContact {
    name: String,
    beacons: Mutex<VecDeque<Option<Vec<u8>>>>,
    beacon_profiles: Mutex<Vec<Value>>,
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    results: Mutex<Vec<(Value, ExecutionResult)>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    upstreams: Mutex<Vec<String>>,
    accept: Mutex<bool>,
    modifications: Mutex<Option<HashMap<String, String>>>,
    rejected_addresses: Mutex<HashSet<String>>,
    validations: AtomicUsize,
}

impl MockContact {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            beacons: Mutex::new(VecDeque::new()),
            beacon_profiles: Mutex::new(Vec::new()),
            payloads: Mutex::new(HashMap::new()),
            results: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            upstreams: Mutex::new(Vec::new()),
            accept: Mutex::new(true),
            modifications: Mutex::new(None),
            rejected_addresses: Mutex::new(HashSet::new()),
            validations: AtomicUsize::new(0),
        }
    }

    pub fn push_beacon(&self, response: Option<Vec<u8>>) {
        self.beacons.lock().unwrap().push_back(response);
    }

    pub fn add_payload(&self, name: &str, bytes: Vec<u8>) {
        self.payloads.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn set_accept(&self, accept: bool) {
        *self.accept.lock().unwrap() = accept;
    }

    pub fn set_modifications(&self, modifications: HashMap<String, String>) {
        *self.modifications.lock().unwrap() = Some(modifications);
    }

    pub fn reject_address(&self, address: &str) {
        self.rejected_addresses
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    pub fn beacon_profiles(&self) -> Vec<Value> {
        self.beacon_profiles.lock().unwrap().clone()
    }

    pub fn sent_results(&self) -> Vec<(Value, ExecutionResult)> {
        self.results.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn upstream_addresses(&self) -> Vec<String> {
        self.upstreams.lock().unwrap().clone()
    }

    pub fn validation_count(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Contact for MockContact {
    async fn get_beacon_bytes(&self, profile: &Value) -> Option<Vec<u8>> {
        self.beacon_profiles.lock().unwrap().push(profile.clone());
        self.beacons.lock().unwrap().pop_front().flatten()
    }

    async fn get_payload_bytes(&self, _profile: &Value, payload: &str) -> (Vec<u8>, String) {
        match self.payloads.lock().unwrap().get(payload) {
            Some(bytes) => (bytes.clone(), payload.to_string()),
            None => (Vec::new(), String::new()),
        }
    }

    async fn send_execution_results(&self, profile: &Value, result: &ExecutionResult) {
        self.results
            .lock()
            .unwrap()
            .push((profile.clone(), result.clone()));
    }

    async fn upload_file_bytes(
        &self,
        _profile: &Value,
        upload_name: &str,
        data: &[u8],
    ) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((upload_name.to_string(), data.to_vec()));
        Ok(())
    }

    fn c2_requirements_met(
        &self,
        _profile: &Value,
        config: &ContactConfig,
    ) -> (bool, Option<HashMap<String, String>>) {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self
            .rejected_addresses
            .lock()
            .unwrap()
            .contains(&config.server_addr)
        {
            return (false, None);
        }
        (
            *self.accept.lock().unwrap(),
            self.modifications.lock().unwrap().clone(),
        )
    }

    fn set_upstream_dest_addr(&self, addr: &str) {
        self.upstreams.lock().unwrap().push(addr.to_string());
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

/// Executor that records every command it is asked to run.
pub struct MockExecutor {
    name: String,
    commands: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, command: &str, _timeout: u64) -> (Vec<u8>, String, String) {
        self.commands.lock().unwrap().push(command.to_string());
        (b"mock output".to_vec(), "0".to_string(), "42".to_string())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn check_if_available(&self) -> bool {
        true
    }
}

/// Receiver that records fan-out updates instead of listening anywhere.
pub struct MockReceiver {
    name: String,
    addresses: Vec<String>,
    pub paws: Mutex<Vec<String>>,
    pub servers: Mutex<Vec<String>>,
    pub contacts: Mutex<Vec<String>>,
    barrier: Mutex<Option<mpsc::Sender<()>>>,
    cancel: CancellationToken,
    fail_init: bool,
}

impl MockReceiver {
    pub fn new(name: &str, addresses: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            addresses,
            paws: Mutex::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            contacts: Mutex::new(Vec::new()),
            barrier: Mutex::new(None),
            cancel: CancellationToken::new(),
            fail_init: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        let mut receiver = Self::new(name, Vec::new());
        receiver.fail_init = true;
        receiver
    }
}

#[async_trait]
impl PeerReceiver for MockReceiver {
    async fn initialize(
        &self,
        _upstream_server: &str,
        upstream_contact: Arc<dyn Contact>,
        barrier: mpsc::Sender<()>,
    ) -> Result<()> {
        if self.fail_init {
            return Err(AgentError::ReceiverInit(
                self.name.clone(),
                "scripted failure".to_string(),
            ));
        }
        self.contacts
            .lock()
            .unwrap()
            .push(upstream_contact.get_name());
        *self.barrier.lock().unwrap() = Some(barrier);
        Ok(())
    }

    async fn run(&self) {
        let barrier = self.barrier.lock().unwrap().take();
        self.cancel.cancelled().await;
        drop(barrier);
    }

    async fn terminate(&self) {
        self.cancel.cancel();
    }

    async fn update_upstream_server(&self, addr: &str) {
        self.servers.lock().unwrap().push(addr.to_string());
    }

    async fn update_upstream_coms(&self, contact: Arc<dyn Contact>) {
        self.contacts.lock().unwrap().push(contact.get_name());
    }

    async fn update_agent_paw(&self, paw: &str) {
        self.paws.lock().unwrap().push(paw.to_string());
    }

    fn get_receiver_addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

/// Tunnel that signals readiness and then idles until dropped.
pub struct MockTunnel {
    name: String,
    local_addr: String,
    remote_addr: Mutex<String>,
    ready_value: bool,
    pub initialized: Mutex<bool>,
}

impl MockTunnel {
    pub fn new(name: &str, local_addr: &str, ready_value: bool) -> Self {
        Self {
            name: name.to_string(),
            local_addr: local_addr.to_string(),
            remote_addr: Mutex::new(String::new()),
            ready_value,
            initialized: Mutex::new(false),
        }
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn initialize(&self, config: &TunnelConfig) -> Result<()> {
        *self.initialized.lock().unwrap() = true;
        *self.remote_addr.lock().unwrap() = config.tunnel_dest.clone();
        Ok(())
    }

    async fn run(&self, ready: oneshot::Sender<bool>) {
        let _ = ready.send(self.ready_value);
        std::future::pending::<()>().await;
    }

    fn get_local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn get_remote_addr(&self) -> String {
        self.remote_addr.lock().unwrap().clone()
    }
}
