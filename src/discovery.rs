use log::warn;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SERVICE_TYPE: &str = "_service._comms.local.";
const BROWSE_BUDGET: Duration = Duration::from_secs(1);

/// Browses the local domain for peer receiver announcements for one second
/// and emits (protocol, "ip:port") pairs. Each service advertises its relay
/// protocol as the first TXT entry and an IPv4 address. Blocking; run it on
/// a blocking task and consume the channel from async land.
pub fn browse_peer_services(found: mpsc::Sender<(String, String)>) {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            warn!("Failed to initialize mDNS resolver: {}", e);
            return;
        }
    };
    let events = match daemon.browse(SERVICE_TYPE) {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to browse for peers: {}", e);
            let _ = daemon.shutdown();
            return;
        }
    };

    let deadline = Instant::now() + BROWSE_BUDGET;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let Some(protocol) = info
                    .get_properties()
                    .iter()
                    .next()
                    .map(|property| property.key().to_string())
                else {
                    continue;
                };
                for address in info.get_addresses() {
                    if let IpAddr::V4(ip) = address {
                        let endpoint = format!("{}:{}", ip, info.get_port());
                        if found.blocking_send((protocol.clone(), endpoint)).is_err() {
                            let _ = daemon.shutdown();
                            return;
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = daemon.shutdown();
}
