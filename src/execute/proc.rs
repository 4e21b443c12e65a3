use async_trait::async_trait;
use log::warn;
use tokio::process::Command;

use super::{run_bounded, Executor};
use crate::instructions::{ERROR_PID, ERROR_STATUS};

/// Spawns the command line directly, no shell in between.
pub struct ProcExecutor {
    name: String,
}

impl ProcExecutor {
    pub fn new() -> Self {
        Self {
            name: "proc".to_string(),
        }
    }
}

impl Default for ProcExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ProcExecutor {
    async fn run(&self, command: &str, timeout: u64) -> (Vec<u8>, String, String) {
        let args = match shellwords::split(command) {
            Ok(args) => args,
            Err(e) => {
                warn!("Error parsing command line: {}", e);
                return (
                    format!("Error parsing command line: {}", e).into_bytes(),
                    ERROR_STATUS.to_string(),
                    ERROR_PID.to_string(),
                );
            }
        };
        if args.is_empty() {
            return (
                b"No command given".to_vec(),
                ERROR_STATUS.to_string(),
                ERROR_PID.to_string(),
            );
        }
        let mut process = Command::new(&args[0]);
        process.args(&args[1..]);
        run_bounded(process, timeout).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn check_if_available(&self) -> bool {
        true
    }
}
