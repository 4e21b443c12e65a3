pub mod proc;
pub mod shell;

use async_trait::async_trait;
use base64::prelude::*;
use log::info;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::instructions::{
    ERROR_PID, ERROR_STATUS, Instruction, SUCCESS_STATUS, TIMEOUT_STATUS,
};

/// A named command runner. Executors report availability before they are
/// registered so the profile only advertises what actually works here.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, command: &str, timeout: u64) -> (Vec<u8>, String, String);

    fn name(&self) -> &str;

    fn check_if_available(&self) -> bool;
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(proc::ProcExecutor::new()));
        registry.register(Arc::new(shell::ShellExecutor::new()));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        if executor.check_if_available() {
            self.executors.insert(executor.name().to_string(), executor);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs one instruction's command: payload availability check, base64
/// decode, executor lookup, bounded execution. Returns (output, status, pid).
pub async fn run_command(
    registry: &ExecutorRegistry,
    instruction: &Instruction,
    staged_payloads: &[String],
) -> (Vec<u8>, String, String) {
    let missing = missing_payloads(&instruction.payloads, staged_payloads);
    if !missing.is_empty() {
        return (
            format!("Payload(s) not available: {}", missing.join(", ")).into_bytes(),
            ERROR_STATUS.to_string(),
            ERROR_PID.to_string(),
        );
    }
    let decoded = match BASE64_STANDARD.decode(&instruction.command) {
        Ok(d) => d,
        Err(e) => {
            return (
                format!("Error when decoding command: {}", e).into_bytes(),
                ERROR_STATUS.to_string(),
                ERROR_PID.to_string(),
            );
        }
    };
    let command = String::from_utf8_lossy(&decoded).to_string();
    let Some(executor) = registry.get(&instruction.executor) else {
        return (
            format!("Executor {} not available", instruction.executor).into_bytes(),
            ERROR_STATUS.to_string(),
            ERROR_PID.to_string(),
        );
    };
    info!("Running instruction {} via {}", instruction.id, instruction.executor);
    executor.run(&command, instruction.timeout).await
}

// A payload is missing when it was requested but never staged, or when the
// staged file has vanished from disk.
fn missing_payloads(requested: &[String], staged: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|payload| match staged_path_for(payload, staged) {
            Some(path) => !Path::new(path).exists(),
            None => true,
        })
        .cloned()
        .collect()
}

fn staged_path_for<'a>(payload: &str, staged: &'a [String]) -> Option<&'a String> {
    staged.iter().find(|path| {
        path.as_str() == payload
            || path
                .rsplit(['/', '\\'])
                .next()
                .map(|name| name == payload)
                .unwrap_or(false)
    })
}

// How long to keep draining pipes after a kill; orphaned grandchildren can
// hold the write ends open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Shared bounded child-process runner used by the shell-style executors.
/// A zero timeout fails before spawning; an expired timeout kills the child
/// and returns whatever output was produced.
pub(crate) async fn run_bounded(mut command: Command, timeout: u64) -> (Vec<u8>, String, String) {
    if timeout == 0 {
        return (
            b"Instruction timeout of 0 seconds".to_vec(),
            ERROR_STATUS.to_string(),
            ERROR_PID.to_string(),
        );
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return (
                format!("Error spawning process: {}", e).into_bytes(),
                ERROR_STATUS.to_string(),
                ERROR_PID.to_string(),
            );
        }
    };
    let pid = child
        .id()
        .map(|p| p.to_string())
        .unwrap_or_else(|| ERROR_PID.to_string());

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stream) = child.stdout.take() {
        readers.push(tokio::spawn(drain_stream(stream, stdout_buf.clone())));
    }
    if let Some(stream) = child.stderr.take() {
        readers.push(tokio::spawn(drain_stream(stream, stderr_buf.clone())));
    }

    let status = match tokio::time::timeout(Duration::from_secs(timeout), child.wait()).await {
        Ok(Ok(exit)) => {
            for reader in &mut readers {
                let _ = reader.await;
            }
            if exit.success() {
                SUCCESS_STATUS
            } else {
                ERROR_STATUS
            }
        }
        Ok(Err(e)) => {
            stderr_buf
                .lock()
                .unwrap()
                .extend_from_slice(format!("Error waiting on process: {}", e).as_bytes());
            abandon_readers(readers).await;
            ERROR_STATUS
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            abandon_readers(readers).await;
            TIMEOUT_STATUS
        }
    };

    let mut output = stdout_buf.lock().unwrap().clone();
    output.extend_from_slice(&stderr_buf.lock().unwrap());
    (output, status.to_string(), pid)
}

async fn drain_stream<R: AsyncRead + Unpin>(mut stream: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().unwrap().extend_from_slice(&chunk[..n]),
        }
    }
}

// Give the readers a moment to pick up buffered output, then cut them loose.
async fn abandon_readers(mut readers: Vec<tokio::task::JoinHandle<()>>) {
    for reader in &mut readers {
        let _ = tokio::time::timeout(DRAIN_GRACE, reader).await;
    }
    for reader in &readers {
        reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instruction(command: &str, executor: &str, timeout: u64) -> Instruction {
        Instruction {
            id: json!("link-1"),
            command: BASE64_STANDARD.encode(command),
            executor: executor.to_string(),
            timeout,
            payloads: Vec::new(),
            sleep: 0,
            deadman: false,
        }
    }

    #[tokio::test]
    async fn missing_payloads_short_circuit() {
        let registry = ExecutorRegistry::with_defaults();
        let mut instr = instruction("echo hi", "proc", 5);
        instr.payloads = vec!["absent.bin".to_string()];

        let (output, status, pid) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, ERROR_STATUS);
        assert_eq!(pid, ERROR_PID);
        assert!(String::from_utf8_lossy(&output).contains("Payload(s) not available"));
        assert!(String::from_utf8_lossy(&output).contains("absent.bin"));
    }

    #[tokio::test]
    async fn bad_base64_is_an_error() {
        let registry = ExecutorRegistry::with_defaults();
        let mut instr = instruction("", "proc", 5);
        instr.command = "%%%not-base64%%%".to_string();

        let (output, status, _) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, ERROR_STATUS);
        assert!(String::from_utf8_lossy(&output).contains("decoding command"));
    }

    #[tokio::test]
    async fn unknown_executor_is_an_error() {
        let registry = ExecutorRegistry::new();
        let instr = instruction("echo hi", "psh", 5);

        let (output, status, _) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, ERROR_STATUS);
        assert!(String::from_utf8_lossy(&output).contains("psh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn proc_executor_reports_success() {
        let registry = ExecutorRegistry::with_defaults();
        let instr = instruction("echo hello", "proc", 10);

        let (output, status, pid) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, SUCCESS_STATUS);
        assert_ne!(pid, ERROR_PID);
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_timeout_fails_without_spawning() {
        let registry = ExecutorRegistry::with_defaults();
        let instr = instruction("echo hello", "proc", 0);

        let (_, status, pid) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, ERROR_STATUS);
        assert_eq!(pid, ERROR_PID);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn expired_timeout_kills_and_reports_124() {
        let registry = ExecutorRegistry::with_defaults();
        let instr = instruction("sleep 30", "sh", 1);

        let start = std::time::Instant::now();
        let (_, status, pid) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, TIMEOUT_STATUS);
        assert_ne!(pid, ERROR_PID);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn partial_output_survives_timeout() {
        let registry = ExecutorRegistry::with_defaults();
        let instr = instruction("echo early; sleep 30", "sh", 1);

        let (output, status, _) = run_command(&registry, &instr, &[]).await;
        assert_eq!(status, TIMEOUT_STATUS);
        assert!(String::from_utf8_lossy(&output).contains("early"));
    }

    #[test]
    fn default_registry_lists_proc_and_shell() {
        let registry = ExecutorRegistry::with_defaults();
        let names = registry.names();
        assert!(names.contains(&"proc".to_string()));
        #[cfg(unix)]
        assert!(names.contains(&"sh".to_string()));
    }
}
