use async_trait::async_trait;
use tokio::process::Command;

use super::{run_bounded, Executor};

#[cfg(unix)]
const SHELL_NAME: &str = "sh";
#[cfg(unix)]
const SHELL_PATH: &str = "/bin/sh";
#[cfg(unix)]
const SHELL_ARG: &str = "-c";

#[cfg(windows)]
const SHELL_NAME: &str = "cmd";
#[cfg(windows)]
const SHELL_PATH: &str = "cmd.exe";
#[cfg(windows)]
const SHELL_ARG: &str = "/C";

/// Hands the whole command line to the platform shell.
pub struct ShellExecutor {
    name: String,
    path: String,
    exec_arg: String,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            name: SHELL_NAME.to_string(),
            path: SHELL_PATH.to_string(),
            exec_arg: SHELL_ARG.to_string(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn run(&self, command: &str, timeout: u64) -> (Vec<u8>, String, String) {
        let mut process = Command::new(&self.path);
        process.arg(&self.exec_arg).arg(command);
        run_bounded(process, timeout).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn check_if_available(&self) -> bool {
        #[cfg(unix)]
        {
            std::path::Path::new(&self.path).exists()
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::{ERROR_STATUS, SUCCESS_STATUS};

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_and_redirection_work() {
        let executor = ShellExecutor::new();
        let (output, status, _) = executor.run("printf 'a\\nb\\n' | wc -l", 5).await;
        assert_eq!(status, SUCCESS_STATUS);
        assert_eq!(String::from_utf8_lossy(&output).trim(), "2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_maps_to_error_status() {
        let executor = ShellExecutor::new();
        let (_, status, _) = executor.run("exit 3", 5).await;
        assert_eq!(status, ERROR_STATUS);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_captured() {
        let executor = ShellExecutor::new();
        let (output, _, _) = executor.run("echo oops >&2", 5).await;
        assert!(String::from_utf8_lossy(&output).contains("oops"));
    }
}
