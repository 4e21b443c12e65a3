use log::warn;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::env;

use crate::errors::{AgentError, Result};

pub const PRIVILEGE_USER: &str = "User";
pub const PRIVILEGE_ELEVATED: &str = "Elevated";

/// Everything the agent reports about itself. Authored only by the agent
/// core; contacts can request changes through `modify`.
#[derive(Debug, Clone)]
pub struct Profile {
    pub paw: String,
    pub server: String,
    pub group: String,
    pub host: String,
    pub username: String,
    pub architecture: String,
    pub platform: String,
    pub location: String,
    pub pid: u32,
    pub ppid: u32,
    pub executors: Vec<String>,
    pub privilege: String,
    pub exe_name: String,
    pub proxy_receivers: HashMap<String, Vec<String>>,
    pub origin_link_id: i64,
    pub deadman_enabled: bool,
    pub available_contacts: Vec<String>,
    pub contact: String,
}

impl Profile {
    // Collects host identity up front. Hostname or username lookup failure
    // is the one fatal initialization condition outside channel setup.
    pub fn collect(
        server: String,
        group: String,
        paw: String,
        origin_link_id: i64,
        deadman_enabled: bool,
        executors: Vec<String>,
        available_contacts: Vec<String>,
    ) -> Result<Self> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .map_err(|e| AgentError::HostInfoUnavailable(format!("hostname: {}", e)))?;
        let username = get_username()?;
        let location = env::current_exe()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| env::args().next().unwrap_or_default());
        let exe_name = location
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            paw,
            server,
            group,
            host,
            username,
            architecture: env::consts::ARCH.to_string(),
            platform: env::consts::OS.to_string(),
            location,
            pid: std::process::id(),
            ppid: parent_pid(),
            executors,
            privilege: privilege_level().to_string(),
            exe_name,
            proxy_receivers: HashMap::new(),
            origin_link_id,
            deadman_enabled,
            available_contacts,
            contact: String::new(),
        })
    }

    pub fn full(&self) -> Value {
        json!({
            "paw": self.paw,
            "server": self.server,
            "group": self.group,
            "host": self.host,
            "username": self.username,
            "architecture": self.architecture,
            "platform": self.platform,
            "location": self.location,
            "pid": self.pid,
            "ppid": self.ppid,
            "executors": self.executors,
            "privilege": self.privilege,
            "exe_name": self.exe_name,
            "proxy_receivers": self.proxy_receivers,
            "origin_link_id": self.origin_link_id,
            "deadman_enabled": self.deadman_enabled,
            "available_contacts": self.available_contacts,
            "contact": self.contact,
        })
    }

    // Minimal subset used on hot paths.
    pub fn trimmed(&self) -> Value {
        json!({
            "paw": self.paw,
            "server": self.server,
            "platform": self.platform,
            "host": self.host,
            "contact": self.contact,
        })
    }

    /// Applies contact-supplied overrides. Only `paw` and `server` are
    /// honored; anything else is dropped with a warning. The caller fans the
    /// change out to live receivers.
    pub fn modify(&mut self, modifications: &HashMap<String, String>) {
        for (key, value) in modifications {
            match key.as_str() {
                "paw" => self.paw = value.clone(),
                "server" => self.server = value.clone(),
                other => warn!("Ignoring unsupported profile modification `{}`", other),
            }
        }
    }

    pub fn set_paw(&mut self, paw: &str) {
        if !paw.is_empty() {
            self.paw = paw.to_string();
        }
    }
}

fn get_username() -> Result<String> {
    let username = whoami::username();
    if username.is_empty() {
        return Err(AgentError::HostInfoUnavailable(
            "username could not be determined".to_string(),
        ));
    }
    Ok(username)
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

#[cfg(unix)]
pub fn privilege_level() -> &'static str {
    if unsafe { libc::geteuid() } == 0 {
        PRIVILEGE_ELEVATED
    } else {
        PRIVILEGE_USER
    }
}

// Fail safe to User when elevation cannot be confirmed.
#[cfg(windows)]
pub fn privilege_level() -> &'static str {
    use std::process::Command;

    Command::new("net")
        .args(["session"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
        .then_some(PRIVILEGE_ELEVATED)
        .unwrap_or(PRIVILEGE_USER)
}

#[cfg(all(not(unix), not(windows)))]
pub fn privilege_level() -> &'static str {
    PRIVILEGE_USER
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> Profile {
        Profile::collect(
            "http://localhost:8888".to_string(),
            "red".to_string(),
            String::new(),
            0,
            true,
            vec!["proc".to_string()],
            vec!["HTTP".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn full_contains_every_trimmed_key() {
        let mut profile = sample_profile();
        profile.paw = "abc".to_string();
        profile.contact = "HTTP".to_string();

        let full = profile.full();
        let trimmed = profile.trimmed();
        for (key, value) in trimmed.as_object().unwrap() {
            assert_eq!(full.get(key), Some(value), "mismatch on key {}", key);
        }
    }

    #[test]
    fn modify_applies_paw_and_server_only() {
        let mut profile = sample_profile();
        let mut mods = HashMap::new();
        mods.insert("paw".to_string(), "xyz".to_string());
        mods.insert("server".to_string(), "http://10.0.0.5:8888".to_string());
        mods.insert("group".to_string(), "blue".to_string());

        profile.modify(&mods);
        assert_eq!(profile.paw, "xyz");
        assert_eq!(profile.server, "http://10.0.0.5:8888");
        assert_eq!(profile.group, "red");
    }

    #[test]
    fn set_paw_ignores_empty() {
        let mut profile = sample_profile();
        profile.set_paw("abc");
        profile.set_paw("");
        assert_eq!(profile.paw, "abc");
    }

    #[test]
    fn collect_reports_host_identity() {
        let profile = sample_profile();
        assert!(!profile.host.is_empty());
        assert!(!profile.username.is_empty());
        assert!(profile.pid > 0);
        assert!(!profile.exe_name.contains('/'));
    }
}
