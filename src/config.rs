use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_SECRET_KEY: &str = "FLEETD_SECRET_KEY";
const ENV_RPC_TOKEN: &str = "FLEETD_RPC_TOKEN";
const ENV_HEARTBEAT_TIMEOUT: &str = "FLEETD_HEARTBEAT_TIMEOUT_SECS";
const ENV_HEARTBEAT_INTERVAL: &str = "FLEETD_HEARTBEAT_INTERVAL_SECS";

/// Server settings. Every field has a default so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Agent transport listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Control RPC listen address
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,

    /// Shared secret agents must present. No secret admits every session.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Token control RPC clients must authenticate with. Generated at
    /// startup when absent.
    #[serde(default)]
    pub rpc_token: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Upper bound on handling one inbound message
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,

    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:4320".to_string()
}

fn default_rpc_addr() -> String {
    "127.0.0.1:4321".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_message_timeout_secs() -> u64 {
    30
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            rpc_addr: default_rpc_addr(),
            secret_key: None,
            rpc_token: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            message_timeout_secs: default_message_timeout_secs(),
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// Reads a YAML config file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        Ok(config.with_env_overrides().normalized())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides().normalized()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(secret) = env_string(ENV_SECRET_KEY) {
            self.secret_key = Some(secret);
        }
        if let Some(token) = env_string(ENV_RPC_TOKEN) {
            self.rpc_token = Some(token);
        }
        if let Some(secs) = env_secs(ENV_HEARTBEAT_TIMEOUT) {
            self.heartbeat_timeout_secs = secs;
        }
        if let Some(secs) = env_secs(ENV_HEARTBEAT_INTERVAL) {
            self.heartbeat_interval_secs = secs;
        }
        self
    }

    /// Replaces zero durations with their defaults and drops empty secrets.
    fn normalized(mut self) -> Self {
        if self.heartbeat_interval_secs == 0 {
            self.heartbeat_interval_secs = default_heartbeat_interval_secs();
        }
        if self.heartbeat_timeout_secs == 0 {
            self.heartbeat_timeout_secs = default_heartbeat_timeout_secs();
        }
        if self.message_timeout_secs == 0 {
            self.message_timeout_secs = default_message_timeout_secs();
        }
        if self.snapshot_interval_secs == 0 {
            self.snapshot_interval_secs = default_snapshot_interval_secs();
        }
        self.secret_key = self.secret_key.filter(|s| !s.is_empty());
        self.rpc_token = self.rpc_token.filter(|s| !s.is_empty());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Configured snapshot path, or `~/.fleetd/state.json`.
    pub fn resolved_snapshot_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.snapshot_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".fleetd").join("state.json"))
    }

    /// The configured RPC token, or a fresh random one. The flag is true
    /// when the token was generated.
    pub fn rpc_token_or_generate(&self) -> (String, bool) {
        match &self.rpc_token {
            Some(token) => (token.clone(), false),
            None => (generate_token(), true),
        }
    }
}

fn generate_token() -> String {
    rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
