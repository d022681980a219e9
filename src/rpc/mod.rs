//! RPC service definitions for the control plane.
//!
//! The surrounding REST layer talks to `fleetd` through
//! [`control_service::ControlService`].

pub mod control_service;

use crate::error::{ControlError, StoreError};
use crate::model::{Agent, AgentStatus, Configuration, PlatformConfig, Selector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors returned by control RPC methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    /// Missing or wrong auth token
    AuthenticationFailed,
    /// Target agent has no live session
    NotConnected { agent_id: String },
    /// Referenced entity does not exist
    NotFound { message: String },
    /// Request conflicts with stored state
    Conflict { message: String },
    /// Internal error
    Internal { message: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::AuthenticationFailed => write!(f, "Authentication failed"),
            RpcError::NotConnected { agent_id } => {
                write!(f, "Agent not connected: {}", agent_id)
            }
            RpcError::NotFound { message } => write!(f, "Not found: {}", message),
            RpcError::Conflict { message } => write!(f, "Conflict: {}", message),
            RpcError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ControlError> for RpcError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::AuthRejected => RpcError::AuthenticationFailed,
            ControlError::NotConnected { agent_id } => RpcError::NotConnected { agent_id },
            ControlError::ConfigurationNotFound { .. } | ControlError::VersionNotFound { .. } => {
                RpcError::NotFound {
                    message: err.to_string(),
                }
            }
            ControlError::Store(store) => store.into(),
            other => RpcError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => RpcError::NotFound {
                message: err.to_string(),
            },
            StoreError::Conflict(message) => RpcError::Conflict { message },
            other => RpcError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for control RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Client-supplied fields of a configuration. Versions, hashes and
/// timestamps are always assigned server-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub content_type: String,
    pub raw_config: String,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub platform: Option<PlatformConfig>,
}

impl ConfigurationSpec {
    /// A new configuration built from this spec.
    pub fn into_configuration(self, now: DateTime<Utc>) -> Configuration {
        let mut config = Configuration::new(
            self.name,
            self.content_type,
            self.raw_config,
            self.selector,
            now,
        );
        config.display_name = self.display_name;
        config.description = self.description;
        config.platform = self.platform;
        config
    }

    /// Overlays this spec onto a stored configuration.
    pub fn apply_to(self, config: &mut Configuration) {
        config.display_name = self.display_name;
        config.description = self.description;
        config.content_type = self.content_type;
        config.raw_config = self.raw_config;
        config.selector = self.selector;
        config.platform = self.platform;
    }
}

/// Agent counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
}

impl AgentStatusSummary {
    pub fn from_agents(agents: &[Agent]) -> Self {
        let mut summary = Self {
            total: agents.len(),
            ..Self::default()
        };
        for agent in agents {
            match agent.status {
                AgentStatus::Online => summary.online += 1,
                AgentStatus::Offline => summary.offline += 1,
                AgentStatus::Error => summary.error += 1,
            }
        }
        summary
    }
}

/// Build metadata of the running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub sha: String,
    /// Commit time in Unix epoch seconds, 0 when unknown.
    pub timestamp: u64,
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
