//! Agent records as persisted by the store.

use super::Configuration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol tag stored on every agent created by the session engine.
pub const PROTOCOL_OPAMP: &str = "opamp";

/// Connection status of an agent.
///
/// This is the only status an agent can be in; there is no "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    /// New agents start here until their first message is processed
    #[default]
    Offline,
    /// Agent reported a failed remote configuration
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    /// Parses a persisted status string. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "error" => Some(AgentStatus::Error),
            _ => None,
        }
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_some()
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label set of an agent, used for selector matching.
///
/// Ordered so that listings and snapshots are stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every `(key, value)` of `selector` is present and equal.
    ///
    /// An empty selector matches every label set here; configurations apply
    /// the stricter "empty matches nothing" rule on top of this.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.0.get(key).is_some_and(|v| v == value))
    }

    /// Returns a copy with `other` layered on top.
    pub fn merge(&self, other: &Labels) -> Labels {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Labels(merged)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Labels(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A managed telemetry agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Canonical UUID string of the agent's 16-byte instance identifier
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub architecture: String,
    /// Operating system type (linux, windows, darwin)
    #[serde(default)]
    pub os_type: String,

    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disconnect_reason: Option<String>,

    #[serde(default)]
    pub labels: Labels,
    /// Explicit configuration assignment; bypasses selector matching
    #[serde(default)]
    pub configuration_name: Option<String>,

    pub protocol: String,
    /// Last sequence number received, stored verbatim
    #[serde(default)]
    pub sequence_number: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// A freshly discovered agent: offline, no labels, no assignment.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: String::new(),
            hostname: String::new(),
            architecture: String::new(),
            os_type: String::new(),
            status: AgentStatus::Offline,
            last_seen_at: None,
            last_connected_at: None,
            last_disconnected_at: None,
            disconnect_reason: None,
            labels: Labels::new(),
            configuration_name: None,
            protocol: PROTOCOL_OPAMP.to_string(),
            sequence_number: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An update to deliver to a connected agent.
///
/// Only `configuration` reaches the wire; the agent protocol has no server
/// to agent label field, so `labels` is carried for callers and not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub labels: Option<Labels>,
    #[serde(default)]
    pub configuration: Option<Configuration>,
}

impl AgentUpdate {
    pub fn with_configuration(configuration: Configuration) -> Self {
        Self {
            labels: None,
            configuration: Some(configuration),
        }
    }
}
