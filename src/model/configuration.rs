//! Configuration records with their version snapshots and per-agent apply
//! attempts.

use super::Agent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Label selector of a configuration.
pub type Selector = BTreeMap<String, String>;

/// Lowercase hex SHA-256 of configuration content (64 characters).
pub fn compute_config_hash(raw_config: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_config.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Reference to a reusable pipeline component in a composed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameter values as strings so the record stays encodable by
    /// non-self-describing formats
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Composition of a configuration from sources, processors and destinations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub sources: Vec<ResourceReference>,
    #[serde(default)]
    pub processors: Vec<ResourceReference>,
    #[serde(default)]
    pub destinations: Vec<ResourceReference>,
}

/// A named agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,

    /// yaml or json
    pub content_type: String,
    pub raw_config: String,
    /// Always `compute_config_hash(raw_config)` once stored
    #[serde(default)]
    pub config_hash: String,

    /// Starts at 1, bumped only when the content hash changes
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,

    /// Empty selector matches no agent
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub platform: Option<PlatformConfig>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Configuration {
    /// Creates a version-1 configuration with its hash already computed.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        raw_config: impl Into<String>,
        selector: Selector,
        now: DateTime<Utc>,
    ) -> Self {
        let raw_config = raw_config.into();
        Self {
            name: name.into(),
            display_name: String::new(),
            description: String::new(),
            content_type: content_type.into(),
            config_hash: compute_config_hash(&raw_config),
            raw_config,
            version: 1,
            last_applied_at: None,
            selector,
            platform: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recomputes `config_hash` from `raw_config`.
    pub fn update_hash(&mut self) {
        self.config_hash = compute_config_hash(&self.raw_config);
    }

    /// Selector rule: a non-empty selector whose every pair is in the
    /// agent's labels. Extra agent labels are irrelevant.
    pub fn matches_agent(&self, agent: &Agent) -> bool {
        if self.selector.is_empty() {
            return false;
        }
        agent.labels.matches(&self.selector)
    }
}

/// Immutable snapshot of a configuration at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationHistory {
    pub id: u64,
    pub configuration_name: String,
    pub version: u32,
    pub content_type: String,
    pub raw_config: String,
    pub config_hash: String,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub platform: Option<PlatformConfig>,
    #[serde(default)]
    pub change_description: String,
    #[serde(default)]
    pub created_by: String,
    /// When the snapshotted version was last written
    pub created_at: DateTime<Utc>,
}

impl ConfigurationHistory {
    /// Snapshot of `existing` as it is right now. The id is assigned by the store.
    pub fn snapshot_of(existing: &Configuration) -> Self {
        Self {
            id: 0,
            configuration_name: existing.name.clone(),
            version: existing.version,
            content_type: existing.content_type.clone(),
            raw_config: existing.raw_config.clone(),
            config_hash: existing.config_hash.clone(),
            selector: existing.selector.clone(),
            platform: existing.platform.clone(),
            change_description: String::new(),
            created_by: String::new(),
            created_at: existing.updated_at,
        }
    }
}

/// Lifecycle of one push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    /// Recorded, delivery not yet attempted
    #[default]
    Pending,
    /// Delivered to the agent's session, awaiting its report
    Applying,
    Applied,
    Failed,
}

impl ApplyStatus {
    /// Applied and failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplyStatus::Applied | ApplyStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Pending => "pending",
            ApplyStatus::Applying => "applying",
            ApplyStatus::Applied => "applied",
            ApplyStatus::Failed => "failed",
        }
    }

    /// Allowed moves: pending -> applying, and any non-terminal state to a
    /// terminal one.
    pub fn can_transition_to(&self, next: ApplyStatus) -> bool {
        match (self, next) {
            (ApplyStatus::Pending, ApplyStatus::Applying) => true,
            (from, to) => !from.is_terminal() && to.is_terminal(),
        }
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to deliver a configuration to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationApplyHistory {
    pub id: u64,
    pub agent_id: String,
    pub configuration_name: String,
    /// Hash of the content being pushed
    pub config_hash: String,
    pub status: ApplyStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigurationApplyHistory {
    pub fn new(
        agent_id: impl Into<String>,
        configuration: &Configuration,
        status: ApplyStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            agent_id: agent_id.into(),
            configuration_name: configuration.name.clone(),
            config_hash: configuration.config_hash.clone(),
            status,
            error_message: None,
            applied_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next` if allowed. Returns false and leaves the row untouched
    /// otherwise; terminal rows never change.
    pub fn transition(
        &mut self,
        next: ApplyStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if let Some(message) = error_message.filter(|m| !m.is_empty()) {
            self.error_message = Some(message.to_string());
        }
        if next == ApplyStatus::Applied {
            self.applied_at = Some(now);
        }
        self.updated_at = now;
        true
    }
}
