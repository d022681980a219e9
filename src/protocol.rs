//! Wire messages exchanged between agents and the control plane.
//!
//! Shapes follow the OpAMP data model closely enough that a bridge to the
//! protobuf encoding is a field-by-field copy, but they are serialized here as
//! JSON frames (see [`crate::transport`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Key under which the configuration body is carried in a remote config.
pub const CONFIG_FILE_KEY: &str = "config.yaml";

/// Asks the agent to include its full state in the next report.
pub const FLAG_REPORT_FULL_STATE: u64 = 1;

/// Length of an instance identifier in bytes.
pub const INSTANCE_UID_LEN: usize = 16;

// Identifying attribute keys mapped onto agent fields
pub const ATTR_SERVICE_NAME: &str = "service.name";
pub const ATTR_SERVICE_VERSION: &str = "service.version";
pub const ATTR_HOST_NAME: &str = "host.name";
pub const ATTR_HOST_ARCH: &str = "host.arch";
pub const ATTR_OS_TYPE: &str = "os.type";

/// Header carrying the shared secret directly.
pub const HEADER_SECRET_KEY: &str = "secret-key";
/// Standard authorization header, checked for a bearer token.
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const BEARER_PREFIX: &str = "Bearer ";

pub const STATUS_OK: u16 = 200;
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnyValue {
    String(String),
    Int(i64),
    Bool(bool),
    Double(f64),
}

impl AnyValue {
    /// String form used when the value lands in a label or identity field.
    pub fn render(&self) -> String {
        match self {
            AnyValue::String(s) => s.clone(),
            AnyValue::Int(i) => i.to_string(),
            AnyValue::Bool(b) => b.to_string(),
            AnyValue::Double(d) => d.to_string(),
        }
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AnyValue::String(value.into()),
        }
    }
}

/// Self-description an agent may attach to a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDescription {
    #[serde(default)]
    pub identifying_attributes: Vec<KeyValue>,
    #[serde(default)]
    pub non_identifying_attributes: Vec<KeyValue>,
}

/// Remote configuration state as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfigStatus {
    /// Hash of the last remote config the agent received
    #[serde(default)]
    pub last_remote_config_hash: String,
    #[serde(default)]
    pub status: RemoteConfigStatuses,
    #[serde(default)]
    pub error_message: String,
}

/// Agent to server message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentToServer {
    /// 16-byte instance identifier; anything else is malformed
    #[serde(default)]
    pub instance_uid: Vec<u8>,
    #[serde(default)]
    pub sequence_num: u64,
    #[serde(default)]
    pub agent_description: Option<AgentDescription>,
    #[serde(default)]
    pub remote_config_status: Option<RemoteConfigStatus>,
}

impl AgentToServer {
    /// Canonical agent id derived from the instance identifier.
    pub fn agent_id(&self) -> Option<String> {
        agent_id_from_uid(&self.instance_uid)
    }

    /// Hash the agent last reported, empty when it has not reported one.
    pub fn reported_hash(&self) -> &str {
        self.remote_config_status
            .as_ref()
            .map(|s| s.last_remote_config_hash.as_str())
            .unwrap_or("")
    }
}

/// Renders a 16-byte instance identifier as a hyphenated UUID string.
pub fn agent_id_from_uid(uid: &[u8]) -> Option<String> {
    if uid.len() != INSTANCE_UID_LEN {
        return None;
    }
    Uuid::from_slice(uid).ok().map(|u| u.to_string())
}

/// Parses an agent id back into its instance identifier bytes.
pub fn uid_from_agent_id(agent_id: &str) -> Option<Vec<u8>> {
    Uuid::parse_str(agent_id)
        .ok()
        .map(|u| u.as_bytes().to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    pub body: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigMap {
    pub config_map: BTreeMap<String, AgentConfigFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRemoteConfig {
    pub config: AgentConfigMap,
    pub config_hash: Vec<u8>,
}

impl AgentRemoteConfig {
    /// Remote config with a single file under [`CONFIG_FILE_KEY`].
    pub fn single_file(body: &str, content_type: &str, config_hash: &str) -> Self {
        let mut config_map = BTreeMap::new();
        config_map.insert(
            CONFIG_FILE_KEY.to_string(),
            AgentConfigFile {
                body: body.as_bytes().to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Self {
            config: AgentConfigMap { config_map },
            config_hash: config_hash.as_bytes().to_vec(),
        }
    }

    /// The config hash as text.
    pub fn hash_str(&self) -> String {
        String::from_utf8_lossy(&self.config_hash).into_owned()
    }

    /// The body stored under [`CONFIG_FILE_KEY`], if any.
    pub fn body_str(&self) -> Option<String> {
        self.config
            .config_map
            .get(CONFIG_FILE_KEY)
            .map(|f| String::from_utf8_lossy(&f.body).into_owned())
    }
}

/// Server to agent message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerToAgent {
    pub instance_uid: Vec<u8>,
    #[serde(default)]
    pub remote_config: Option<AgentRemoteConfig>,
    #[serde(default)]
    pub flags: u64,
}

/// First frame of every session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Header names are matched case-insensitively
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ConnectRequest {
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Answer to a [`ConnectRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub accepted: bool,
    pub status_code: u16,
}

impl ConnectResponse {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            status_code: STATUS_OK,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            accepted: false,
            status_code: STATUS_UNAUTHORIZED,
        }
    }
}
