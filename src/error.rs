//! Error types of the control plane core.

use thiserror::Error;

/// Failure reported by a [`crate::store::Store`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Failure of a session-engine or push operation.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad or missing shared secret at connect time
    #[error("unauthorized")]
    AuthRejected,

    /// Message dropped without a response
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("agent {agent_id} is not connected")]
    NotConnected { agent_id: String },

    #[error("configuration not found: {name}")]
    ConfigurationNotFound { name: String },

    #[error("configuration {name} has no version {version}")]
    VersionNotFound { name: String, version: u32 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ControlResult<T> = Result<T, ControlError>;
