//! Persisted records shared by the session engine and the store.

pub mod agent;
pub mod configuration;
pub mod connection_history;

pub use agent::{Agent, AgentStatus, AgentUpdate, Labels, PROTOCOL_OPAMP};
pub use configuration::{
    compute_config_hash, ApplyStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory, PlatformConfig, ResourceReference, Selector,
};
pub use connection_history::{
    AgentConnectionHistory, REASON_CONNECTION_CLOSED, REASON_HEARTBEAT_TIMEOUT,
    REASON_SERVER_RESTART,
};

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
