//! Control service definitions for REST layer ↔ fleetd RPC.

use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory,
};
use crate::opamp::PushOutcome;
use crate::rpc::{AgentStatusSummary, BuildInfo, ConfigurationSpec, RpcResult};

/// Service exposed by fleetd to its management front end.
#[tarpc::service]
pub trait ControlService {
    /// Authenticate with the server.
    /// Must be called first before any other RPC operations.
    async fn authenticate(token: String) -> RpcResult<()>;

    /// Whether the agent currently has a live session.
    async fn is_connected(agent_id: String) -> RpcResult<bool>;

    async fn list_agents() -> RpcResult<Vec<Agent>>;

    async fn get_agent(agent_id: String) -> RpcResult<Option<Agent>>;

    /// Agents currently in `status`.
    async fn list_agents_by_status(status: AgentStatus) -> RpcResult<Vec<Agent>>;

    async fn agent_status_summary() -> RpcResult<AgentStatusSummary>;

    async fn get_configuration(name: String) -> RpcResult<Option<Configuration>>;

    /// All configurations in name order.
    async fn list_configurations() -> RpcResult<Vec<Configuration>>;

    /// Create a configuration at version 1.
    async fn create_configuration(spec: ConfigurationSpec) -> RpcResult<Configuration>;

    /// Replace a configuration's content. Bumps the version only when the
    /// content hash changes.
    async fn update_configuration(spec: ConfigurationSpec) -> RpcResult<Configuration>;

    /// Restore the content of an earlier version as a new version.
    async fn rollback_configuration(name: String, version: u32) -> RpcResult<Configuration>;

    /// Version snapshots of a configuration, newest first.
    async fn configuration_history(name: String) -> RpcResult<Vec<ConfigurationHistory>>;

    async fn apply_history(agent_id: String) -> RpcResult<Vec<ConfigurationApplyHistory>>;

    /// Apply attempts of one configuration across all agents.
    async fn configuration_apply_history(
        name: String,
    ) -> RpcResult<Vec<ConfigurationApplyHistory>>;

    async fn connection_history(agent_id: String) -> RpcResult<Vec<AgentConnectionHistory>>;

    /// The agent's open connection session, if any.
    async fn active_connection(agent_id: String) -> RpcResult<Option<AgentConnectionHistory>>;

    /// Push a configuration to one agent, or to all matching agents when
    /// `agent_id` is None.
    async fn push_configuration(name: String, agent_id: Option<String>)
        -> RpcResult<PushOutcome>;

    /// Get server build SHA for version checking.
    async fn build_sha() -> String;

    async fn build_info() -> BuildInfo;
}
