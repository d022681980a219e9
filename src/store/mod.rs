//! Persistence collaborator consumed by the session engine.
//!
//! Every method is one transaction. Implementations provide their own
//! concurrency control; in particular `update_configuration` must be atomic
//! with respect to the configuration name it updates.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a store.
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // Agents

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<Agent>>;

    /// Inserts or replaces the agent. `updated_at` is stamped by the caller.
    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()>;

    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Writes the status and bumps last-seen to `now`.
    ///
    /// Online also sets last-connected and clears the disconnect reason;
    /// offline sets last-disconnected.
    async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn update_last_seen(&self, agent_id: &str, now: DateTime<Utc>) -> StoreResult<()>;

    async fn set_disconnect_reason(&self, agent_id: &str, reason: &str) -> StoreResult<()>;

    /// Online agents whose last-seen is strictly before `threshold`.
    async fn list_stale_agents(&self, threshold: DateTime<Utc>) -> StoreResult<Vec<Agent>>;

    // Configurations

    async fn get_configuration(&self, name: &str) -> StoreResult<Option<Configuration>>;

    /// All configurations in ascending name order.
    async fn list_configurations(&self) -> StoreResult<Vec<Configuration>>;

    /// Stores a new configuration at version 1 with its hash computed.
    async fn create_configuration(&self, config: Configuration) -> StoreResult<Configuration>;

    /// The version-bump transaction, stamped at `now`. Returns the stored row.
    async fn update_configuration(
        &self,
        config: Configuration,
        now: DateTime<Utc>,
    ) -> StoreResult<Configuration>;

    async fn mark_configuration_applied(&self, name: &str, at: DateTime<Utc>) -> StoreResult<()>;

    // Version history

    async fn get_configuration_history(
        &self,
        name: &str,
        version: u32,
    ) -> StoreResult<Option<ConfigurationHistory>>;

    /// Newest version first.
    async fn list_configuration_history(&self, name: &str)
        -> StoreResult<Vec<ConfigurationHistory>>;

    // Apply history

    /// Stores the row and returns it with its id assigned.
    async fn create_apply_history(
        &self,
        row: ConfigurationApplyHistory,
    ) -> StoreResult<ConfigurationApplyHistory>;

    async fn update_apply_history(&self, row: &ConfigurationApplyHistory) -> StoreResult<()>;

    /// Pending and applying rows, oldest first.
    async fn list_pending_apply_histories(&self) -> StoreResult<Vec<ConfigurationApplyHistory>>;

    async fn list_apply_history_by_agent(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>>;

    async fn list_apply_history_by_configuration(
        &self,
        name: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>>;

    // Connection history

    async fn create_connection_history(
        &self,
        row: AgentConnectionHistory,
    ) -> StoreResult<AgentConnectionHistory>;

    /// Replaces the row, recomputing its duration.
    async fn update_connection_history(&self, row: &AgentConnectionHistory) -> StoreResult<()>;

    async fn get_active_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Option<AgentConnectionHistory>>;

    async fn list_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<AgentConnectionHistory>>;

    /// Configuration the agent should run, if any.
    async fn get_configuration_for_agent(
        &self,
        agent_id: &str,
    ) -> StoreResult<Option<Configuration>> {
        let Some(agent) = self.get_agent(agent_id).await? else {
            return Ok(None);
        };
        let configurations = self.list_configurations().await?;
        Ok(crate::opamp::distributor::resolve(&agent, &configurations).cloned())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
