use super::{Store, StoreResult};
use crate::error::StoreError;
use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory, REASON_SERVER_RESTART,
};
use crate::opamp::versioning::plan_update;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything the store holds. Also the snapshot file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    agents: BTreeMap<String, Agent>,
    #[serde(default)]
    configurations: BTreeMap<String, Configuration>,
    #[serde(default)]
    configuration_history: Vec<ConfigurationHistory>,
    #[serde(default)]
    apply_history: Vec<ConfigurationApplyHistory>,
    #[serde(default)]
    connection_history: Vec<AgentConnectionHistory>,
    #[serde(default)]
    next_id: u64,
}

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn agent_mut(&mut self, agent_id: &str) -> StoreResult<&mut Agent> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::not_found("agent", agent_id))
    }

    /// Demotes sessions left over from a previous process.
    fn recover_sessions(&mut self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        for agent in self.agents.values_mut() {
            if agent.status == AgentStatus::Offline {
                continue;
            }
            agent.status = AgentStatus::Offline;
            agent.disconnect_reason = Some(REASON_SERVER_RESTART.to_string());
            agent.last_disconnected_at = Some(now);
            agent.updated_at = now;
            recovered += 1;
        }
        for row in self.connection_history.iter_mut().filter(|r| r.is_active()) {
            row.close(now, REASON_SERVER_RESTART);
        }
        recovered
    }
}

/// In-process store. One lock around all state; each call is a transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    #[cfg(test)]
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a store from a snapshot file. A missing file yields an empty
    /// store. Recovered online/error agents are demoted to offline.
    pub fn load_snapshot(path: &Path, now: DateTime<Utc>) -> StoreResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Persistence(format!("read {}: {}", path.display(), e)))?;
        let mut state: StoreState = serde_json::from_str(&content)
            .map_err(|e| StoreError::Persistence(format!("parse {}: {}", path.display(), e)))?;

        let recovered = state.recover_sessions(now);
        tracing::info!(
            path = %path.display(),
            agents = state.agents.len(),
            configurations = state.configurations.len(),
            recovered,
            "Loaded store snapshot"
        );

        Ok(Self {
            state: Mutex::new(state),
            #[cfg(test)]
            unavailable: Default::default(),
        })
    }

    /// Writes the whole store as JSON, replacing the file atomically.
    pub fn persist_snapshot(&self, path: &Path) -> StoreResult<()> {
        let content = {
            let state = self.state.lock();
            serde_json::to_string_pretty(&*state)
                .map_err(|e| StoreError::Persistence(format!("serialize snapshot: {}", e)))?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Persistence(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| StoreError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| StoreError::Persistence(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        #[cfg(test)]
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<Agent>> {
        self.check_available()?;
        Ok(self.state.lock().agents.get(agent_id).cloned())
    }

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.check_available()?;
        self.state
            .lock()
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.check_available()?;
        Ok(self.state.lock().agents.values().cloned().collect())
    }

    async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.status = status;
        agent.last_seen_at = Some(now);
        match status {
            AgentStatus::Online => {
                agent.last_connected_at = Some(now);
                agent.disconnect_reason = None;
            }
            AgentStatus::Offline => agent.last_disconnected_at = Some(now),
            AgentStatus::Error => {}
        }
        agent.updated_at = now;
        Ok(())
    }

    async fn update_last_seen(&self, agent_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let agent = state.agent_mut(agent_id)?;
        agent.last_seen_at = Some(now);
        agent.updated_at = now;
        Ok(())
    }

    async fn set_disconnect_reason(&self, agent_id: &str, reason: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.agent_mut(agent_id)?.disconnect_reason = Some(reason.to_string());
        Ok(())
    }

    async fn list_stale_agents(&self, threshold: DateTime<Utc>) -> StoreResult<Vec<Agent>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .filter(|a| a.last_seen_at.is_some_and(|seen| seen < threshold))
            .cloned()
            .collect())
    }

    async fn get_configuration(&self, name: &str) -> StoreResult<Option<Configuration>> {
        self.check_available()?;
        Ok(self.state.lock().configurations.get(name).cloned())
    }

    async fn list_configurations(&self) -> StoreResult<Vec<Configuration>> {
        self.check_available()?;
        Ok(self.state.lock().configurations.values().cloned().collect())
    }

    async fn create_configuration(&self, mut config: Configuration) -> StoreResult<Configuration> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.configurations.contains_key(&config.name) {
            return Err(StoreError::Conflict(format!(
                "configuration {} already exists",
                config.name
            )));
        }
        config.update_hash();
        config.version = 1;
        state
            .configurations
            .insert(config.name.clone(), config.clone());
        Ok(config)
    }

    async fn update_configuration(
        &self,
        mut config: Configuration,
        now: DateTime<Utc>,
    ) -> StoreResult<Configuration> {
        self.check_available()?;
        let mut state = self.state.lock();
        let existing = state
            .configurations
            .get(&config.name)
            .ok_or_else(|| StoreError::not_found("configuration", &config.name))?;

        if let Some(mut snapshot) = plan_update(existing, &mut config, now) {
            snapshot.id = state.allocate_id();
            state.configuration_history.push(snapshot);
        }
        state
            .configurations
            .insert(config.name.clone(), config.clone());
        Ok(config)
    }

    async fn mark_configuration_applied(&self, name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let config = state
            .configurations
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found("configuration", name))?;
        config.last_applied_at = Some(at);
        Ok(())
    }

    async fn get_configuration_history(
        &self,
        name: &str,
        version: u32,
    ) -> StoreResult<Option<ConfigurationHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .configuration_history
            .iter()
            .find(|h| h.configuration_name == name && h.version == version)
            .cloned())
    }

    async fn list_configuration_history(
        &self,
        name: &str,
    ) -> StoreResult<Vec<ConfigurationHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .configuration_history
            .iter()
            .filter(|h| h.configuration_name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(rows)
    }

    async fn create_apply_history(
        &self,
        mut row: ConfigurationApplyHistory,
    ) -> StoreResult<ConfigurationApplyHistory> {
        self.check_available()?;
        let mut state = self.state.lock();
        row.id = state.allocate_id();
        state.apply_history.push(row.clone());
        Ok(row)
    }

    async fn update_apply_history(&self, row: &ConfigurationApplyHistory) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let stored = state
            .apply_history
            .iter_mut()
            .find(|r| r.id == row.id)
            .ok_or_else(|| StoreError::not_found("apply history", row.id.to_string()))?;
        *stored = row.clone();
        Ok(())
    }

    async fn list_pending_apply_histories(&self) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .apply_history
            .iter()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_apply_history_by_agent(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .apply_history
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn list_apply_history_by_configuration(
        &self,
        name: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .apply_history
            .iter()
            .filter(|r| r.configuration_name == name)
            .cloned()
            .collect())
    }

    async fn create_connection_history(
        &self,
        mut row: AgentConnectionHistory,
    ) -> StoreResult<AgentConnectionHistory> {
        self.check_available()?;
        let mut state = self.state.lock();
        row.id = state.allocate_id();
        state.connection_history.push(row.clone());
        Ok(row)
    }

    async fn update_connection_history(&self, row: &AgentConnectionHistory) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let stored = state
            .connection_history
            .iter_mut()
            .find(|r| r.id == row.id)
            .ok_or_else(|| StoreError::not_found("connection history", row.id.to_string()))?;
        *stored = row.clone();
        stored.calculate_duration();
        Ok(())
    }

    async fn get_active_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Option<AgentConnectionHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .connection_history
            .iter()
            .rev()
            .find(|r| r.agent_id == agent_id && r.is_active())
            .cloned())
    }

    async fn list_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<AgentConnectionHistory>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .connection_history
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect())
    }
}
