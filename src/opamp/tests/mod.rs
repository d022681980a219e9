//! Session engine tests.
//!
//! Hooks are driven directly with in-memory connections; no transport is
//! involved.

mod distributor_tests;

use super::{AgentConnection, ControlServer, SessionId, SharedConnection};
use crate::clock::{Clock, ManualClock};
use crate::config::ServerConfig;
use crate::error::{ControlError, ControlResult};
use crate::metrics::testing::RecordingMetrics;
use crate::error::StoreError;
use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory, Selector,
};
use crate::protocol::{
    AgentDescription, AgentToServer, KeyValue, RemoteConfigStatus, RemoteConfigStatuses,
    ServerToAgent, ATTR_HOST_NAME, ATTR_SERVICE_NAME,
};
use crate::store::{MemoryStore, Store, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TEST_SESSION: AtomicU64 = AtomicU64::new(1_000_000);

/// Connection that records everything sent to it.
pub struct FakeConnection {
    id: SessionId,
    remote_addr: String,
    pub sent: Mutex<Vec<ServerToAgent>>,
    pub fail_sends: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Self::with_addr("10.0.0.1:50000")
    }

    pub fn with_addr(remote_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TEST_SESSION.fetch_add(1, Ordering::Relaxed),
            remote_addr: remote_addr.to_string(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedConnection {
        self.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl AgentConnection for FakeConnection {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    async fn send(&self, message: ServerToAgent) -> ControlResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ControlError::Transport("send failed".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Memory store whose individual methods can be made to fail.
///
/// Methods are named as on [`Store`]. A failing method returns
/// `Unavailable` without touching the wrapped store.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail(&self, method: &'static str) {
        self.failing.lock().insert(method);
    }

    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, method: &'static str) -> StoreResult<()> {
        if self.failing.lock().contains(method) {
            return Err(StoreError::Unavailable(format!("{} failed", method)));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<Agent>> {
        self.check("get_agent")?;
        self.inner.get_agent(agent_id).await
    }

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        self.check("upsert_agent")?;
        self.inner.upsert_agent(agent).await
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.check("list_agents")?;
        self.inner.list_agents().await
    }

    async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check("update_agent_status")?;
        self.inner.update_agent_status(agent_id, status, now).await
    }

    async fn update_last_seen(&self, agent_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.check("update_last_seen")?;
        self.inner.update_last_seen(agent_id, now).await
    }

    async fn set_disconnect_reason(&self, agent_id: &str, reason: &str) -> StoreResult<()> {
        self.check("set_disconnect_reason")?;
        self.inner.set_disconnect_reason(agent_id, reason).await
    }

    async fn list_stale_agents(&self, threshold: DateTime<Utc>) -> StoreResult<Vec<Agent>> {
        self.check("list_stale_agents")?;
        self.inner.list_stale_agents(threshold).await
    }

    async fn get_configuration(&self, name: &str) -> StoreResult<Option<Configuration>> {
        self.check("get_configuration")?;
        self.inner.get_configuration(name).await
    }

    async fn list_configurations(&self) -> StoreResult<Vec<Configuration>> {
        self.check("list_configurations")?;
        self.inner.list_configurations().await
    }

    async fn create_configuration(&self, config: Configuration) -> StoreResult<Configuration> {
        self.check("create_configuration")?;
        self.inner.create_configuration(config).await
    }

    async fn update_configuration(
        &self,
        config: Configuration,
        now: DateTime<Utc>,
    ) -> StoreResult<Configuration> {
        self.check("update_configuration")?;
        self.inner.update_configuration(config, now).await
    }

    async fn mark_configuration_applied(&self, name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.check("mark_configuration_applied")?;
        self.inner.mark_configuration_applied(name, at).await
    }

    async fn get_configuration_history(
        &self,
        name: &str,
        version: u32,
    ) -> StoreResult<Option<ConfigurationHistory>> {
        self.check("get_configuration_history")?;
        self.inner.get_configuration_history(name, version).await
    }

    async fn list_configuration_history(
        &self,
        name: &str,
    ) -> StoreResult<Vec<ConfigurationHistory>> {
        self.check("list_configuration_history")?;
        self.inner.list_configuration_history(name).await
    }

    async fn create_apply_history(
        &self,
        row: ConfigurationApplyHistory,
    ) -> StoreResult<ConfigurationApplyHistory> {
        self.check("create_apply_history")?;
        self.inner.create_apply_history(row).await
    }

    async fn update_apply_history(&self, row: &ConfigurationApplyHistory) -> StoreResult<()> {
        self.check("update_apply_history")?;
        self.inner.update_apply_history(row).await
    }

    async fn list_pending_apply_histories(&self) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check("list_pending_apply_histories")?;
        self.inner.list_pending_apply_histories().await
    }

    async fn list_apply_history_by_agent(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check("list_apply_history_by_agent")?;
        self.inner.list_apply_history_by_agent(agent_id).await
    }

    async fn list_apply_history_by_configuration(
        &self,
        name: &str,
    ) -> StoreResult<Vec<ConfigurationApplyHistory>> {
        self.check("list_apply_history_by_configuration")?;
        self.inner.list_apply_history_by_configuration(name).await
    }

    async fn create_connection_history(
        &self,
        row: AgentConnectionHistory,
    ) -> StoreResult<AgentConnectionHistory> {
        self.check("create_connection_history")?;
        self.inner.create_connection_history(row).await
    }

    async fn update_connection_history(&self, row: &AgentConnectionHistory) -> StoreResult<()> {
        self.check("update_connection_history")?;
        self.inner.update_connection_history(row).await
    }

    async fn get_active_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Option<AgentConnectionHistory>> {
        self.check("get_active_connection_history")?;
        self.inner.get_active_connection_history(agent_id).await
    }

    async fn list_connection_history(
        &self,
        agent_id: &str,
    ) -> StoreResult<Vec<AgentConnectionHistory>> {
        self.check("list_connection_history")?;
        self.inner.list_connection_history(agent_id).await
    }
}

/// Engine wired to a memory store, a manual clock and recording metrics.
///
/// The engine reaches the store through `faults`; `store` reads and writes
/// the same state without injected failures.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub faults: Arc<FlakyStore>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<RecordingMetrics>,
    pub server: ControlServer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_secret(secret: &str) -> Self {
        Self::with_config(ServerConfig {
            secret_key: Some(secret.to_string()),
            ..ServerConfig::default()
        })
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let faults = FlakyStore::new(store.clone());
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let server = ControlServer::new(&config, faults.clone(), clock.clone(), metrics.clone());
        Self {
            store,
            faults,
            clock,
            metrics,
            server,
        }
    }

    /// Feeds one message through the message hook.
    pub async fn send(
        &self,
        conn: &Arc<FakeConnection>,
        message: AgentToServer,
    ) -> Option<ServerToAgent> {
        self.server
            .callbacks()
            .on_message(conn.shared(), message)
            .await
    }

    pub async fn close(&self, conn: &Arc<FakeConnection>) {
        self.server.callbacks().on_close(conn.shared()).await;
    }

    pub async fn create_config(&self, name: &str, raw: &str, selector: &[(&str, &str)]) -> Configuration {
        let config = Configuration::new(name, "yaml", raw, selector_of(selector), self.clock.now());
        self.server.tracker().create(config).await.unwrap()
    }

    pub async fn agent(&self, n: u8) -> Agent {
        self.store.get_agent(&agent_id(n)).await.unwrap().unwrap()
    }

    /// Connection rows of agent `n` that are still open.
    pub async fn open_rows(&self, n: u8) -> usize {
        self.store
            .list_connection_history(&agent_id(n))
            .await
            .unwrap()
            .iter()
            .filter(|row| row.is_active())
            .count()
    }
}

pub fn selector_of(pairs: &[(&str, &str)]) -> Selector {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Instance identifier whose bytes are all `n`.
pub fn uid(n: u8) -> Vec<u8> {
    vec![n; 16]
}

pub fn agent_id(n: u8) -> String {
    crate::protocol::agent_id_from_uid(&uid(n)).unwrap()
}

/// A message from agent `n` reporting `labels`.
pub fn message(n: u8, labels: &[(&str, &str)]) -> AgentToServer {
    AgentToServer {
        instance_uid: uid(n),
        sequence_num: 1,
        agent_description: Some(AgentDescription {
            identifying_attributes: vec![
                KeyValue::string(ATTR_SERVICE_NAME, "otelcol"),
                KeyValue::string(ATTR_HOST_NAME, format!("host-{}", n)),
            ],
            non_identifying_attributes: labels
                .iter()
                .map(|(k, v)| KeyValue::string(*k, *v))
                .collect(),
        }),
        remote_config_status: None,
    }
}

/// A bare heartbeat from agent `n` with no description.
pub fn heartbeat(n: u8, sequence_num: u64) -> AgentToServer {
    AgentToServer {
        instance_uid: uid(n),
        sequence_num,
        agent_description: None,
        remote_config_status: None,
    }
}

pub fn with_status(
    mut msg: AgentToServer,
    hash: &str,
    status: RemoteConfigStatuses,
    error: &str,
) -> AgentToServer {
    msg.remote_config_status = Some(RemoteConfigStatus {
        last_remote_config_hash: hash.to_string(),
        status,
        error_message: error.to_string(),
    });
    msg
}
