//! Merges inbound agent messages into the persisted agent record.

use super::versioning::ConfigurationTracker;
use crate::clock::SharedClock;
use crate::metrics::SharedMetrics;
use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, ApplyStatus, Labels, REASON_CONNECTION_CLOSED,
};
use crate::protocol::{
    AgentDescription, AgentToServer, RemoteConfigStatuses, ATTR_HOST_ARCH, ATTR_HOST_NAME,
    ATTR_OS_TYPE, ATTR_SERVICE_NAME, ATTR_SERVICE_VERSION,
};
use crate::store::{SharedStore, StoreResult};
use chrono::{DateTime, Utc};

pub struct AgentSynchronizer {
    store: SharedStore,
    clock: SharedClock,
    metrics: SharedMetrics,
    tracker: ConfigurationTracker,
}

impl AgentSynchronizer {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        metrics: SharedMetrics,
        tracker: ConfigurationTracker,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            tracker,
        }
    }

    /// Applies `message` to the agent and returns the stored record.
    pub async fn sync(
        &self,
        agent_id: &str,
        message: &AgentToServer,
        remote_addr: &str,
    ) -> StoreResult<Agent> {
        let now = self.clock.now();
        let mut agent = match self.store.get_agent(agent_id).await? {
            Some(agent) => agent,
            None => {
                tracing::info!(agent_id, "Discovered new agent");
                Agent::new(agent_id, now)
            }
        };

        if let Some(description) = &message.agent_description {
            apply_description(&mut agent, description);
        }

        let previous = agent.status;
        let connected = previous == AgentStatus::Offline;
        if connected {
            agent.status = AgentStatus::Online;
            agent.last_connected_at = Some(now);
            agent.disconnect_reason = None;
        }
        agent.last_seen_at = Some(now);

        let mut settle = None;
        if let Some(status) = &message.remote_config_status {
            match status.status {
                RemoteConfigStatuses::Failed => {
                    agent.status = AgentStatus::Error;
                    settle = Some((ApplyStatus::Failed, status));
                }
                RemoteConfigStatuses::Applied => settle = Some((ApplyStatus::Applied, status)),
                RemoteConfigStatuses::Applying | RemoteConfigStatuses::Unset => {}
            }
        }

        agent.sequence_number = message.sequence_num;
        agent.updated_at = now;
        self.store.upsert_agent(&agent).await?;

        if connected {
            tracing::info!(agent_id, remote_addr, "Agent online");
        }
        if let Err(e) = self.track_session(&agent, connected, now, remote_addr).await {
            tracing::error!(agent_id, error = %e, "Failed to record connection session");
        }
        if previous != agent.status {
            self.metrics
                .record_status_change(agent_id, previous, agent.status);
        }

        if let Some((outcome, status)) = settle {
            let error = Some(status.error_message.as_str()).filter(|m| !m.is_empty());
            let settled = self
                .tracker
                .reconcile(&status.last_remote_config_hash, outcome, error)
                .await?;
            match outcome {
                ApplyStatus::Failed => tracing::warn!(
                    agent_id,
                    hash = %status.last_remote_config_hash,
                    error = %status.error_message,
                    settled,
                    "Agent reported failed configuration"
                ),
                _ => tracing::debug!(
                    agent_id,
                    hash = %status.last_remote_config_hash,
                    settled,
                    "Agent reported applied configuration"
                ),
            }
        }

        Ok(agent)
    }

    /// Keeps one open connection row for a live agent.
    ///
    /// A fresh connect first closes any row an earlier disconnect failed to
    /// close. A live agent with no open row gets one, so a failed insert is
    /// repaired by the next message.
    async fn track_session(
        &self,
        agent: &Agent,
        connected: bool,
        now: DateTime<Utc>,
        remote_addr: &str,
    ) -> StoreResult<()> {
        match self.store.get_active_connection_history(&agent.id).await? {
            Some(_) if !connected => return Ok(()),
            Some(mut stale) => {
                let closed_at = agent
                    .last_disconnected_at
                    .filter(|at| *at >= stale.connected_at)
                    .unwrap_or(now);
                stale.close(closed_at, REASON_CONNECTION_CLOSED);
                self.store.update_connection_history(&stale).await?;
                tracing::warn!(agent_id = %agent.id, row = stale.id, "Closed leftover connection row");
            }
            None if !connected => {
                tracing::warn!(agent_id = %agent.id, "Reopening missing connection row");
            }
            None => {}
        }

        let row = AgentConnectionHistory::open(agent.id.as_str(), now, remote_addr);
        self.store.create_connection_history(row).await?;
        Ok(())
    }
}

/// Identity attributes overwrite agent fields; non-identifying attributes
/// replace the label set as a whole.
fn apply_description(agent: &mut Agent, description: &AgentDescription) {
    for kv in &description.identifying_attributes {
        let value = kv.value.render();
        match kv.key.as_str() {
            ATTR_SERVICE_NAME => agent.name = value,
            ATTR_SERVICE_VERSION => agent.version = value,
            ATTR_HOST_NAME => agent.hostname = value,
            ATTR_HOST_ARCH => agent.architecture = value,
            ATTR_OS_TYPE => agent.os_type = value,
            _ => {}
        }
    }

    agent.labels = description
        .non_identifying_attributes
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.render()))
        .collect::<Labels>();
}
