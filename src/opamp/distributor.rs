//! Configuration resolution and delivery.

use super::registry::ConnectionRegistry;
use super::versioning::ConfigurationTracker;
use crate::error::{ControlError, ControlResult};
use crate::model::{Agent, AgentUpdate, ApplyStatus, Configuration, ConfigurationApplyHistory};
use crate::protocol::{
    uid_from_agent_id, AgentRemoteConfig, AgentToServer, ServerToAgent, FLAG_REPORT_FULL_STATE,
};
use crate::store::{SharedStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration `agent` should run.
///
/// An explicit assignment is looked up by exact name and wins even when it
/// is missing. Otherwise the first configuration, in the order given, whose
/// selector matches the agent's labels.
pub fn resolve<'a>(agent: &Agent, configurations: &'a [Configuration]) -> Option<&'a Configuration> {
    if let Some(name) = &agent.configuration_name {
        return configurations.iter().find(|c| &c.name == name);
    }
    configurations.iter().find(|c| c.matches_agent(agent))
}

/// Message delivering `config` to the agent identified by `instance_uid`.
pub fn config_message(instance_uid: Vec<u8>, config: &Configuration) -> ServerToAgent {
    ServerToAgent {
        instance_uid,
        remote_config: Some(AgentRemoteConfig::single_file(
            &config.raw_config,
            &config.content_type,
            &config.config_hash,
        )),
        flags: FLAG_REPORT_FULL_STATE,
    }
}

/// Result of a manual or broadcast push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct ConfigDistributor {
    store: SharedStore,
    registry: Arc<ConnectionRegistry>,
    tracker: ConfigurationTracker,
}

impl ConfigDistributor {
    pub fn new(
        store: SharedStore,
        registry: Arc<ConnectionRegistry>,
        tracker: ConfigurationTracker,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
        }
    }

    /// Response to an inbound message: the resolved configuration when its
    /// hash differs from what the agent last reported, nothing otherwise.
    pub async fn inline_response(
        &self,
        agent: &Agent,
        message: &AgentToServer,
    ) -> StoreResult<Option<ServerToAgent>> {
        let configurations = self.store.list_configurations().await?;
        let Some(config) = resolve(agent, &configurations) else {
            return Ok(None);
        };
        if message.reported_hash() == config.config_hash {
            return Ok(None);
        }

        tracing::info!(
            agent_id = %agent.id,
            configuration = %config.name,
            hash = %config.config_hash,
            "Sending configuration"
        );
        Ok(Some(config_message(message.instance_uid.clone(), config)))
    }

    /// Delivers `update` to a connected agent.
    ///
    /// `update.labels` is not sent. Without a configuration the agent is
    /// asked to report its full state.
    pub async fn send_update(&self, agent_id: &str, update: AgentUpdate) -> ControlResult<()> {
        let conn = self
            .registry
            .lookup(agent_id)
            .ok_or_else(|| ControlError::NotConnected {
                agent_id: agent_id.to_string(),
            })?;

        let instance_uid = uid_from_agent_id(agent_id).unwrap_or_default();
        let message = match &update.configuration {
            Some(config) => config_message(instance_uid, config),
            None => ServerToAgent {
                instance_uid,
                remote_config: None,
                flags: FLAG_REPORT_FULL_STATE,
            },
        };
        conn.send(message).await
    }

    /// Pushes `config` to one agent, tracking the attempt in apply history.
    ///
    /// The row starts pending, becomes applying once the agent is known to be
    /// connected, and fails right away when it is not or the send errors.
    pub async fn push_to_agent(
        &self,
        config: &Configuration,
        agent_id: &str,
    ) -> ControlResult<ConfigurationApplyHistory> {
        let mut row = self.tracker.start_apply(agent_id, config).await?;

        if !self.registry.is_connected(agent_id) {
            let err = ControlError::NotConnected {
                agent_id: agent_id.to_string(),
            };
            self.tracker
                .advance(&mut row, ApplyStatus::Failed, Some(&err.to_string()))
                .await?;
            return Err(err);
        }

        self.tracker
            .advance(&mut row, ApplyStatus::Applying, None)
            .await?;
        let update = AgentUpdate::with_configuration(config.clone());
        if let Err(e) = self.send_update(agent_id, update).await {
            self.tracker
                .advance(&mut row, ApplyStatus::Failed, Some(&e.to_string()))
                .await?;
            return Err(e);
        }

        tracing::info!(agent_id, configuration = %config.name, "Pushed configuration");
        Ok(row)
    }

    /// Pushes `config` to every agent its selector matches, one at a time.
    ///
    /// Matching agents without a live session end up in `failed`. A failure
    /// for one agent never stops the others.
    pub async fn push_to_all(&self, config: &Configuration) -> StoreResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        for agent in self.store.list_agents().await? {
            if !config.matches_agent(&agent) {
                continue;
            }
            match self.push_to_agent(config, &agent.id).await {
                Ok(_) => outcome.succeeded.push(agent.id),
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, error = %e, "Push failed");
                    outcome.failed.push(agent.id);
                }
            }
        }
        Ok(outcome)
    }
}
