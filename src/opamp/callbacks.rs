//! Transport lifecycle hooks: connecting, message, close.

use super::distributor::ConfigDistributor;
use super::registry::{ConnectionRegistry, SharedConnection};
use super::sync::AgentSynchronizer;
use crate::clock::SharedClock;
use crate::error::{ControlError, ControlResult};
use crate::metrics::SharedMetrics;
use crate::model::{AgentStatus, REASON_CONNECTION_CLOSED};
use crate::protocol::{
    AgentToServer, ConnectRequest, ConnectResponse, ServerToAgent, BEARER_PREFIX,
    HEADER_AUTHORIZATION, HEADER_SECRET_KEY,
};
use crate::store::{SharedStore, StoreResult};
use async_trait::async_trait;
use std::sync::Arc;

/// The hooks a transport drives for every session.
///
/// `on_message` is never invoked concurrently for the same session.
#[async_trait]
pub trait Callbacks: Send + Sync {
    /// Admission check, made before any other hook for the session.
    fn on_connecting(&self, request: &ConnectRequest) -> ConnectResponse;

    /// Handles one inbound message and returns the reply, if any.
    async fn on_message(
        &self,
        conn: SharedConnection,
        message: AgentToServer,
    ) -> Option<ServerToAgent>;

    async fn on_close(&self, conn: SharedConnection);
}

/// Checks the shared secret carried by a connect request.
///
/// Without a configured secret every session is admitted.
pub fn authorize(secret_key: Option<&str>, request: &ConnectRequest) -> ControlResult<()> {
    let Some(secret) = secret_key.filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let provided = request.header(HEADER_SECRET_KEY).or_else(|| {
        request
            .header(HEADER_AUTHORIZATION)
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
    });
    match provided {
        Some(token) if token == secret => Ok(()),
        _ => Err(ControlError::AuthRejected),
    }
}

/// Agent id of a message, or `MalformedMessage` when it has no valid
/// instance identifier.
pub fn message_agent_id(message: &AgentToServer) -> ControlResult<String> {
    message.agent_id().ok_or_else(|| {
        ControlError::MalformedMessage(format!(
            "instance uid has {} bytes, expected 16",
            message.instance_uid.len()
        ))
    })
}

pub struct SessionCallbacks {
    secret_key: Option<String>,
    store: SharedStore,
    clock: SharedClock,
    metrics: SharedMetrics,
    registry: Arc<ConnectionRegistry>,
    synchronizer: AgentSynchronizer,
    distributor: Arc<ConfigDistributor>,
}

impl SessionCallbacks {
    pub fn new(
        secret_key: Option<String>,
        store: SharedStore,
        clock: SharedClock,
        metrics: SharedMetrics,
        registry: Arc<ConnectionRegistry>,
        synchronizer: AgentSynchronizer,
        distributor: Arc<ConfigDistributor>,
    ) -> Self {
        Self {
            secret_key,
            store,
            clock,
            metrics,
            registry,
            synchronizer,
            distributor,
        }
    }

    async fn mark_disconnected(&self, agent_id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let previous = self.store.get_agent(agent_id).await?.map(|a| a.status);

        self.store
            .update_agent_status(agent_id, AgentStatus::Offline, now)
            .await?;
        if let Err(e) = self
            .store
            .set_disconnect_reason(agent_id, REASON_CONNECTION_CLOSED)
            .await
        {
            tracing::error!(agent_id, error = %e, "Failed to record disconnect reason");
        }
        if let Some(from) = previous.filter(|s| *s != AgentStatus::Offline) {
            self.metrics
                .record_status_change(agent_id, from, AgentStatus::Offline);
        }

        if let Some(mut row) = self.store.get_active_connection_history(agent_id).await? {
            row.close(now, REASON_CONNECTION_CLOSED);
            self.store.update_connection_history(&row).await?;
            if let Some(seconds) = row.duration_seconds {
                self.metrics.record_connection_duration(agent_id, seconds);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Callbacks for SessionCallbacks {
    fn on_connecting(&self, request: &ConnectRequest) -> ConnectResponse {
        match authorize(self.secret_key.as_deref(), request) {
            Ok(()) => ConnectResponse::accept(),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected agent session");
                ConnectResponse::unauthorized()
            }
        }
    }

    async fn on_message(
        &self,
        conn: SharedConnection,
        message: AgentToServer,
    ) -> Option<ServerToAgent> {
        let agent_id = match message_agent_id(&message) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session = conn.session_id(), error = %e, "Dropping message");
                return None;
            }
        };
        tracing::debug!(agent_id = %agent_id, seq = message.sequence_num, "Message received");

        self.registry.register(&agent_id, Arc::clone(&conn));

        let agent = match self
            .synchronizer
            .sync(&agent_id, &message, &conn.remote_addr())
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "Failed to sync agent state");
                return None;
            }
        };

        match self.distributor.inline_response(&agent, &message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "Failed to resolve configuration");
                None
            }
        }
    }

    async fn on_close(&self, conn: SharedConnection) {
        let Some(agent_id) = self.registry.unregister(conn.session_id()) else {
            return;
        };
        tracing::info!(agent_id = %agent_id, "Agent session closed");

        if let Err(e) = self.mark_disconnected(&agent_id).await {
            tracing::error!(agent_id = %agent_id, error = %e, "Failed to record disconnect");
        }
    }
}
