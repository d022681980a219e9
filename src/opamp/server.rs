//! The control server facade mounted by the surrounding layers.

use super::callbacks::{Callbacks, SessionCallbacks};
use super::distributor::{ConfigDistributor, PushOutcome};
use super::heartbeat::HeartbeatMonitor;
use super::registry::ConnectionRegistry;
use super::sync::AgentSynchronizer;
use super::versioning::ConfigurationTracker;
use crate::clock::SharedClock;
use crate::config::ServerConfig;
use crate::error::{ControlError, ControlResult};
use crate::metrics::SharedMetrics;
use crate::model::AgentUpdate;
use crate::store::SharedStore;
use crate::transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub struct ControlServer {
    store: SharedStore,
    clock: SharedClock,
    metrics: SharedMetrics,
    registry: Arc<ConnectionRegistry>,
    tracker: ConfigurationTracker,
    distributor: Arc<ConfigDistributor>,
    callbacks: Arc<SessionCallbacks>,
    heartbeat: Arc<HeartbeatMonitor>,
    message_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub fn new(
        config: &ServerConfig,
        store: SharedStore,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = ConfigurationTracker::new(store.clone(), clock.clone());
        let distributor = Arc::new(ConfigDistributor::new(
            store.clone(),
            registry.clone(),
            tracker.clone(),
        ));
        let synchronizer =
            AgentSynchronizer::new(store.clone(), clock.clone(), metrics.clone(), tracker.clone());
        let callbacks = Arc::new(SessionCallbacks::new(
            config.secret_key.clone(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            registry.clone(),
            synchronizer,
            distributor.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            clock,
            metrics,
            registry,
            tracker,
            distributor,
            callbacks,
            heartbeat,
            message_timeout: config.message_timeout(),
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn tracker(&self) -> &ConfigurationTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// The transport hooks, for mounting on a transport.
    pub fn callbacks(&self) -> Arc<dyn Callbacks> {
        self.callbacks.clone()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.registry.is_connected(agent_id)
    }

    /// Sends `update` to the agent's live session. Fails with
    /// `NotConnected` if it has none.
    pub async fn send_update(&self, agent_id: &str, update: AgentUpdate) -> ControlResult<()> {
        self.distributor.send_update(agent_id, update).await
    }

    /// Pushes configuration `name` to one agent, or to every matching agent
    /// when `agent_id` is `None`.
    ///
    /// A single-agent push that fails is reported in `failed`, not as an
    /// error. Only a missing configuration or a store failure before any
    /// delivery is an error.
    pub async fn push_configuration(
        &self,
        name: &str,
        agent_id: Option<&str>,
    ) -> ControlResult<PushOutcome> {
        let config = self
            .store
            .get_configuration(name)
            .await?
            .ok_or_else(|| ControlError::ConfigurationNotFound {
                name: name.to_string(),
            })?;

        let outcome = match agent_id {
            Some(agent_id) => {
                let mut outcome = PushOutcome::default();
                match self.distributor.push_to_agent(&config, agent_id).await {
                    Ok(_) => outcome.succeeded.push(agent_id.to_string()),
                    Err(e) => {
                        tracing::warn!(agent_id, configuration = %name, error = %e, "Push failed");
                        outcome.failed.push(agent_id.to_string());
                    }
                }
                outcome
            }
            None => self.distributor.push_to_all(&config).await?,
        };

        if let Err(e) = self
            .store
            .mark_configuration_applied(name, self.clock.now())
            .await
        {
            tracing::error!(configuration = %name, error = %e, "Failed to record last applied time");
        }
        self.metrics
            .record_config_push(name, outcome.succeeded.len(), outcome.failed.len());
        tracing::info!(
            configuration = %name,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Configuration push finished"
        );
        Ok(outcome)
    }

    /// Starts background work. Returns false if already started.
    pub fn start(&self) -> bool {
        self.heartbeat.start()
    }

    /// Stops the heartbeat monitor and closes every live session.
    pub async fn stop(&self) {
        self.heartbeat.stop().await;
        let _ = self.shutdown_tx.send(());
    }

    /// Receiver that fires when [`ControlServer::stop`] is called.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Accepts agent sessions on `listener` until the server stops, then
    /// waits for open sessions to run their close hook.
    pub async fn serve(&self, listener: TcpListener) -> ControlResult<()> {
        transport::run_listener(
            listener,
            self.callbacks(),
            self.message_timeout,
            self.shutdown_tx.clone(),
        )
        .await
    }
}
