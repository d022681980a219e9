//! RPC server implementation for the control service.
//!
//! Implements the tarpc ControlService trait on top of [`ControlServer`].

use crate::build_info::{BUILD_SHA, BUILD_TIMESTAMP};
use crate::model::{
    Agent, AgentConnectionHistory, AgentStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory,
};
use crate::opamp::{ControlServer, PushOutcome};
use crate::rpc::control_service::ControlService;
use crate::rpc::{AgentStatusSummary, BuildInfo, ConfigurationSpec, RpcError, RpcResult};
use futures::StreamExt;
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, Mutex};

/// Per-connection server for ControlService.
#[derive(Clone)]
pub struct ControlRpcServer {
    server: Arc<ControlServer>,
    /// Expected auth token for connections.
    expected_token: Option<String>,
    /// Whether this connection has been authenticated.
    authenticated: Arc<Mutex<bool>>,
}

impl ControlRpcServer {
    pub fn new(server: Arc<ControlServer>) -> Self {
        Self {
            server,
            expected_token: None,
            authenticated: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_auth_token(mut self, token: String) -> Self {
        self.expected_token = Some(token);
        self
    }

    async fn check_authenticated(&self) -> RpcResult<()> {
        if self.expected_token.is_some() {
            let auth = self.authenticated.lock().await;
            if !*auth {
                return Err(RpcError::AuthenticationFailed);
            }
        }
        Ok(())
    }
}

impl ControlService for ControlRpcServer {
    async fn authenticate(self, _: tarpc::context::Context, token: String) -> RpcResult<()> {
        match &self.expected_token {
            None => Ok(()),
            Some(expected) if token == *expected => {
                let mut auth = self.authenticated.lock().await;
                *auth = true;
                tracing::debug!("RPC client authenticated");
                Ok(())
            }
            Some(_) => {
                tracing::warn!("RPC client authentication failed");
                Err(RpcError::AuthenticationFailed)
            }
        }
    }

    async fn is_connected(self, _: tarpc::context::Context, agent_id: String) -> RpcResult<bool> {
        self.check_authenticated().await?;
        Ok(self.server.is_connected(&agent_id))
    }

    async fn list_agents(self, _: tarpc::context::Context) -> RpcResult<Vec<Agent>> {
        self.check_authenticated().await?;
        Ok(self.server.store().list_agents().await?)
    }

    async fn get_agent(
        self,
        _: tarpc::context::Context,
        agent_id: String,
    ) -> RpcResult<Option<Agent>> {
        self.check_authenticated().await?;
        Ok(self.server.store().get_agent(&agent_id).await?)
    }

    async fn list_agents_by_status(
        self,
        _: tarpc::context::Context,
        status: AgentStatus,
    ) -> RpcResult<Vec<Agent>> {
        self.check_authenticated().await?;
        let mut agents = self.server.store().list_agents().await?;
        agents.retain(|agent| agent.status == status);
        Ok(agents)
    }

    async fn agent_status_summary(
        self,
        _: tarpc::context::Context,
    ) -> RpcResult<AgentStatusSummary> {
        self.check_authenticated().await?;
        let agents = self.server.store().list_agents().await?;
        Ok(AgentStatusSummary::from_agents(&agents))
    }

    async fn get_configuration(
        self,
        _: tarpc::context::Context,
        name: String,
    ) -> RpcResult<Option<Configuration>> {
        self.check_authenticated().await?;
        Ok(self.server.store().get_configuration(&name).await?)
    }

    async fn list_configurations(
        self,
        _: tarpc::context::Context,
    ) -> RpcResult<Vec<Configuration>> {
        self.check_authenticated().await?;
        Ok(self.server.store().list_configurations().await?)
    }

    async fn create_configuration(
        self,
        _: tarpc::context::Context,
        spec: ConfigurationSpec,
    ) -> RpcResult<Configuration> {
        self.check_authenticated().await?;
        let config = spec.into_configuration(chrono::Utc::now());
        Ok(self.server.tracker().create(config).await?)
    }

    async fn update_configuration(
        self,
        _: tarpc::context::Context,
        spec: ConfigurationSpec,
    ) -> RpcResult<Configuration> {
        self.check_authenticated().await?;
        let mut config = self
            .server
            .store()
            .get_configuration(&spec.name)
            .await?
            .ok_or_else(|| RpcError::NotFound {
                message: format!("configuration not found: {}", spec.name),
            })?;
        spec.apply_to(&mut config);
        Ok(self.server.tracker().update(config).await?)
    }

    async fn rollback_configuration(
        self,
        _: tarpc::context::Context,
        name: String,
        version: u32,
    ) -> RpcResult<Configuration> {
        self.check_authenticated().await?;
        Ok(self.server.tracker().rollback(&name, version).await?)
    }

    async fn configuration_history(
        self,
        _: tarpc::context::Context,
        name: String,
    ) -> RpcResult<Vec<ConfigurationHistory>> {
        self.check_authenticated().await?;
        Ok(self.server.tracker().history(&name).await?)
    }

    async fn apply_history(
        self,
        _: tarpc::context::Context,
        agent_id: String,
    ) -> RpcResult<Vec<ConfigurationApplyHistory>> {
        self.check_authenticated().await?;
        Ok(self
            .server
            .store()
            .list_apply_history_by_agent(&agent_id)
            .await?)
    }

    async fn configuration_apply_history(
        self,
        _: tarpc::context::Context,
        name: String,
    ) -> RpcResult<Vec<ConfigurationApplyHistory>> {
        self.check_authenticated().await?;
        Ok(self
            .server
            .store()
            .list_apply_history_by_configuration(&name)
            .await?)
    }

    async fn connection_history(
        self,
        _: tarpc::context::Context,
        agent_id: String,
    ) -> RpcResult<Vec<AgentConnectionHistory>> {
        self.check_authenticated().await?;
        Ok(self.server.store().list_connection_history(&agent_id).await?)
    }

    async fn active_connection(
        self,
        _: tarpc::context::Context,
        agent_id: String,
    ) -> RpcResult<Option<AgentConnectionHistory>> {
        self.check_authenticated().await?;
        Ok(self
            .server
            .store()
            .get_active_connection_history(&agent_id)
            .await?)
    }

    async fn push_configuration(
        self,
        _: tarpc::context::Context,
        name: String,
        agent_id: Option<String>,
    ) -> RpcResult<PushOutcome> {
        self.check_authenticated().await?;
        Ok(self
            .server
            .push_configuration(&name, agent_id.as_deref())
            .await?)
    }

    async fn build_sha(self, _: tarpc::context::Context) -> String {
        BUILD_SHA.to_string()
    }

    async fn build_info(self, _: tarpc::context::Context) -> BuildInfo {
        BuildInfo {
            sha: BUILD_SHA.to_string(),
            timestamp: BUILD_TIMESTAMP,
        }
    }
}

/// Run the control RPC server (TCP) until `shutdown_tx` fires.
pub async fn run_rpc_server(
    server: Arc<ControlServer>,
    addr: &str,
    auth_token: Option<String>,
    shutdown_tx: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let mut listener = tcp::listen(addr, Bincode::default).await?;
    tracing::info!(addr = %listener.local_addr(), "RPC server listening");

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let mut rpc = ControlRpcServer::new(server.clone());
                        if let Some(token) = &auth_token {
                            rpc = rpc.with_auth_token(token.clone());
                        }

                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(rpc.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "RPC accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/rpc_server_tests.rs"]
mod tests;
