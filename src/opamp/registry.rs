//! Live session registry.
//!
//! Two maps kept in sync under one lock: agent id to session, and session to
//! agent id. Nothing here is persisted; agents re-register when they
//! reconnect.

use crate::error::ControlResult;
use crate::protocol::ServerToAgent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifier of one transport session, unique for the process lifetime.
pub type SessionId = u64;

/// Outbound side of a live transport session.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Peer address as reported by the transport.
    fn remote_addr(&self) -> String;

    async fn send(&self, message: ServerToAgent) -> ControlResult<()>;
}

pub type SharedConnection = Arc<dyn AgentConnection>;

#[derive(Default)]
struct Maps {
    by_agent: HashMap<String, SharedConnection>,
    by_session: HashMap<SessionId, String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    maps: Mutex<Maps>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `agent_id` to `conn`, replacing any previous binding of either.
    pub fn register(&self, agent_id: &str, conn: SharedConnection) {
        let session = conn.session_id();
        let mut maps = self.maps.lock();

        if let Some(previous) = maps.by_agent.get(agent_id).map(|c| c.session_id()) {
            if previous != session {
                maps.by_session.remove(&previous);
            }
        }
        if let Some(previous_agent) = maps.by_session.get(&session).cloned() {
            if previous_agent != agent_id {
                maps.by_agent.remove(&previous_agent);
            }
        }

        maps.by_agent.insert(agent_id.to_string(), conn);
        maps.by_session.insert(session, agent_id.to_string());
    }

    /// Removes the session and returns the agent it was bound to.
    pub fn unregister(&self, session: SessionId) -> Option<String> {
        let mut maps = self.maps.lock();
        let agent_id = maps.by_session.remove(&session)?;
        maps.by_agent.remove(&agent_id);
        Some(agent_id)
    }

    pub fn lookup(&self, agent_id: &str) -> Option<SharedConnection> {
        self.maps.lock().by_agent.get(agent_id).cloned()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.maps.lock().by_agent.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every connected agent, sorted.
    pub fn connected_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.maps.lock().by_agent.keys().cloned().collect();
        ids.sort();
        ids
    }
}
