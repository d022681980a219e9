use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Disconnect reason written when the transport session closes.
pub const REASON_CONNECTION_CLOSED: &str = "connection closed";
/// Disconnect reason written by the heartbeat sweep.
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";
/// Disconnect reason written when sessions are recovered from a snapshot.
pub const REASON_SERVER_RESTART: &str = "server restart";

/// One connection session of an agent.
///
/// At most one row per agent has `disconnected_at == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConnectionHistory {
    pub id: u64,
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub disconnect_reason: Option<String>,
    #[serde(default)]
    pub remote_addr: String,
}

impl AgentConnectionHistory {
    pub fn open(
        agent_id: impl Into<String>,
        connected_at: DateTime<Utc>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            agent_id: agent_id.into(),
            connected_at,
            disconnected_at: None,
            duration_seconds: None,
            disconnect_reason: None,
            remote_addr: remote_addr.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Closes the session at `at`.
    pub fn close(&mut self, at: DateTime<Utc>, reason: &str) {
        self.disconnected_at = Some(at);
        self.disconnect_reason = Some(reason.to_string());
        self.calculate_duration();
    }

    /// Recomputes `duration_seconds`; clamped at zero if the clock went backwards.
    pub fn calculate_duration(&mut self) {
        if let Some(disconnected_at) = self.disconnected_at {
            let seconds = (disconnected_at - self.connected_at).num_seconds();
            self.duration_seconds = Some(seconds.max(0));
        }
    }
}
