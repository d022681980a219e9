//! Metrics collaborator.
//!
//! The core only emits observations; aggregation and export belong to
//! whatever implements [`MetricsSink`].

use crate::model::AgentStatus;
use std::sync::Arc;

pub trait MetricsSink: Send + Sync {
    fn record_status_change(&self, agent_id: &str, from: AgentStatus, to: AgentStatus);

    /// Length of a closed connection session.
    fn record_connection_duration(&self, agent_id: &str, seconds: i64);

    /// Outcome of one manual or broadcast push.
    fn record_config_push(&self, configuration: &str, succeeded: usize, failed: usize);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Default sink that writes observations as debug events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_status_change(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) {
        tracing::debug!(agent_id, %from, %to, "metric: agent status change");
    }

    fn record_connection_duration(&self, agent_id: &str, seconds: i64) {
        tracing::debug!(agent_id, seconds, "metric: connection duration");
    }

    fn record_config_push(&self, configuration: &str, succeeded: usize, failed: usize) {
        tracing::debug!(configuration, succeeded, failed, "metric: configuration push");
    }
}
