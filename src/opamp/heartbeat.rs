//! Background sweep that demotes agents which stopped talking.

use crate::clock::SharedClock;
use crate::metrics::SharedMetrics;
use crate::model::{Agent, AgentStatus, REASON_HEARTBEAT_TIMEOUT};
use crate::store::{SharedStore, StoreResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Periodic liveness check. Runs once: after [`HeartbeatMonitor::stop`] it
/// cannot be started again.
pub struct HeartbeatMonitor {
    store: SharedStore,
    clock: SharedClock,
    metrics: SharedMetrics,
    interval: Duration,
    timeout: Duration,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        metrics: SharedMetrics,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            store,
            clock,
            metrics,
            interval,
            timeout,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawns the sweep loop. Returns false if it was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(mut stop_rx) = self.stop_rx.lock().take() else {
            tracing::warn!("Heartbeat monitor already started");
            return false;
        };

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + monitor.interval;
            let mut ticker = tokio::time::interval_at(start, monitor.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sweep().await {
                            tracing::error!(error = %e, "Heartbeat sweep failed");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            tracing::debug!("Heartbeat monitor stopped");
        });
        *self.handle.lock() = Some(handle);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Heartbeat monitor started"
        );
        true
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One pass: every online agent last seen before now minus the timeout
    /// goes offline. Returns how many agents were demoted.
    pub async fn sweep(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.store.list_stale_agents(threshold).await?;
        let mut demoted = 0;
        for agent in &stale {
            match self.demote(agent).await {
                Ok(()) => demoted += 1,
                Err(e) => {
                    tracing::error!(agent_id = %agent.id, error = %e, "Failed to mark agent offline");
                }
            }
        }

        if !stale.is_empty() {
            tracing::info!(stale = stale.len(), demoted, "Heartbeat sweep complete");
        }
        Ok(demoted)
    }

    async fn demote(&self, agent: &Agent) -> StoreResult<()> {
        let now = self.clock.now();
        tracing::warn!(
            agent_id = %agent.id,
            last_seen = ?agent.last_seen_at,
            "Agent heartbeat timeout"
        );

        self.store
            .update_agent_status(&agent.id, AgentStatus::Offline, now)
            .await?;
        // The session row must still close once the agent is offline
        if let Err(e) = self
            .store
            .set_disconnect_reason(&agent.id, REASON_HEARTBEAT_TIMEOUT)
            .await
        {
            tracing::error!(agent_id = %agent.id, error = %e, "Failed to record disconnect reason");
        }
        self.metrics
            .record_status_change(&agent.id, agent.status, AgentStatus::Offline);

        if let Some(mut row) = self.store.get_active_connection_history(&agent.id).await? {
            row.close(now, REASON_HEARTBEAT_TIMEOUT);
            self.store.update_connection_history(&row).await?;
            if let Some(seconds) = row.duration_seconds {
                self.metrics.record_connection_duration(&agent.id, seconds);
            }
        }
        Ok(())
    }
}
