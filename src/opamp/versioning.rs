//! Configuration versioning and apply-history tracking.

use crate::clock::SharedClock;
use crate::error::{ControlError, ControlResult};
use crate::model::{
    compute_config_hash, ApplyStatus, Configuration, ConfigurationApplyHistory,
    ConfigurationHistory,
};
use crate::store::{SharedStore, StoreResult};
use chrono::{DateTime, Utc};

/// Prepares `incoming` to replace `existing` and returns the history row to
/// append, if any.
///
/// A content hash change snapshots `existing` and bumps the version by one.
/// Otherwise the version is kept and no snapshot is taken. Stores call this
/// inside the transaction that writes `incoming`.
pub fn plan_update(
    existing: &Configuration,
    incoming: &mut Configuration,
    now: DateTime<Utc>,
) -> Option<ConfigurationHistory> {
    incoming.config_hash = compute_config_hash(&incoming.raw_config);
    incoming.created_at = existing.created_at;
    incoming.updated_at = now;
    if incoming.last_applied_at.is_none() {
        incoming.last_applied_at = existing.last_applied_at;
    }

    if incoming.config_hash == existing.config_hash {
        incoming.version = existing.version;
        return None;
    }

    incoming.version = existing.version + 1;
    Some(ConfigurationHistory::snapshot_of(existing))
}

/// Owns configuration versioning and the apply-history lifecycle.
#[derive(Clone)]
pub struct ConfigurationTracker {
    store: SharedStore,
    clock: SharedClock,
}

impl ConfigurationTracker {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn create(&self, mut config: Configuration) -> ControlResult<Configuration> {
        let now = self.clock.now();
        config.created_at = now;
        config.updated_at = now;
        config.last_applied_at = None;
        let stored = self.store.create_configuration(config).await?;
        tracing::info!(
            configuration = %stored.name,
            hash = %stored.config_hash,
            "Configuration created"
        );
        Ok(stored)
    }

    pub async fn update(&self, config: Configuration) -> ControlResult<Configuration> {
        let stored = self
            .store
            .update_configuration(config, self.clock.now())
            .await?;
        tracing::info!(
            configuration = %stored.name,
            version = stored.version,
            hash = %stored.config_hash,
            "Configuration updated"
        );
        Ok(stored)
    }

    /// Restores the content of `version` as a new version.
    ///
    /// The version counter never goes backwards: rolling back to version 1
    /// from version 2 produces version 3.
    pub async fn rollback(&self, name: &str, version: u32) -> ControlResult<Configuration> {
        let mut config = self
            .store
            .get_configuration(name)
            .await?
            .ok_or_else(|| ControlError::ConfigurationNotFound {
                name: name.to_string(),
            })?;
        let snapshot = self
            .store
            .get_configuration_history(name, version)
            .await?
            .ok_or_else(|| ControlError::VersionNotFound {
                name: name.to_string(),
                version,
            })?;

        config.content_type = snapshot.content_type;
        config.raw_config = snapshot.raw_config;
        config.selector = snapshot.selector;
        config.platform = snapshot.platform;

        tracing::info!(configuration = %name, target_version = version, "Rolling back configuration");
        self.update(config).await
    }

    pub async fn history(&self, name: &str) -> ControlResult<Vec<ConfigurationHistory>> {
        Ok(self.store.list_configuration_history(name).await?)
    }

    /// Records a push attempt before anything is sent.
    pub async fn start_apply(
        &self,
        agent_id: &str,
        config: &Configuration,
    ) -> StoreResult<ConfigurationApplyHistory> {
        let row =
            ConfigurationApplyHistory::new(agent_id, config, ApplyStatus::Pending, self.clock.now());
        self.store.create_apply_history(row).await
    }

    /// Moves `row` to `next` and persists it. Returns false, without a
    /// write, when the move is not allowed.
    pub async fn advance(
        &self,
        row: &mut ConfigurationApplyHistory,
        next: ApplyStatus,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        if !row.transition(next, error_message, self.clock.now()) {
            return Ok(false);
        }
        self.store.update_apply_history(row).await?;
        Ok(true)
    }

    /// Settles every outstanding row carrying `config_hash` with a terminal
    /// status reported by an agent. Returns the number of rows changed.
    ///
    /// Rows of every agent are considered, not only the reporter's.
    pub async fn reconcile(
        &self,
        config_hash: &str,
        status: ApplyStatus,
        error_message: Option<&str>,
    ) -> StoreResult<usize> {
        let mut settled = 0;
        for mut row in self.store.list_pending_apply_histories().await? {
            if row.config_hash != config_hash {
                continue;
            }
            if self.advance(&mut row, status, error_message).await? {
                settled += 1;
            }
        }
        Ok(settled)
    }
}
