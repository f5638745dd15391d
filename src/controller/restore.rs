//! Restore lifecycle controller.
//!
//! Same phase machine as backups. A restore only leaves Pending once its
//! source backup is Completed with a snapshot identifier; that identifier is
//! copied onto the restore and handed to the agent.

use std::slice;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::lifecycle::{fold_signals, Transition};
use super::{error_condition, LifecycleOutcome};
use crate::agent::{AgentSignal, ExecutionAgent, JobKind, JobRequest};
use crate::config::OperatorConfig;
use crate::crd::{backup_phase, restore_phase, Backup, Phase, Restore, SITE_LABEL};
use crate::error::{Error, Result};
use crate::store::{record_key, ResourceStore};

/// Drives Restore records through their phases from agent signals.
pub struct RestoreLifecycle {
    restores: Arc<dyn ResourceStore<Restore>>,
    backups: Arc<dyn ResourceStore<Backup>>,
}

impl RestoreLifecycle {
    pub fn new(
        restores: Arc<dyn ResourceStore<Restore>>,
        backups: Arc<dyn ResourceStore<Backup>>,
    ) -> Self {
        Self { restores, backups }
    }

    /// Look up the backup a restore reads from and return its snapshot id.
    pub async fn resolve_source(&self, restore: &Restore) -> Result<String> {
        let namespace = restore.namespace().unwrap_or_default();
        let backup_name = &restore.spec.backup_name;

        let backup = self
            .backups
            .get(&namespace, backup_name)
            .await?
            .ok_or_else(|| Error::SourceNotFound {
                restore: record_key(restore),
                backup: backup_name.clone(),
            })?;

        let phase = backup_phase(&backup);
        if phase != Phase::Completed {
            return Err(Error::SourceNotCompleted {
                restore: record_key(restore),
                backup: backup_name.clone(),
                phase,
            });
        }

        backup
            .status
            .and_then(|s| s.restic_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::SourceMissingSnapshot {
                restore: record_key(restore),
                backup: backup_name.clone(),
            })
    }

    /// Apply a single agent signal to a restore.
    pub async fn apply_signal(
        &self,
        restore: &Restore,
        signal: &AgentSignal,
        config: &OperatorConfig,
    ) -> Result<Transition> {
        self.apply_signals(restore, slice::from_ref(signal), config)
            .await
    }

    /// Apply agent signals in order and write the resulting status once.
    ///
    /// Leaving Pending re-checks the source backup, so a restore never starts
    /// from a backup that is missing or unfinished.
    pub async fn apply_signals(
        &self,
        restore: &Restore,
        signals: &[AgentSignal],
        config: &OperatorConfig,
    ) -> Result<Transition> {
        let name = restore.name_any();
        let current = restore.status.clone().unwrap_or_default();
        let mut base = current.clone();
        if let Some(last) = signals.last() {
            base.clear_error(last.timestamp);
        }

        let mut status = match fold_signals(JobKind::Restore, &name, &base, signals)? {
            Transition::Advanced(status) => status,
            Transition::Unchanged => return Ok(Transition::Unchanged),
        };

        if current.phase == Phase::Pending {
            status.restic_id = Some(self.resolve_source(restore).await?);
        }

        if config.dry_run {
            info!(
                restore = %record_key(restore),
                from = %current.phase,
                to = %status.phase,
                "Dry run: would update restore status"
            );
            return Ok(Transition::Advanced(status));
        }

        let mut updated = restore.clone();
        updated.status = Some(status.clone());
        self.restores.update_status(&updated).await?;
        info!(
            restore = %record_key(restore),
            backup = %restore.spec.backup_name,
            from = %current.phase,
            to = %status.phase,
            "Restore phase advanced"
        );

        Ok(Transition::Advanced(status))
    }

    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        agent: &dyn ExecutionAgent,
        config: &OperatorConfig,
    ) -> Result<LifecycleOutcome> {
        let Some(restore) = self.restores.get(namespace, name).await? else {
            debug!(namespace = %namespace, name = %name, "Restore no longer exists");
            return Ok(LifecycleOutcome::missing());
        };

        let phase = restore_phase(&restore);
        if phase.is_terminal() {
            return Ok(LifecycleOutcome::settled(phase));
        }

        if phase == Phase::Pending {
            let snapshot = self.resolve_source(&restore).await?;
            if config.dry_run {
                info!(
                    restore = %record_key(&restore),
                    snapshot = %snapshot,
                    "Dry run: would submit restore job"
                );
                return Ok(LifecycleOutcome::settled(phase));
            }
            agent.submit(&job_request(&restore, snapshot)).await?;
        } else if config.dry_run {
            return Ok(LifecycleOutcome::settled(phase));
        }

        let signals = agent.poll(JobKind::Restore, namespace, name).await?;
        let transition = self.apply_signals(&restore, &signals, config).await?;

        Ok(LifecycleOutcome::after(phase, transition, config.resync_interval))
    }

    /// Record a permanent error on the restore as `Ready=False`, so a bad
    /// source stays visible until the restore is corrected. Writes only when
    /// the condition changes and never touches a terminal record.
    pub async fn report_error(
        &self,
        namespace: &str,
        name: &str,
        error: &Error,
        now: DateTime<Utc>,
        config: &OperatorConfig,
    ) -> Result<()> {
        if config.dry_run {
            return Ok(());
        }
        let Some(record) = self.restores.get(namespace, name).await? else {
            return Ok(());
        };

        let mut status = record.status.clone().unwrap_or_default();
        if status.phase.is_terminal() || !status.set_condition(error_condition(error, now)) {
            return Ok(());
        }

        let mut updated = record;
        updated.status = Some(status);
        self.restores.update_status(&updated).await?;
        info!(
            restore = %record_key(&updated),
            reason = error.reason(),
            "Restore error recorded"
        );
        Ok(())
    }
}

fn job_request(restore: &Restore, snapshot: String) -> JobRequest {
    JobRequest {
        kind: JobKind::Restore,
        namespace: restore.namespace().unwrap_or_default(),
        name: restore.name_any(),
        site: restore.labels().get(SITE_LABEL).cloned(),
        volumes: restore.spec.volumes.clone(),
        mysql: restore.spec.mysql.clone(),
        snapshot_id: Some(snapshot),
        owner: restore.controller_owner_ref(&()),
    }
}
