//! Backup lifecycle controller.

use std::slice;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::lifecycle::{fold_signals, Transition};
use super::{error_condition, LifecycleOutcome};
use crate::agent::{AgentSignal, ExecutionAgent, JobKind, JobRequest};
use crate::config::OperatorConfig;
use crate::crd::{backup_phase, Backup, Phase, SITE_LABEL};
use crate::error::{Error, Result};
use crate::store::{record_key, ResourceStore};

/// Drives Backup records through their phases from agent signals.
pub struct BackupLifecycle {
    backups: Arc<dyn ResourceStore<Backup>>,
}

impl BackupLifecycle {
    pub fn new(backups: Arc<dyn ResourceStore<Backup>>) -> Self {
        Self { backups }
    }

    /// Apply a single agent signal to a backup.
    pub async fn apply_signal(
        &self,
        backup: &Backup,
        signal: &AgentSignal,
        config: &OperatorConfig,
    ) -> Result<Transition> {
        self.apply_signals(backup, slice::from_ref(signal), config)
            .await
    }

    /// Apply agent signals in order and write the resulting status once,
    /// conditional on the version the backup was read at.
    pub async fn apply_signals(
        &self,
        backup: &Backup,
        signals: &[AgentSignal],
        config: &OperatorConfig,
    ) -> Result<Transition> {
        let name = backup.name_any();
        let current = backup.status.clone().unwrap_or_default();
        let mut base = current.clone();
        if let Some(last) = signals.last() {
            base.clear_error(last.timestamp);
        }
        let transition = fold_signals(JobKind::Backup, &name, &base, signals)?;

        if let Transition::Advanced(status) = &transition {
            if config.dry_run {
                info!(
                    backup = %record_key(backup),
                    from = %current.phase,
                    to = %status.phase,
                    "Dry run: would update backup status"
                );
                return Ok(transition);
            }

            let mut updated = backup.clone();
            updated.status = Some(status.clone());
            self.backups.update_status(&updated).await?;
            info!(
                backup = %record_key(backup),
                from = %current.phase,
                to = %status.phase,
                "Backup phase advanced"
            );
        }

        Ok(transition)
    }

    /// Submit pending work to the agent, then fold in whatever the agent has
    /// reported since the last pass.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        agent: &dyn ExecutionAgent,
        config: &OperatorConfig,
    ) -> Result<LifecycleOutcome> {
        let Some(backup) = self.backups.get(namespace, name).await? else {
            debug!(namespace = %namespace, name = %name, "Backup no longer exists");
            return Ok(LifecycleOutcome::missing());
        };

        let phase = backup_phase(&backup);
        if phase.is_terminal() {
            return Ok(LifecycleOutcome::settled(phase));
        }

        if config.dry_run {
            info!(
                backup = %record_key(&backup),
                phase = %phase,
                "Dry run: would submit and poll agent job"
            );
            return Ok(LifecycleOutcome::settled(phase));
        }

        if phase == Phase::Pending {
            agent.submit(&job_request(&backup)).await?;
        }

        let signals = agent.poll(JobKind::Backup, namespace, name).await?;
        let transition = self.apply_signals(&backup, &signals, config).await?;

        Ok(LifecycleOutcome::after(phase, transition, config.resync_interval))
    }

    /// Record a permanent error on the backup as `Ready=False`. Writes only
    /// when the condition changes and never touches a terminal record.
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
        let Some(record) = self.backups.get(namespace, name).await? else {
            return Ok(());
        };

        let mut status = record.status.clone().unwrap_or_default();
        if status.phase.is_terminal() || !status.set_condition(error_condition(error, now)) {
            return Ok(());
        }

        let mut updated = record;
        updated.status = Some(status);
        self.backups.update_status(&updated).await?;
        Ok(())
    }
}

fn job_request(backup: &Backup) -> JobRequest {
    JobRequest {
        kind: JobKind::Backup,
        namespace: backup.namespace().unwrap_or_default(),
        name: backup.name_any(),
        site: backup.labels().get(SITE_LABEL).cloned(),
        volumes: backup.spec.volumes.clone(),
        mysql: backup.spec.mysql.clone(),
        snapshot_id: None,
        owner: backup.controller_owner_ref(&()),
    }
}
