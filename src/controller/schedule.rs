//! Schedule reconciler.
//!
//! Evaluates a BackupScheduled against the clock and, when an occurrence has
//! passed, creates one Backup for the site and advances `lastExecutedTime`.
//!
//! Backups are named after the schedule and the occurrence they cover. A pass
//! that created the backup but failed to record `lastExecutedTime` is retried
//! against the same baseline, computes the same occurrence, and finds the
//! backup already there instead of creating a second one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::error_condition;
use crate::config::OperatorConfig;
use crate::crd::{
    Backup, BackupScheduled, BackupSpec, Condition, MANAGED_BY_LABEL, MANAGER_NAME,
    READY_CONDITION, SCHEDULE_LABEL, SITE_LABEL,
};
use crate::error::{Error, Result};
use crate::scheduling::decide;
use crate::sites::SiteDirectory;
use crate::store::{record_key, ResourceStore};

/// Longest schedule name kept in a backup name, leaving room for the
/// occurrence suffix and the agent job prefix within 63 characters.
const MAX_SCHEDULE_PREFIX: usize = 45;

/// What a schedule pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// When to evaluate the schedule again; `None` when the record is gone.
    pub requeue_after: Option<Duration>,
    /// Name of the backup this pass triggered.
    pub triggered: Option<String>,
}

pub struct ScheduleReconciler {
    schedules: Arc<dyn ResourceStore<BackupScheduled>>,
    backups: Arc<dyn ResourceStore<Backup>>,
    sites: Arc<dyn SiteDirectory>,
}

impl ScheduleReconciler {
    pub fn new(
        schedules: Arc<dyn ResourceStore<BackupScheduled>>,
        backups: Arc<dyn ResourceStore<Backup>>,
        sites: Arc<dyn SiteDirectory>,
    ) -> Self {
        Self {
            schedules,
            backups,
            sites,
        }
    }

    /// Load a schedule and reconcile it at `now`.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
        config: &OperatorConfig,
    ) -> Result<ScheduleOutcome> {
        match self.schedules.get(namespace, name).await? {
            Some(record) => self.reconcile_record(&record, now, config).await,
            None => {
                debug!(namespace = %namespace, name = %name, "BackupScheduled no longer exists");
                Ok(ScheduleOutcome::default())
            }
        }
    }

    /// Reconcile a schedule as read at a particular version.
    pub async fn reconcile_record(
        &self,
        record: &BackupScheduled,
        now: DateTime<Utc>,
        config: &OperatorConfig,
    ) -> Result<ScheduleOutcome> {
        let key = record_key(record);
        let namespace = record.namespace().unwrap_or_default();
        let schedule_name = record.name_any();

        let site = record
            .labels()
            .get(SITE_LABEL)
            .filter(|site| !site.is_empty())
            .cloned()
            .ok_or_else(|| Error::MissingLabel {
                kind: "BackupScheduled",
                name: key.clone(),
                label: SITE_LABEL,
            })?;

        let schedule = record.spec.schedule.trim();
        if schedule.is_empty() {
            return Err(Error::MissingSchedule(key));
        }

        let mut status = record.status.clone().unwrap_or_default();
        let decision = decide(schedule, status.last_executed_time, now)?;

        if !decision.due {
            debug!(schedule = %key, next_due = %decision.next_due, "Not due yet");
            let stale = status
                .condition(READY_CONDITION)
                .map_or(false, |c| !c.is_true());
            if stale && !config.dry_run {
                status.set_condition(ready_condition(now));
                let mut updated = record.clone();
                updated.status = Some(status);
                self.schedules.update_status(&updated).await?;
                info!(schedule = %key, "Schedule is valid again");
            }
            return Ok(ScheduleOutcome {
                requeue_after: Some(decision.requeue_after(now)),
                triggered: None,
            });
        }

        let backup_name = backup_name(&schedule_name, decision.next_due);
        let requeue_after = Some(decide(schedule, Some(now), now)?.requeue_after(now));

        if config.dry_run {
            info!(
                schedule = %key,
                backup = %backup_name,
                occurrence = %decision.next_due,
                "Dry run: would create backup and record execution"
            );
            return Ok(ScheduleOutcome {
                requeue_after,
                triggered: Some(backup_name),
            });
        }

        let targets = self.sites.targets(&namespace, &site).await?;
        if targets.is_empty() {
            warn!(schedule = %key, site = %site, "Site has no volumes or databases to back up");
        }

        let mut labels = BTreeMap::new();
        labels.insert(SITE_LABEL.to_string(), site.clone());
        labels.insert(SCHEDULE_LABEL.to_string(), schedule_name.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());

        let mut backup = Backup::new(
            &backup_name,
            BackupSpec {
                volumes: targets.volumes,
                mysql: targets.mysql,
                schedule_ref: Some(schedule_name.clone()),
            },
        );
        backup.metadata.namespace = Some(namespace.clone());
        backup.metadata.labels = Some(labels);

        match self.backups.create(&backup).await {
            Ok(_) => info!(
                schedule = %key,
                backup = %backup_name,
                site = %site,
                occurrence = %decision.next_due,
                "Backup created"
            ),
            Err(Error::AlreadyExists(_)) => {
                debug!(
                    schedule = %key,
                    backup = %backup_name,
                    "Backup for this occurrence already exists"
                )
            }
            Err(e) => return Err(e),
        }

        let executed = match status.last_executed_time {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        status.last_executed_time = Some(executed);
        status.set_condition(ready_condition(now));

        let mut updated = record.clone();
        updated.status = Some(status);
        self.schedules.update_status(&updated).await?;

        Ok(ScheduleOutcome {
            requeue_after,
            triggered: Some(backup_name),
        })
    }

    /// Surface a permanent error on the schedule as `Ready=False`. Writes only
    /// when the condition actually changes.
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
        let Some(record) = self.schedules.get(namespace, name).await? else {
            return Ok(());
        };

        let mut status = record.status.clone().unwrap_or_default();
        if !status.set_condition(error_condition(error, now)) {
            return Ok(());
        }

        let mut updated = record;
        updated.status = Some(status);
        self.schedules.update_status(&updated).await?;
        Ok(())
    }
}

fn ready_condition(now: DateTime<Utc>) -> Condition {
    Condition::new(READY_CONDITION, true, "ScheduleValid", "Schedule is valid", now)
}

/// Name of the backup covering one occurrence of a schedule.
pub fn backup_name(schedule: &str, occurrence: DateTime<Utc>) -> String {
    let mut prefix = schedule.to_string();
    if prefix.len() > MAX_SCHEDULE_PREFIX {
        prefix.truncate(MAX_SCHEDULE_PREFIX);
        while prefix.ends_with('-') || prefix.ends_with('.') {
            prefix.pop();
        }
    }
    format!("{}-{}", prefix, occurrence.timestamp())
}
