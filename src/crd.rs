//! Custom Resource Definitions for site backups

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label identifying the tenant site a record belongs to.
pub const SITE_LABEL: &str = "site";

/// Label carried by backups that were spawned by a schedule.
pub const SCHEDULE_LABEL: &str = "backups.shepherd/schedule";

/// Label applied to everything this operator creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGER_NAME: &str = "backup-operator";

// ============================================================================
// BackupScheduled CRD
// ============================================================================

/// BackupScheduled triggers a Backup of a site whenever its cron schedule comes due
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extension.shepherd",
    version = "v1",
    kind = "BackupScheduled",
    plural = "backupscheduleds",
    shortname = "bsch",
    status = "BackupScheduledStatus",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Last Executed","type":"date","jsonPath":".status.lastExecutedTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduledSpec {
    /// Six-field cron expression (second minute hour day-of-month month day-of-week)
    #[serde(default)]
    pub schedule: String,
}

/// Status of a BackupScheduled
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduledStatus {
    /// Time the schedule last triggered a backup. Never moves backward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl BackupScheduledStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        find_condition(&self.conditions, condition_type)
    }

    /// Insert or replace a condition. Returns false when an identical
    /// condition (ignoring transition time) was already present.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        upsert_condition(&mut self.conditions, condition)
    }
}

fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) if existing.same_state(&condition) => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Record condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Reason
    pub reason: Option<String>,

    /// Message
    pub message: Option<String>,
}

/// Condition type reporting whether a schedule is usable.
pub const READY_CONDITION: &str = "Ready";

impl Condition {
    /// Create a condition stamped with the given transition time
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    fn same_state(&self, other: &Self) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

// ============================================================================
// Backup CRD
// ============================================================================

/// Backup captures the volumes and databases of a site
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extension.shepherd",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    shortname = "bk",
    status = "LifecycleStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Volumes which will be backed up
    #[serde(default)]
    pub volumes: BTreeMap<String, SpecVolume>,

    /// MySQL databases which will be backed up
    #[serde(default)]
    pub mysql: BTreeMap<String, SpecMySql>,

    /// Name of the BackupScheduled that spawned this backup, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_ref: Option<String>,
}

/// A persistent volume target
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecVolume {
    /// Name of the PersistentVolumeClaim
    pub claim_name: String,
}

/// A MySQL database target
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecMySql {
    /// Secret holding the connection details
    pub secret: String,
}

// ============================================================================
// Restore CRD
// ============================================================================

/// Restore replays a completed Backup onto a site
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extension.shepherd",
    version = "v1",
    kind = "Restore",
    plural = "restores",
    shortname = "rst",
    status = "LifecycleStatus",
    namespaced,
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Backup to restore from
    pub backup_name: String,

    /// Volumes to restore into
    #[serde(default)]
    pub volumes: BTreeMap<String, SpecVolume>,

    /// MySQL databases to restore into
    #[serde(default)]
    pub mysql: BTreeMap<String, SpecMySql>,
}

// ============================================================================
// Shared job status
// ============================================================================

/// Status shared by Backup and Restore records
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    /// Time the agent acknowledged the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Time the job reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Snapshot identifier assigned by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic_id: Option<String>,

    /// Lifecycle phase
    #[serde(default)]
    pub phase: Phase,

    /// Conditions; `Ready=False` carries the reason a record is stuck or failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LifecycleStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        find_condition(&self.conditions, condition_type)
    }

    /// Insert or replace a condition. Returns false when nothing changed.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        upsert_condition(&mut self.conditions, condition)
    }

    /// Flip a reported `Ready=False` back to true once the record makes
    /// progress. Returns false when there was no error to clear.
    pub fn clear_error(&mut self, now: DateTime<Utc>) -> bool {
        let failing = self
            .condition(READY_CONDITION)
            .is_some_and(|ready| !ready.is_true());
        if !failing {
            return false;
        }
        self.set_condition(Condition::new(
            READY_CONDITION,
            true,
            "Progressing",
            "Agent reported progress",
            now,
        ))
    }
}

/// Lifecycle phase of a backup or restore
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl Phase {
    /// Completed and Failed records are never modified again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of a backup, Pending when no status has been written yet
pub fn backup_phase(backup: &Backup) -> Phase {
    backup.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// Current phase of a restore, Pending when no status has been written yet
pub fn restore_phase(restore: &Restore) -> Phase {
    restore.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// All CRDs served by the operator, for installation.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![BackupScheduled::crd(), Backup::crd(), Restore::crd()]
}
