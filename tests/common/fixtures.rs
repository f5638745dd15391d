// Test fixtures and fakes for integration tests

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use backup_operator::agent::{AgentSignal, ExecutionAgent, JobKind, JobRequest};
use backup_operator::crd::{
    Backup, BackupScheduled, BackupScheduledSpec, BackupScheduledStatus, BackupSpec,
    LifecycleStatus, Phase, Restore, RestoreSpec, SpecMySql, SpecVolume, SITE_LABEL,
};
use backup_operator::sites::{SiteDirectory, SiteTargets};
use backup_operator::Result;

use super::NAMESPACE;

/// A schedule record, optionally labelled with a site.
pub fn schedule(name: &str, site: Option<&str>, expression: &str) -> BackupScheduled {
    let mut record = BackupScheduled::new(
        name,
        BackupScheduledSpec {
            schedule: expression.to_string(),
        },
    );
    record.metadata.namespace = Some(NAMESPACE.to_string());
    record.metadata.labels =
        site.map(|s| BTreeMap::from([(SITE_LABEL.to_string(), s.to_string())]));
    record
}

/// A schedule that last fired at `last`.
pub fn schedule_executed_at(
    name: &str,
    site: &str,
    expression: &str,
    last: DateTime<Utc>,
) -> BackupScheduled {
    let mut record = schedule(name, Some(site), expression);
    record.status = Some(BackupScheduledStatus {
        last_executed_time: Some(last),
        conditions: Vec::new(),
    });
    record
}

/// Volume and database targets for site `foo`.
pub fn foo_targets() -> SiteTargets {
    SiteTargets {
        volumes: BTreeMap::from([(
            "shared".to_string(),
            SpecVolume {
                claim_name: "foo-shared".to_string(),
            },
        )]),
        mysql: BTreeMap::from([(
            "default".to_string(),
            SpecMySql {
                secret: "foo-db".to_string(),
            },
        )]),
    }
}

/// A backup in the given phase, `None` meaning no status written yet.
pub fn backup(name: &str, phase: Option<Phase>) -> Backup {
    let targets = foo_targets();
    let mut record = Backup::new(
        name,
        BackupSpec {
            volumes: targets.volumes,
            mysql: targets.mysql,
            schedule_ref: None,
        },
    );
    record.metadata.namespace = Some(NAMESPACE.to_string());
    record.metadata.labels = Some(BTreeMap::from([(SITE_LABEL.to_string(), "foo".to_string())]));
    record.status = phase.map(|phase| LifecycleStatus {
        phase,
        ..Default::default()
    });
    record
}

/// A completed backup carrying a snapshot identifier.
pub fn completed_backup(name: &str, restic_id: &str) -> Backup {
    let mut record = backup(name, None);
    record.status = Some(LifecycleStatus {
        phase: Phase::Completed,
        restic_id: Some(restic_id.to_string()),
        ..Default::default()
    });
    record
}

/// A fresh restore of `backup_name` into site `foo`.
pub fn restore(name: &str, backup_name: &str) -> Restore {
    let targets = foo_targets();
    let mut record = Restore::new(
        name,
        RestoreSpec {
            backup_name: backup_name.to_string(),
            volumes: targets.volumes,
            mysql: targets.mysql,
        },
    );
    record.metadata.namespace = Some(NAMESPACE.to_string());
    record
}

/// Site directory answering from a fixed table; unknown sites have no targets.
#[derive(Default)]
pub struct StaticSites {
    sites: Mutex<HashMap<String, SiteTargets>>,
}

impl StaticSites {
    pub fn add(&self, site: &str, targets: SiteTargets) {
        self.sites.lock().insert(site.to_string(), targets);
    }
}

#[async_trait]
impl SiteDirectory for StaticSites {
    async fn targets(&self, _namespace: &str, site: &str) -> Result<SiteTargets> {
        Ok(self.sites.lock().get(site).cloned().unwrap_or_default())
    }
}

/// Agent whose signals are scripted by the test.
#[derive(Default)]
pub struct ScriptedAgent {
    signals: Mutex<HashMap<(JobKind, String), Vec<AgentSignal>>>,
    submissions: Mutex<Vec<JobRequest>>,
}

impl ScriptedAgent {
    /// Queue a signal; `poll` returns every signal reported so far.
    pub fn report(&self, kind: JobKind, signal: AgentSignal) {
        self.signals
            .lock()
            .entry((kind, signal.job_id.clone()))
            .or_default()
            .push(signal);
    }

    pub fn submissions(&self) -> Vec<JobRequest> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl ExecutionAgent for ScriptedAgent {
    async fn submit(&self, request: &JobRequest) -> Result<()> {
        self.submissions.lock().push(request.clone());
        Ok(())
    }

    async fn poll(&self, kind: JobKind, _namespace: &str, name: &str) -> Result<Vec<AgentSignal>> {
        Ok(self
            .signals
            .lock()
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
