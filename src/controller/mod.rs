//! Kubernetes controllers for schedules, backups and restores.
//!
//! The reconcilers in the submodules are plain async functions over the
//! [`ResourceStore`](crate::store::ResourceStore) and
//! [`ExecutionAgent`](crate::agent::ExecutionAgent) traits. This module hosts
//! them in kube-runtime controllers and owns retry policy: permanent errors
//! wait for the record to change, conflicts retry promptly, and everything
//! else backs off exponentially per record.

mod backup;
mod lifecycle;
mod restore;
mod schedule;

pub use backup::BackupLifecycle;
pub use lifecycle::{fold_signals, transition, Transition};
pub use restore::RestoreLifecycle;
pub use schedule::{backup_name, ScheduleOutcome, ScheduleReconciler};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action, Controller as KubeController};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::agent::{ExecutionAgent, JobAgent};
use crate::backoff::Backoff;
use crate::config::OperatorConfig;
use crate::crd::{
    Backup, BackupScheduled, Condition, Phase, Restore, MANAGED_BY_LABEL, MANAGER_NAME,
    READY_CONDITION,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::sites::LabelSiteDirectory;
use crate::store::{record_key, KubeStore};

/// What a lifecycle pass left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleOutcome {
    /// Phase after the pass; `None` when the record no longer exists.
    pub phase: Option<Phase>,
    /// Whether the pass wrote a new status.
    pub advanced: bool,
    /// When to look again. Watch events on the agent's workload usually
    /// arrive sooner; this is the fallback.
    pub requeue_after: Option<Duration>,
}

impl LifecycleOutcome {
    fn missing() -> Self {
        Self {
            phase: None,
            advanced: false,
            requeue_after: None,
        }
    }

    fn settled(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            advanced: false,
            requeue_after: None,
        }
    }

    fn after(previous: Phase, transition: Transition, resync: Duration) -> Self {
        let (phase, advanced) = match transition {
            Transition::Advanced(status) => (status.phase, true),
            Transition::Unchanged => (previous, false),
        };
        Self {
            phase: Some(phase),
            advanced,
            requeue_after: (!phase.is_terminal()).then_some(resync),
        }
    }
}

/// Shared state for all controllers
pub struct Context {
    pub config: OperatorConfig,
    pub schedules: ScheduleReconciler,
    pub backups: BackupLifecycle,
    pub restores: RestoreLifecycle,
    pub agent: Arc<dyn ExecutionAgent>,
    pub backoff: Backoff,
}

impl Context {
    /// Wire the reconcilers to the cluster.
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let schedule_store = Arc::new(KubeStore::<BackupScheduled>::new(client.clone()));
        let backup_store = Arc::new(KubeStore::<Backup>::new(client.clone()));
        let restore_store = Arc::new(KubeStore::<Restore>::new(client.clone()));
        let sites = Arc::new(LabelSiteDirectory::new(client.clone()));
        let agent = Arc::new(JobAgent::new(client, config.agent.clone()));

        Self {
            schedules: ScheduleReconciler::new(schedule_store, backup_store.clone(), sites),
            backups: BackupLifecycle::new(backup_store.clone()),
            restores: RestoreLifecycle::new(restore_store, backup_store),
            agent,
            backoff: Backoff::new(config.backoff.clone()),
            config,
        }
    }
}

/// Runs the three controllers against a cluster
#[derive(Clone)]
pub struct Controllers {
    client: Client,
    ctx: Arc<Context>,
}

impl Controllers {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let ctx = Arc::new(Context::new(client.clone(), config));
        Self { client, ctx }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        if self.ctx.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.ctx.config.namespace)
        }
    }

    /// Fail fast when the CRDs have not been installed.
    pub async fn verify_crds(&self) -> Result<()> {
        let lp = ListParams::default().limit(1);
        if let Err(e) = self.api::<BackupScheduled>().list(&lp).await {
            error!(error = %e, "Failed to list BackupScheduled. Is the CRD installed?");
            return Err(Error::CrdNotInstalled("BackupScheduled"));
        }
        if let Err(e) = self.api::<Backup>().list(&lp).await {
            error!(error = %e, "Failed to list Backup. Is the CRD installed?");
            return Err(Error::CrdNotInstalled("Backup"));
        }
        if let Err(e) = self.api::<Restore>().list(&lp).await {
            error!(error = %e, "Failed to list Restore. Is the CRD installed?");
            return Err(Error::CrdNotInstalled("Restore"));
        }
        info!("CRD verification successful");
        Ok(())
    }

    /// Run the schedule controller
    pub async fn run_schedule_controller(&self) -> Result<()> {
        info!("Starting schedule controller");

        KubeController::new(self.api::<BackupScheduled>(), Config::default())
            .shutdown_on_signal()
            .run(
                reconcile_schedule,
                |schedule, error, ctx| error_policy("schedule", schedule, error, ctx),
                Arc::clone(&self.ctx),
            )
            .for_each(|result| {
                let ctx = Arc::clone(&self.ctx);
                async move {
                    match result {
                        Ok((obj, action)) => {
                            debug!(name = %obj.name, ?action, "Schedule reconciliation successful");
                        }
                        Err(controller::Error::ObjectNotFound(obj)) => {
                            forget_deleted(&ctx, "schedule", obj.namespace.as_deref(), &obj.name);
                        }
                        Err(e) => {
                            debug!(error = %e, "Schedule reconciliation error");
                        }
                    }
                }
            })
            .await;

        info!("Schedule controller stopped");
        Ok(())
    }

    /// Run the backup controller. Agent Jobs are watched so their progress
    /// re-triggers the owning Backup.
    pub async fn run_backup_controller(&self) -> Result<()> {
        info!("Starting backup controller");

        KubeController::new(self.api::<Backup>(), Config::default())
            .owns(self.api::<Job>(), managed_jobs())
            .shutdown_on_signal()
            .run(
                reconcile_backup,
                |backup, error, ctx| error_policy("backup", backup, error, ctx),
                Arc::clone(&self.ctx),
            )
            .for_each(|result| {
                let ctx = Arc::clone(&self.ctx);
                async move {
                    match result {
                        Ok((obj, action)) => {
                            debug!(name = %obj.name, ?action, "Backup reconciliation successful");
                        }
                        Err(controller::Error::ObjectNotFound(obj)) => {
                            forget_deleted(&ctx, "backup", obj.namespace.as_deref(), &obj.name);
                        }
                        Err(e) => {
                            debug!(error = %e, "Backup reconciliation error");
                        }
                    }
                }
            })
            .await;

        info!("Backup controller stopped");
        Ok(())
    }

    /// Run the restore controller
    pub async fn run_restore_controller(&self) -> Result<()> {
        info!("Starting restore controller");

        KubeController::new(self.api::<Restore>(), Config::default())
            .owns(self.api::<Job>(), managed_jobs())
            .shutdown_on_signal()
            .run(
                reconcile_restore,
                |restore, error, ctx| error_policy("restore", restore, error, ctx),
                Arc::clone(&self.ctx),
            )
            .for_each(|result| {
                let ctx = Arc::clone(&self.ctx);
                async move {
                    match result {
                        Ok((obj, action)) => {
                            debug!(name = %obj.name, ?action, "Restore reconciliation successful");
                        }
                        Err(controller::Error::ObjectNotFound(obj)) => {
                            forget_deleted(&ctx, "restore", obj.namespace.as_deref(), &obj.name);
                        }
                        Err(e) => {
                            debug!(error = %e, "Restore reconciliation error");
                        }
                    }
                }
            })
            .await;

        info!("Restore controller stopped");
        Ok(())
    }
}

fn managed_jobs() -> Config {
    Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER_NAME))
}

fn backoff_key<K: Resource>(controller: &str, record: &K) -> String {
    format!("{}:{}", controller, record_key(record))
}

/// Drop retry state for a record the watch no longer holds. Deleted records
/// never reach the reconciler again, so their entry would otherwise stay.
fn forget_deleted(ctx: &Context, controller: &str, namespace: Option<&str>, name: &str) {
    let key = deleted_key(controller, namespace, name);
    debug!(record = %key, "Record deleted, forgetting retry state");
    ctx.backoff.reset(&key);
}

fn deleted_key(controller: &str, namespace: Option<&str>, name: &str) -> String {
    format!("{}:{}/{}", controller, namespace.unwrap_or_default(), name)
}

/// `Ready=False` condition describing a permanent error.
fn error_condition(error: &Error, now: DateTime<Utc>) -> Condition {
    Condition::new(READY_CONDITION, false, error.reason(), error.to_string(), now)
}

fn requeue(after: Option<Duration>) -> Action {
    after.map(Action::requeue).unwrap_or_else(Action::await_change)
}

/// Reconcile a BackupScheduled resource
async fn reconcile_schedule(schedule: Arc<BackupScheduled>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = schedule.name_any();
    let namespace = schedule.namespace().unwrap_or_default();

    debug!(name = %name, namespace = %namespace, "Reconciling BackupScheduled");

    let result = ctx
        .schedules
        .reconcile(&namespace, &name, Utc::now(), &ctx.config)
        .await;
    metrics::record_reconciliation("schedule", result.is_ok(), start.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            ctx.backoff.reset(&backoff_key("schedule", schedule.as_ref()));
            if outcome.triggered.is_some() && !ctx.config.dry_run {
                metrics::record_backup_triggered(&namespace);
            }
            Ok(requeue(outcome.requeue_after))
        }
        Err(e) => {
            if e.is_permanent() {
                if let Err(report) = ctx
                    .schedules
                    .report_error(&namespace, &name, &e, Utc::now(), &ctx.config)
                    .await
                {
                    warn!(name = %name, error = %report, "Failed to record schedule error");
                }
            }
            Err(e)
        }
    }
}

/// Reconcile a Backup resource
async fn reconcile_backup(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();

    debug!(name = %name, namespace = %namespace, "Reconciling Backup");

    let result = ctx
        .backups
        .reconcile(&namespace, &name, ctx.agent.as_ref(), &ctx.config)
        .await;
    metrics::record_reconciliation("backup", result.is_ok(), start.elapsed().as_secs_f64());

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_permanent() {
                if let Err(report) = ctx
                    .backups
                    .report_error(&namespace, &name, &e, Utc::now(), &ctx.config)
                    .await
                {
                    warn!(name = %name, error = %report, "Failed to record backup error");
                }
            }
            return Err(e);
        }
    };
    ctx.backoff.reset(&backoff_key("backup", backup.as_ref()));
    if let (true, Some(phase)) = (outcome.advanced, outcome.phase) {
        metrics::record_phase_transition("backup", phase);
    }
    Ok(requeue(outcome.requeue_after))
}

/// Reconcile a Restore resource
async fn reconcile_restore(restore: Arc<Restore>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = restore.name_any();
    let namespace = restore.namespace().unwrap_or_default();

    debug!(name = %name, namespace = %namespace, "Reconciling Restore");

    let result = ctx
        .restores
        .reconcile(&namespace, &name, ctx.agent.as_ref(), &ctx.config)
        .await;
    metrics::record_reconciliation("restore", result.is_ok(), start.elapsed().as_secs_f64());

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_permanent() {
                if let Err(report) = ctx
                    .restores
                    .report_error(&namespace, &name, &e, Utc::now(), &ctx.config)
                    .await
                {
                    warn!(name = %name, error = %report, "Failed to record restore error");
                }
            }
            return Err(e);
        }
    };
    ctx.backoff.reset(&backoff_key("restore", restore.as_ref()));
    if let (true, Some(phase)) = (outcome.advanced, outcome.phase) {
        metrics::record_phase_transition("restore", phase);
    }
    Ok(requeue(outcome.requeue_after))
}

/// Retry policy shared by all controllers
fn error_policy<K: Resource>(
    controller: &'static str,
    record: Arc<K>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    metrics::record_error(error.reason());
    let key = backoff_key(controller, record.as_ref());

    if error.is_permanent() {
        error!(
            record = %key,
            reason = error.reason(),
            error = %error,
            "Reconciliation failed permanently"
        );
        Action::await_change()
    } else if error.is_conflict() {
        debug!(record = %key, "Version conflict, retrying");
        Action::requeue(ctx.config.conflict_retry)
    } else {
        let delay = ctx.backoff.next_delay(&key);
        warn!(record = %key, error = %error, retry_in = ?delay, "Reconciliation error, will retry");
        Action::requeue(delay)
    }
}
