//! Common test utilities for integration tests.

pub mod fixtures;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use backup_operator::config::OperatorConfig;
use backup_operator::controller::{BackupLifecycle, RestoreLifecycle, ScheduleReconciler};
use backup_operator::crd::{Backup, BackupScheduled, Restore};
use backup_operator::store::MemoryStore;

// Re-export common types
pub use fixtures::*;

/// Namespace every fixture lives in.
pub const NAMESPACE: &str = "default";

/// A UTC instant on 2024-01-01.
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, second).unwrap()
}

/// In-memory stores, a scripted agent and a static site directory, wired
/// the same way the operator wires the Kubernetes implementations.
pub struct Harness {
    pub schedules: Arc<MemoryStore<BackupScheduled>>,
    pub backups: Arc<MemoryStore<Backup>>,
    pub restores: Arc<MemoryStore<Restore>>,
    pub sites: Arc<StaticSites>,
    pub agent: ScriptedAgent,
    pub config: OperatorConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            schedules: Arc::new(MemoryStore::new()),
            backups: Arc::new(MemoryStore::new()),
            restores: Arc::new(MemoryStore::new()),
            sites: Arc::new(StaticSites::default()),
            agent: ScriptedAgent::default(),
            config: OperatorConfig::default(),
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.config.dry_run = true;
        self
    }

    pub fn schedule_reconciler(&self) -> ScheduleReconciler {
        ScheduleReconciler::new(self.schedules.clone(), self.backups.clone(), self.sites.clone())
    }

    pub fn backup_lifecycle(&self) -> BackupLifecycle {
        BackupLifecycle::new(self.backups.clone())
    }

    pub fn restore_lifecycle(&self) -> RestoreLifecycle {
        RestoreLifecycle::new(self.restores.clone(), self.backups.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
