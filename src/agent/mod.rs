//! Execution agent interface.
//!
//! The agent performs the actual snapshotting and restoring. This module only
//! defines what the operator hands to it and the signals it reports back.

mod job;

pub use job::{signals_from_job, JobAgent, RESTIC_ID_ANNOTATION};

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use crate::crd::{Phase, SpecMySql, SpecVolume};
use crate::error::Result;

/// Events the agent reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEvent {
    Started,
    Succeeded,
    Failed,
}

impl AgentEvent {
    /// Phase a record enters when this event is applied.
    pub fn target_phase(self) -> Phase {
        match self {
            AgentEvent::Started => Phase::Running,
            AgentEvent::Succeeded => Phase::Completed,
            AgentEvent::Failed => Phase::Failed,
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentEvent::Started => "Started",
            AgentEvent::Succeeded => "Succeeded",
            AgentEvent::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A status report from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSignal {
    /// Name of the Backup or Restore the signal is about.
    pub job_id: String,
    pub event: AgentEvent,
    pub timestamp: DateTime<Utc>,
    /// Snapshot identifier, present on success.
    pub snapshot_id: Option<String>,
}

impl AgentSignal {
    pub fn started(job_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            event: AgentEvent::Started,
            timestamp,
            snapshot_id: None,
        }
    }

    pub fn succeeded(
        job_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            event: AgentEvent::Succeeded,
            timestamp,
            snapshot_id: Some(snapshot_id.into()),
        }
    }

    pub fn failed(job_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            event: AgentEvent::Failed,
            timestamp,
            snapshot_id: None,
        }
    }
}

/// Which way data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }

    /// Kind of the record the job belongs to.
    pub fn record_kind(self) -> &'static str {
        match self {
            JobKind::Backup => "Backup",
            JobKind::Restore => "Restore",
        }
    }
}

/// Work handed to the agent.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub namespace: String,
    /// Name of the Backup or Restore record.
    pub name: String,
    pub site: Option<String>,
    pub volumes: BTreeMap<String, SpecVolume>,
    pub mysql: BTreeMap<String, SpecMySql>,
    /// Snapshot to restore from; only set for restores.
    pub snapshot_id: Option<String>,
    /// Reference back to the record, so agent workloads route watch events to it.
    pub owner: Option<OwnerReference>,
}

/// Backend that runs backups and restores.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    /// Start work for a record. Submitting the same record twice is a no-op.
    async fn submit(&self, request: &JobRequest) -> Result<()>;

    /// Signals observed so far for a record, oldest first. Empty when the
    /// agent has not picked the record up.
    async fn poll(&self, kind: JobKind, namespace: &str, name: &str) -> Result<Vec<AgentSignal>>;
}
