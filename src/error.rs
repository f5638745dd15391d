//! Error types for the backup operator.
//!
//! Errors fall into two classes that the hosting loop treats differently:
//!
//! - **Permanent**: configuration and invariant violations (missing site label,
//!   malformed schedule, phase skips, restores from an unfinished backup). These
//!   are surfaced to the operator and never retried; only an edit to the record
//!   can fix them.
//! - **Transient**: store and agent failures, including optimistic-concurrency
//!   conflicts. These are retried by re-invoking the reconciler.

use thiserror::Error;

use crate::agent::AgentEvent;
use crate::crd::Phase;
use crate::scheduling::CronParseError;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // Resource store errors
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict writing {0}")]
    Conflict(String),

    #[error("Resource store unavailable: {0}")]
    Unavailable(String),

    #[error("CRD for {0} is not installed")]
    CrdNotInstalled(&'static str),

    // Execution agent errors
    #[error("Execution agent error: {0}")]
    Agent(String),

    // Schedule validation errors
    #[error("{kind} {name} doesn't have a {label} label")]
    MissingLabel {
        kind: &'static str,
        name: String,
        label: &'static str,
    },

    #[error("BackupScheduled {0} doesn't have a schedule")]
    MissingSchedule(String),

    #[error(transparent)]
    InvalidSchedule(#[from] CronParseError),

    // Lifecycle invariant errors
    #[error("{kind} {name}: cannot apply {event} while {from}; phases must advance Pending -> Running -> Completed|Failed")]
    PhaseSkip {
        kind: &'static str,
        name: String,
        from: Phase,
        event: AgentEvent,
    },

    #[error("{kind} {name}: cannot apply {event}, record is already in terminal phase {phase}")]
    TerminalPhase {
        kind: &'static str,
        name: String,
        phase: Phase,
        event: AgentEvent,
    },

    #[error("{kind} {name}: agent reported success without a snapshot identifier")]
    MissingSnapshotId { kind: &'static str, name: String },

    // Restore source errors
    #[error("Restore {restore}: source backup '{backup}' not found")]
    SourceNotFound { restore: String, backup: String },

    #[error("Restore {restore}: source backup '{backup}' not completed (phase {phase})")]
    SourceNotCompleted {
        restore: String,
        backup: String,
        phase: Phase,
    },

    #[error("Restore {restore}: source backup '{backup}' has no snapshot identifier")]
    SourceMissingSnapshot { restore: String, backup: String },

    // Configuration errors
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Permanent errors are configuration or invariant defects; retrying
    /// without an edit to the record cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::MissingLabel { .. }
                | Error::MissingSchedule(_)
                | Error::InvalidSchedule(_)
                | Error::PhaseSkip { .. }
                | Error::TerminalPhase { .. }
                | Error::MissingSnapshotId { .. }
                | Error::SourceNotFound { .. }
                | Error::SourceNotCompleted { .. }
                | Error::SourceMissingSnapshot { .. }
                | Error::CrdNotInstalled(_)
                | Error::InvalidConfig { .. }
                | Error::Config(_)
                | Error::Serialization(_)
        )
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }

    /// Version conflicts are an expected concurrency signal, retried promptly.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Short machine-readable reason, used for conditions and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubeError",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Conflict(_) => "Conflict",
            Error::Unavailable(_) => "StoreUnavailable",
            Error::CrdNotInstalled(_) => "CrdNotInstalled",
            Error::Agent(_) => "AgentError",
            Error::MissingLabel { .. } => "MissingSiteLabel",
            Error::MissingSchedule(_) => "MissingSchedule",
            Error::InvalidSchedule(_) => "InvalidSchedule",
            Error::PhaseSkip { .. } => "PhaseSkip",
            Error::TerminalPhase { .. } => "TerminalPhase",
            Error::MissingSnapshotId { .. } => "MissingSnapshotId",
            Error::SourceNotFound { .. } => "SourceNotFound",
            Error::SourceNotCompleted { .. } => "SourceNotCompleted",
            Error::SourceMissingSnapshot { .. } => "SourceMissingSnapshot",
            Error::InvalidConfig { .. } | Error::Config(_) => "InvalidConfig",
            Error::Serialization(_) => "Serialization",
            Error::Io(_) => "Io",
            Error::Internal(_) => "Internal",
        }
    }
}

/// Result type alias for operator operations.
pub type Result<T> = std::result::Result<T, Error>;
