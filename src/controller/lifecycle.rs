//! Phase state machine shared by backups and restores.
//!
//! ```text
//! Pending --Started--> Running --Succeeded--> Completed
//!                              \--Failed----> Failed
//! ```
//!
//! A signal whose target phase equals the current phase is a redelivery and
//! leaves the record untouched. A backup whose agent succeeded without a
//! snapshot identifier has nothing to restore from, so it ends Failed with a
//! `Ready=False` condition naming the fault. Everything else is rejected
//! without mutating the record.

use crate::agent::{AgentEvent, AgentSignal, JobKind};
use crate::crd::{Condition, LifecycleStatus, Phase, READY_CONDITION};
use crate::error::{Error, Result};

/// Result of applying agent signals to a status.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The status moved forward; the new value must be written back.
    Advanced(LifecycleStatus),
    /// Nothing to write.
    Unchanged,
}

impl Transition {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Transition::Advanced(_))
    }
}

/// Apply one signal to `current`.
pub fn transition(
    kind: JobKind,
    name: &str,
    current: &LifecycleStatus,
    signal: &AgentSignal,
) -> Result<Transition> {
    let snapshot = signal
        .snapshot_id
        .as_deref()
        .filter(|id| !id.is_empty());
    // Restores already carry the source snapshot
    let unusable =
        kind == JobKind::Backup && signal.event == AgentEvent::Succeeded && snapshot.is_none();
    let target = if unusable {
        Phase::Failed
    } else {
        signal.event.target_phase()
    };
    if current.phase == target {
        return Ok(Transition::Unchanged);
    }

    if current.phase.is_terminal() {
        return Err(Error::TerminalPhase {
            kind: kind.record_kind(),
            name: name.to_string(),
            phase: current.phase,
            event: signal.event,
        });
    }

    let mut next = current.clone();
    match (current.phase, signal.event) {
        (Phase::Pending, AgentEvent::Started) => {
            next.start_time = Some(signal.timestamp);
        }
        (Phase::Running, AgentEvent::Succeeded) if unusable => {
            let fault = Error::MissingSnapshotId {
                kind: kind.record_kind(),
                name: name.to_string(),
            };
            next.completion_time = Some(signal.timestamp);
            next.set_condition(Condition::new(
                READY_CONDITION,
                false,
                fault.reason(),
                fault.to_string(),
                signal.timestamp,
            ));
        }
        (Phase::Running, AgentEvent::Succeeded) => {
            if let Some(id) = snapshot {
                next.restic_id = Some(id.to_string());
            }
            next.completion_time = Some(signal.timestamp);
        }
        (Phase::Running, AgentEvent::Failed) => {
            next.completion_time = Some(signal.timestamp);
        }
        (from, event) => {
            return Err(Error::PhaseSkip {
                kind: kind.record_kind(),
                name: name.to_string(),
                from,
                event,
            })
        }
    }
    next.phase = target;

    Ok(Transition::Advanced(next))
}

/// Apply signals in order. Either every signal is accepted and the final
/// status is returned, or the first rejection is returned and nothing applies.
pub fn fold_signals(
    kind: JobKind,
    name: &str,
    current: &LifecycleStatus,
    signals: &[AgentSignal],
) -> Result<Transition> {
    let mut status = current.clone();
    let mut advanced = false;

    for signal in signals {
        if let Transition::Advanced(next) = transition(kind, name, &status, signal)? {
            status = next;
            advanced = true;
        }
    }

    Ok(if advanced {
        Transition::Advanced(status)
    } else {
        Transition::Unchanged
    })
}
