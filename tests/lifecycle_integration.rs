//! Backup and restore lifecycle integration tests.

#[allow(dead_code)]
mod common;

use backup_operator::agent::{AgentSignal, JobKind};
use backup_operator::controller::Transition;
use backup_operator::crd::{backup_phase, restore_phase, Phase, READY_CONDITION};
use backup_operator::store::ResourceStore;
use backup_operator::Error;

use common::*;

// =============================================================================
// Backups
// =============================================================================

#[tokio::test]
async fn test_backup_runs_to_completion() {
    let h = Harness::new();
    h.backups.insert(backup("b1", None));
    let lifecycle = h.backup_lifecycle();

    // Pending: submitted, nothing reported yet
    let outcome = lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Pending));
    assert_eq!(outcome.requeue_after, Some(h.config.resync_interval));
    let submissions = h.agent.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, JobKind::Backup);
    assert_eq!(submissions[0].site.as_deref(), Some("foo"));
    assert_eq!(submissions[0].volumes, foo_targets().volumes);
    assert_eq!(submissions[0].snapshot_id, None);

    h.agent.report(JobKind::Backup, AgentSignal::started("b1", at(1, 0, 0)));
    let outcome = lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));
    assert!(outcome.advanced);
    // Running records are not resubmitted
    assert_eq!(h.agent.submissions().len(), 1);

    h.agent.report(
        JobKind::Backup,
        AgentSignal::succeeded("b1", at(1, 5, 0), "5f2b1c"),
    );
    let outcome = lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Completed));
    assert_eq!(outcome.requeue_after, None);

    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.start_time, Some(at(1, 0, 0)));
    assert_eq!(status.completion_time, Some(at(1, 5, 0)));
    assert_eq!(status.restic_id.as_deref(), Some("5f2b1c"));

    // Terminal records are left alone
    let writes = h.backups.update_count();
    lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(h.backups.update_count(), writes);
}

#[tokio::test]
async fn test_backup_failure_is_recorded() {
    let h = Harness::new();
    h.backups.insert(backup("b1", Some(Phase::Pending)));
    h.agent.report(JobKind::Backup, AgentSignal::started("b1", at(1, 0, 0)));
    h.agent.report(JobKind::Backup, AgentSignal::failed("b1", at(1, 2, 0)));

    let outcome = h
        .backup_lifecycle()
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();

    assert_eq!(outcome.phase, Some(Phase::Failed));
    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.completion_time, Some(at(1, 2, 0)));
    assert_eq!(status.restic_id, None);
    // Both signals land in a single write
    assert_eq!(h.backups.update_count(), 1);
}

#[tokio::test]
async fn test_success_without_snapshot_fails_backup() {
    let h = Harness::new();
    h.backups.insert(backup("b1", Some(Phase::Pending)));
    h.agent.report(JobKind::Backup, AgentSignal::started("b1", at(1, 0, 0)));
    h.agent.report(
        JobKind::Backup,
        AgentSignal {
            snapshot_id: None,
            ..AgentSignal::succeeded("b1", at(1, 4, 0), "unused")
        },
    );
    let lifecycle = h.backup_lifecycle();

    let outcome = lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();

    assert_eq!(outcome.phase, Some(Phase::Failed));
    assert!(outcome.advanced);
    assert_eq!(outcome.requeue_after, None);

    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.start_time, Some(at(1, 0, 0)));
    assert_eq!(status.completion_time, Some(at(1, 4, 0)));
    assert_eq!(status.restic_id, None);
    let ready = status.condition(READY_CONDITION).unwrap();
    assert!(!ready.is_true());
    assert_eq!(ready.reason.as_deref(), Some("MissingSnapshotId"));
    assert_eq!(h.backups.update_count(), 1);

    // Settled: the next pass leaves it alone
    lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(h.backups.update_count(), 1);
}

#[tokio::test]
async fn test_backup_errors_are_reported_once() {
    let h = Harness::new();
    h.backups.insert(backup("b1", None));
    h.agent.report(
        JobKind::Backup,
        AgentSignal::succeeded("b1", at(1, 0, 0), "abc"),
    );
    let lifecycle = h.backup_lifecycle();

    let err = lifecycle
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap_err();
    lifecycle
        .report_error(NAMESPACE, "b1", &err, at(1, 1, 0), &h.config)
        .await
        .unwrap();
    lifecycle
        .report_error(NAMESPACE, "b1", &err, at(1, 2, 0), &h.config)
        .await
        .unwrap();
    assert_eq!(h.backups.update_count(), 1);

    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.phase, Phase::Pending);
    let ready = status.condition(READY_CONDITION).unwrap();
    assert_eq!(ready.reason.as_deref(), Some("PhaseSkip"));
    assert_eq!(ready.last_transition_time, Some(at(1, 1, 0)));
}

#[tokio::test]
async fn test_terminal_backup_errors_are_not_written() {
    let h = Harness::new();
    h.backups.insert(completed_backup("b1", "abc"));
    let err = Error::TerminalPhase {
        kind: "Backup",
        name: "b1".to_string(),
        phase: Phase::Completed,
        event: backup_operator::agent::AgentEvent::Started,
    };

    h.backup_lifecycle()
        .report_error(NAMESPACE, "b1", &err, at(1, 0, 0), &h.config)
        .await
        .unwrap();

    assert_eq!(h.backups.update_count(), 0);
}

#[tokio::test]
async fn test_success_without_start_is_rejected() {
    let h = Harness::new();
    let record = h.backups.insert(backup("b1", Some(Phase::Pending)));

    let err = h
        .backup_lifecycle()
        .apply_signal(
            &record,
            &AgentSignal::succeeded("b1", at(1, 0, 0), "abc"),
            &h.config,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PhaseSkip { .. }));
    assert!(err.is_permanent());
    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    assert_eq!(backup_phase(&stored), Phase::Pending);
    assert_eq!(h.backups.update_count(), 0);
}

#[tokio::test]
async fn test_skip_reported_by_agent_fails_reconcile() {
    let h = Harness::new();
    h.backups.insert(backup("b1", None));
    h.agent.report(
        JobKind::Backup,
        AgentSignal::succeeded("b1", at(1, 0, 0), "abc"),
    );

    let err = h
        .backup_lifecycle()
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap_err();

    assert!(err.is_permanent());
    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    assert_eq!(backup_phase(&stored), Phase::Pending);
}

#[tokio::test]
async fn test_terminal_backup_is_immutable() {
    let h = Harness::new();
    let record = h.backups.insert(completed_backup("b1", "abc"));
    let lifecycle = h.backup_lifecycle();

    for signal in [
        AgentSignal::started("b1", at(2, 0, 0)),
        AgentSignal::failed("b1", at(2, 0, 0)),
    ] {
        let err = lifecycle
            .apply_signal(&record, &signal, &h.config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TerminalPhase { .. }));
    }

    // A redelivered success is accepted without a write
    let unchanged = lifecycle
        .apply_signal(
            &record,
            &AgentSignal::succeeded("b1", at(2, 0, 0), "other"),
            &h.config,
        )
        .await
        .unwrap();
    assert_eq!(unchanged, Transition::Unchanged);

    let stored = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    assert_eq!(stored.status.unwrap().restic_id.as_deref(), Some("abc"));
    assert_eq!(h.backups.update_count(), 0);
}

#[tokio::test]
async fn test_duplicate_start_is_a_no_op() {
    let h = Harness::new();
    let record = h.backups.insert(backup("b1", None));
    let lifecycle = h.backup_lifecycle();
    let started = AgentSignal::started("b1", at(1, 0, 0));

    let first = lifecycle
        .apply_signal(&record, &started, &h.config)
        .await
        .unwrap();
    assert!(first.is_advanced());

    let current = h.backups.get(NAMESPACE, "b1").await.unwrap().unwrap();
    let second = lifecycle
        .apply_signal(&current, &started, &h.config)
        .await
        .unwrap();
    assert_eq!(second, Transition::Unchanged);
    assert_eq!(h.backups.update_count(), 1);
}

#[tokio::test]
async fn test_concurrent_writers_conflict() {
    let h = Harness::new();
    let read = h.backups.insert(backup("b1", None));
    let lifecycle = h.backup_lifecycle();
    let started = AgentSignal::started("b1", at(1, 0, 0));

    lifecycle
        .apply_signal(&read, &started, &h.config)
        .await
        .unwrap();
    let err = lifecycle
        .apply_signal(&read, &started, &h.config)
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(h.backups.update_count(), 1);
}

#[tokio::test]
async fn test_dry_run_backup_is_not_submitted() {
    let h = Harness::new().dry_run();
    h.backups.insert(backup("b1", None));

    let outcome = h
        .backup_lifecycle()
        .reconcile(NAMESPACE, "b1", &h.agent, &h.config)
        .await
        .unwrap();

    assert_eq!(outcome.phase, Some(Phase::Pending));
    assert!(h.agent.submissions().is_empty());
    assert_eq!(h.backups.update_count(), 0);
}

#[tokio::test]
async fn test_deleted_backup_is_ignored() {
    let h = Harness::new();
    let outcome = h
        .backup_lifecycle()
        .reconcile(NAMESPACE, "gone", &h.agent, &h.config)
        .await
        .unwrap();

    assert_eq!(outcome.phase, None);
    assert_eq!(outcome.requeue_after, None);
}

// =============================================================================
// Restores
// =============================================================================

#[tokio::test]
async fn test_restore_from_running_backup_is_rejected() {
    let h = Harness::new();
    h.backups.insert(backup("b1", Some(Phase::Running)));
    h.restores.insert(restore("r1", "b1"));

    let err = h
        .restore_lifecycle()
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceNotCompleted { phase: Phase::Running, .. }));
    assert!(err.is_permanent());
    assert!(err.to_string().contains("not completed"));
    assert!(h.agent.submissions().is_empty());

    let stored = h.restores.get(NAMESPACE, "r1").await.unwrap().unwrap();
    assert_eq!(restore_phase(&stored), Phase::Pending);
    assert_eq!(h.restores.update_count(), 0);
}

#[tokio::test]
async fn test_restore_source_error_stays_visible_until_corrected() {
    let h = Harness::new();
    h.backups.insert(backup("b1", Some(Phase::Running)));
    h.restores.insert(restore("r1", "b1"));
    let lifecycle = h.restore_lifecycle();

    let err = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();
    lifecycle
        .report_error(NAMESPACE, "r1", &err, at(1, 0, 0), &h.config)
        .await
        .unwrap();

    let stored = h.restores.get(NAMESPACE, "r1").await.unwrap().unwrap();
    let status = stored.status.as_ref().unwrap();
    assert_eq!(status.phase, Phase::Pending);
    let ready = status.condition(READY_CONDITION).unwrap();
    assert!(!ready.is_true());
    assert_eq!(ready.reason.as_deref(), Some("SourceNotCompleted"));
    assert!(ready.message.as_deref().unwrap().contains("not completed"));

    // Same error on the next pass: no second write
    let err = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();
    lifecycle
        .report_error(NAMESPACE, "r1", &err, at(1, 5, 0), &h.config)
        .await
        .unwrap();
    assert_eq!(h.restores.update_count(), 1);

    // The source completes and the agent starts; the error is cleared
    h.backups.insert(completed_backup("b1", "5f2b1c"));
    h.agent.report(JobKind::Restore, AgentSignal::started("r1", at(2, 0, 0)));
    let outcome = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));

    let stored = h.restores.get(NAMESPACE, "r1").await.unwrap().unwrap();
    let status = stored.status.unwrap();
    assert_eq!(status.restic_id.as_deref(), Some("5f2b1c"));
    assert!(status.condition(READY_CONDITION).unwrap().is_true());
}

#[tokio::test]
async fn test_dry_run_restore_error_is_not_written() {
    let h = Harness::new().dry_run();
    h.restores.insert(restore("r1", "nope"));
    let lifecycle = h.restore_lifecycle();

    let err = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();
    lifecycle
        .report_error(NAMESPACE, "r1", &err, at(1, 0, 0), &h.config)
        .await
        .unwrap();

    assert_eq!(h.restores.update_count(), 0);
}

#[tokio::test]
async fn test_restore_from_missing_backup_is_rejected() {
    let h = Harness::new();
    h.restores.insert(restore("r1", "nope"));

    let err = h
        .restore_lifecycle()
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceNotFound { .. }));
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_restore_from_backup_without_snapshot_is_rejected() {
    let h = Harness::new();
    h.backups.insert(completed_backup("b1", ""));
    h.restores.insert(restore("r1", "b1"));

    let err = h
        .restore_lifecycle()
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceMissingSnapshot { .. }));
}

#[tokio::test]
async fn test_restore_runs_to_completion() {
    let h = Harness::new();
    h.backups.insert(completed_backup("b1", "5f2b1c"));
    h.restores.insert(restore("r1", "b1"));
    let lifecycle = h.restore_lifecycle();

    lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap();
    let submissions = h.agent.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, JobKind::Restore);
    assert_eq!(submissions[0].snapshot_id.as_deref(), Some("5f2b1c"));

    h.agent.report(JobKind::Restore, AgentSignal::started("r1", at(2, 0, 0)));
    let outcome = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Running));

    let stored = h.restores.get(NAMESPACE, "r1").await.unwrap().unwrap();
    assert_eq!(stored.status.unwrap().restic_id.as_deref(), Some("5f2b1c"));

    // The restore agent reports no snapshot of its own
    h.agent.report(
        JobKind::Restore,
        AgentSignal {
            snapshot_id: None,
            ..AgentSignal::succeeded("r1", at(2, 10, 0), "")
        },
    );
    let outcome = lifecycle
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Completed));
    assert_eq!(outcome.requeue_after, None);

    let status = h
        .restores
        .get(NAMESPACE, "r1")
        .await
        .unwrap()
        .unwrap()
        .status
        .unwrap();
    assert_eq!(status.start_time, Some(at(2, 0, 0)));
    assert_eq!(status.completion_time, Some(at(2, 10, 0)));
    assert_eq!(status.restic_id.as_deref(), Some("5f2b1c"));
}

#[tokio::test]
async fn test_restore_start_rechecks_source() {
    let h = Harness::new();
    h.backups.insert(backup("b1", Some(Phase::Failed)));
    let record = h.restores.insert(restore("r1", "b1"));

    let err = h
        .restore_lifecycle()
        .apply_signal(&record, &AgentSignal::started("r1", at(2, 0, 0)), &h.config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SourceNotCompleted { phase: Phase::Failed, .. }));
    assert_eq!(h.restores.update_count(), 0);
}

#[tokio::test]
async fn test_terminal_restore_is_immutable() {
    let h = Harness::new();
    h.backups.insert(completed_backup("b1", "abc"));
    let mut record = restore("r1", "b1");
    record.status = Some(backup_operator::crd::LifecycleStatus {
        phase: Phase::Failed,
        ..Default::default()
    });
    let record = h.restores.insert(record);

    let err = h
        .restore_lifecycle()
        .apply_signal(&record, &AgentSignal::started("r1", at(3, 0, 0)), &h.config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TerminalPhase { phase: Phase::Failed, .. }));

    let outcome = h
        .restore_lifecycle()
        .reconcile(NAMESPACE, "r1", &h.agent, &h.config)
        .await
        .unwrap();
    assert_eq!(outcome.phase, Some(Phase::Failed));
    assert!(h.agent.submissions().is_empty());
}
