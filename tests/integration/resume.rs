//! Checkpointed pipeline and resume integration tests.
//!
//! These tests run whole sessions through the coordinator, then resume
//! them after clean exits, corrupted artifacts and simulated crashes.

use std::sync::Arc;

use chrono::Utc;

use cadence::session::{CoordinatorId, SessionId, SessionPaths};
use cadence::state::{CheckpointEntry, CheckpointStore, GroupId, PhaseStatus, WorkerGroup};
use cadence::workflow::{self, Coordinator, Phase, PhaseOutcome};
use cadence::SessionStatus;

use crate::fixtures::{read_artifact, test_config, HangOnce, Succeed, TestHome, ABC_PLAN};

fn coordinator(home: &TestHome) -> Coordinator {
    Coordinator::new(home.path.clone(), test_config(4), Arc::new(Succeed))
}

fn checkpoint_rows(home: &TestHome, id: &SessionId) -> usize {
    let paths = SessionPaths::new(&home.path, id);
    CheckpointStore::open(&paths.checkpoints())
        .unwrap()
        .rows()
        .len()
}

/// Test: resuming a finished session twice changes nothing
/// Given a session that completed plan and execute
/// When it is resumed twice by fresh coordinators
/// Then every phase is skipped both times and the ledger is unchanged
#[tokio::test]
async fn test_resume_is_idempotent() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let id = SessionId::parse("resume-1").unwrap();

    let report = coordinator(&home).start(&plan, Some(id.clone())).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    let ledger = read_artifact(&home.path, &id, "ledger.json");
    let rows = checkpoint_rows(&home, &id);

    let once = coordinator(&home).resume(&id).await.unwrap();
    let ledger_once = read_artifact(&home.path, &id, "ledger.json");
    let twice = coordinator(&home).resume(&id).await.unwrap();
    let ledger_twice = read_artifact(&home.path, &id, "ledger.json");

    for r in [&once, &twice] {
        assert_eq!(r.status, SessionStatus::Completed);
        assert_eq!(r.outcome(Phase::Plan), Some(PhaseOutcome::Skipped));
        assert_eq!(r.outcome(Phase::Execute), Some(PhaseOutcome::Skipped));
    }
    assert_eq!(once.counts, twice.counts);
    assert_eq!(once.counts.unwrap().completed, 3);
    assert_eq!(ledger, ledger_once);
    assert_eq!(ledger_once, ledger_twice);
    assert_eq!(checkpoint_rows(&home, &id), rows);
}

/// Test: a tampered artifact re-runs its phase
/// Given a completed session whose ledger.json was edited afterwards
/// When the session is resumed
/// Then plan is skipped and execute runs again
#[tokio::test]
async fn test_corrupt_artifact_reruns_phase() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let id = SessionId::parse("corrupt-1").unwrap();
    coordinator(&home).start(&plan, Some(id.clone())).await.unwrap();

    let paths = SessionPaths::new(&home.path, &id);
    std::fs::write(paths.artifact("ledger.json"), b"{}").unwrap();

    let report = coordinator(&home).resume(&id).await.unwrap();
    assert_eq!(report.outcome(Phase::Plan), Some(PhaseOutcome::Skipped));
    assert_eq!(report.outcome(Phase::Execute), Some(PhaseOutcome::Completed));
    assert_eq!(report.counts.unwrap().completed, 3);
    assert_eq!(report.status, SessionStatus::Completed);
}

/// Test: crash mid-execute is reconciled on resume
/// Given an execute checkpoint left in progress with a live worker group
/// When a new coordinator resumes the session
/// Then the group is reclaimed, execute is reset and re-run, and the
/// registry ends empty
#[tokio::test]
async fn test_resume_after_crash_reclaims_group() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let id = SessionId::parse("crash-1").unwrap();
    coordinator(&home).start(&plan, Some(id.clone())).await.unwrap();

    // what a coordinator killed during wave 1 leaves behind
    let paths = SessionPaths::new(&home.path, &id);
    let mut store = CheckpointStore::open(&paths.checkpoints()).unwrap();
    store
        .record(
            "execute",
            PhaseStatus::InProgress,
            CheckpointEntry {
                artifact: None,
                worker_group_id: Some("crash-1-execute-wave-1"),
            },
        )
        .unwrap();
    let group = WorkerGroup::new(
        GroupId::parse("crash-1-execute-wave-1").unwrap(),
        CoordinatorId::new(),
        &["implementer-1".to_string(), "implementer-2".to_string()],
    );
    home.registry().create(&group).unwrap();

    let report = coordinator(&home).resume(&id).await.unwrap();
    assert!(report
        .cleanup
        .removed
        .contains(&"crash-1-execute-wave-1".to_string()));
    assert_eq!(report.cleanup.reset_phases, vec!["execute".to_string()]);
    assert_eq!(report.outcome(Phase::Plan), Some(PhaseOutcome::Skipped));
    assert_eq!(report.outcome(Phase::Execute), Some(PhaseOutcome::Completed));
    assert_eq!(report.counts.unwrap().completed, 3);
    assert!(home.registry().list().unwrap().is_empty());

    let store = CheckpointStore::open(&paths.checkpoints()).unwrap();
    assert_eq!(store.latest("execute").unwrap().status, PhaseStatus::Completed);
}

/// Test: a phase that outruns its timeout halts the session
/// Given a worker that never answers and a one-second phase timeout
/// When execute runs
/// Then execute is recorded failed, the session halts and the worker
/// group is gone
#[tokio::test(start_paused = true)]
async fn test_phase_timeout_halts_session() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let id = SessionId::parse("slow-1").unwrap();
    let mut config = test_config(1);
    config.pipeline.phase_timeout_secs = 1;

    let coordinator = Coordinator::new(home.path.clone(), config, Arc::new(HangOnce::default()));
    let report = coordinator.start(&plan, Some(id.clone())).await.unwrap();

    assert_eq!(report.status, SessionStatus::Halted);
    assert_eq!(report.outcome(Phase::Plan), Some(PhaseOutcome::Completed));
    assert_eq!(report.outcome(Phase::Execute), Some(PhaseOutcome::TimedOut));
    assert!(home.registry().list().unwrap().is_empty());

    let overview = workflow::inspect(&home.path, &id).unwrap();
    assert_eq!(overview.session.status, SessionStatus::Halted);
    let execute = overview
        .checkpoints
        .iter()
        .find(|c| c.phase == "execute")
        .unwrap();
    assert_eq!(execute.status, PhaseStatus::Failed);
}

/// Test: orphan threshold pass runs before any phase
/// Given an hour-old group from an unrelated crashed session
/// When a new session starts
/// Then the preflight report lists it as removed
#[tokio::test]
async fn test_start_reclaims_old_orphans() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let mut group = WorkerGroup::new(
        GroupId::parse("old-execute-wave-3").unwrap(),
        CoordinatorId::new(),
        &["implementer-1".to_string()],
    );
    group.created_at = Utc::now() - chrono::Duration::hours(1);
    home.registry().create(&group).unwrap();

    let report = coordinator(&home)
        .start(&plan, Some(SessionId::parse("fresh-1").unwrap()))
        .await
        .unwrap();
    assert_eq!(report.cleanup.removed, vec!["old-execute-wave-3".to_string()]);
    assert!(home.registry().list().unwrap().is_empty());
}
