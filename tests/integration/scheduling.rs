//! Wave scheduling integration tests.
//!
//! These tests drive the scheduler against a real worker pool and group
//! registry and check the schedule it produces.

use std::sync::Arc;
use tokio::sync::mpsc;

use cadence::core::task::{Task, TaskId, TaskStatus};
use cadence::orchestration::{SchedulerEvent, WaveScheduler};

use crate::fixtures::{
    abc_tasks, coordinator_state, wave_config, worker_pool, RecordingExecutor, TestHome,
};

fn ids(raw: &[&str]) -> Vec<TaskId> {
    raw.iter().map(|s| TaskId::from(*s)).collect()
}

/// Test: shared-target tasks are never co-scheduled
/// Given A (unrestricted), B and C both targeting `f`
/// When the scheduler runs with a pool of four
/// Then wave 1 is {A, B}, wave 2 is {C}, and `f` is never held twice
#[tokio::test]
async fn test_abc_schedule_separates_shared_target() {
    let home = TestHome::new();
    let executor = Arc::new(RecordingExecutor::default());
    let mut state = coordinator_state(abc_tasks());
    let mut pool = worker_pool(&home, executor.clone(), 4);

    let mut scheduler = WaveScheduler::new(wave_config(4));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    assert_eq!(report.waves.len(), 2);
    let wave = |n: usize| -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = report.waves[n]
            .dispatched
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(wave(0), ids(&["a", "b"]));
    assert_eq!(wave(1), ids(&["c"]));
    assert!(executor.overlaps().is_empty());

    assert_eq!(report.counts.completed, 3);
    assert!(state.ledger.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(home.registry().list().unwrap().is_empty());
}

/// Test: the inferred edge runs from the lower to the higher sequence
/// Given B listed before C
/// When conflicts are resolved
/// Then C is blocked by B and not the other way round
#[test]
fn test_sync_edge_follows_plan_order() {
    let state = coordinator_state(abc_tasks());
    let c = state.ledger.get(&TaskId::from("c")).unwrap();
    let b = state.ledger.get(&TaskId::from("b")).unwrap();
    assert!(c.blocked_by.contains(&TaskId::from("b")));
    assert!(b.blocked_by.is_empty());
    assert!(state.dag.is_ordered(&TaskId::from("b"), &TaskId::from("c")));
}

/// Test: a failing predecessor blocks its dependents
/// Given a chain root -> mid -> leaf where root always fails
/// When the scheduler runs
/// Then root is blocked after the retry cap and the chain is blocked too
#[tokio::test]
async fn test_blocked_root_starves_chain() {
    let home = TestHome::new();
    let executor = Arc::new(RecordingExecutor::failing(["root"]));
    let mut state = coordinator_state(vec![
        Task::new("root", "root").with_sequence(0),
        Task::new("mid", "mid").with_sequence(1).with_blocked_by(["root"]),
        Task::new("leaf", "leaf").with_sequence(2).with_blocked_by(["mid"]),
        Task::new("free", "free").with_sequence(3),
    ]);
    let mut pool = worker_pool(&home, executor.clone(), 2);

    let mut scheduler = WaveScheduler::new(wave_config(2));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    let root = state.ledger.get(&TaskId::from("root")).unwrap();
    assert_eq!(root.status, TaskStatus::Blocked);
    assert_eq!(root.retry_count, 4);
    for id in ["mid", "leaf"] {
        let task = state.ledger.get(&TaskId::from(id)).unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.last_error.as_deref().unwrap().contains("is blocked"));
    }
    assert_eq!(
        state.ledger.get(&TaskId::from("free")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(report.counts.blocked, 3);
    assert_eq!(report.counts.pending + report.counts.in_progress, 0);

    // mid and leaf never reached a worker
    let started = executor.started();
    assert!(!started.contains(&TaskId::from("mid")));
    assert!(!started.contains(&TaskId::from("leaf")));
}

/// Test: observers see the run as events
/// Given an events channel
/// When the ABC plan runs
/// Then the stream starts with a wave and ends with AllSettled
#[tokio::test]
async fn test_event_stream_brackets_run() {
    let home = TestHome::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = coordinator_state(abc_tasks());
    let mut pool = worker_pool(&home, Arc::new(RecordingExecutor::default()), 4);

    let mut scheduler = WaveScheduler::new(wave_config(4)).with_events(tx);
    scheduler.run(&mut state, &mut pool, None).await.unwrap();
    drop(scheduler);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(SchedulerEvent::WaveStarted { wave: 1, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::AllSettled { counts }) if counts.completed == 3
    ));
    let completed = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
}

/// Test: verification tasks go to verifier slots
/// Given one implementation and one verification task
/// When both run in the same wave
/// Then each lands on a slot of the matching role
#[tokio::test]
async fn test_roles_follow_task_kind() {
    use cadence::core::task::TaskKind;

    let home = TestHome::new();
    let mut state = coordinator_state(vec![
        Task::new("build", "build").with_sequence(0),
        Task::new("check", "check")
            .with_sequence(1)
            .with_kind(TaskKind::Verification),
    ]);
    let mut pool = worker_pool(&home, Arc::new(RecordingExecutor::default()), 2);

    let mut scheduler = WaveScheduler::new(wave_config(2));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    let workers: Vec<String> = report.waves[0]
        .dispatched
        .iter()
        .map(|(_, w)| w.to_string())
        .collect();
    assert!(workers.contains(&"implementer-1".to_string()));
    assert!(workers.contains(&"verifier-1".to_string()));
}
