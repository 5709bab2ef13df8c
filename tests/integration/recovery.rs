//! Staleness recovery and orphan reclamation integration tests.
//!
//! These tests verify that a silent worker loses its task to another
//! slot, and that worker groups left behind by a crashed coordinator are
//! found by each reclamation pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use cadence::core::task::{Task, TaskId, TaskStatus};
use cadence::orchestration::{
    CommandWorker, HealthConfig, SchedulerEvent, WaveConfig, WaveScheduler, WorkerId, WorkerRole,
};
use cadence::session::CoordinatorId;
use cadence::state::{GroupId, WorkerGroup};

use crate::fixtures::{coordinator_state, wave_config, worker_pool, HangOnce, TestHome};

fn register(home: &TestHome, id: &str, owner: CoordinatorId, age_mins: i64) {
    let mut group = WorkerGroup::new(
        GroupId::parse(id).unwrap(),
        owner,
        &["implementer-1".to_string()],
    );
    group.created_at = Utc::now() - chrono::Duration::minutes(age_mins);
    home.registry().create(&group).unwrap();
}

fn position(events: &[SchedulerEvent], pred: impl Fn(&SchedulerEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .expect("event was emitted")
}

fn registered(home: &TestHome) -> Vec<String> {
    home.registry()
        .list()
        .unwrap()
        .into_iter()
        .map(|g| g.group_id.to_string())
        .collect()
}

/// Test: stale worker releases its task
/// Given a worker that never reports progress on its first assignment
/// When the release threshold passes
/// Then the task is released, requeued with retry_count 1, and completed
/// by a different slot
#[tokio::test(start_paused = true)]
async fn test_stale_worker_task_is_reclaimed_elsewhere() {
    let home = TestHome::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = coordinator_state(vec![Task::new("a", "long edit").with_sequence(0)]);
    let mut pool = worker_pool(&home, Arc::new(HangOnce::default()), 2);

    let mut scheduler = WaveScheduler::new(wave_config(2)).with_events(tx);
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();
    drop(scheduler);

    let first = WorkerId::slot(WorkerRole::Implementer, 1);
    let second = WorkerId::slot(WorkerRole::Implementer, 2);

    assert_eq!(report.waves.len(), 2);
    assert_eq!(report.waves[0].released, vec![TaskId::from("a")]);
    assert_eq!(report.waves[0].dispatched[0].1, first);
    assert_eq!(report.waves[1].dispatched[0].1, second);

    let task = state.ledger.get(&TaskId::from("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.owner.as_ref(), Some(&second));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let warned = position(&events, |e| matches!(e, SchedulerEvent::StaleWarning { .. }));
    let released = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskReleased { worker, .. } if *worker == first)
    });
    let requeued = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskRequeued { attempt: 1, .. })
    });
    let completed = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { worker, .. } if *worker == second)
    });
    assert!(warned < released && released < requeued && requeued < completed);

    assert!(home.registry().list().unwrap().is_empty());
}

/// Test: a worker that keeps beating is never released
/// Given progress beats every second for longer than the release threshold
/// When the scheduler polls
/// Then the task completes on its first attempt
#[tokio::test(start_paused = true)]
async fn test_progress_beats_keep_task_owned() {
    use async_trait::async_trait;
    use cadence::orchestration::{Assignment, ProgressReporter, WorkerExecutor, WorkerReport};

    struct Beating;

    #[async_trait]
    impl WorkerExecutor for Beating {
        async fn execute(&self, _: &Assignment, progress: &ProgressReporter) -> WorkerReport {
            for _ in 0..30 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                progress.beat().await;
            }
            WorkerReport::completed()
        }
    }

    let home = TestHome::new();
    let mut state = coordinator_state(vec![Task::new("a", "slow but alive").with_sequence(0)]);
    let mut pool = worker_pool(&home, Arc::new(Beating), 1);

    let mut scheduler = WaveScheduler::new(wave_config(1));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    assert_eq!(report.waves.len(), 1);
    assert!(report.waves[0].released.is_empty());
    assert_eq!(state.ledger.get(&TaskId::from("a")).unwrap().retry_count, 0);
}

/// Real-time thresholds short enough for a child process to outlive.
fn fast_health(pool_size: usize) -> WaveConfig {
    let mut config = wave_config(pool_size);
    config.wave_timeout = Duration::from_secs(20);
    config.health = HealthConfig {
        poll_interval: Duration::from_millis(100),
        warn_after: Duration::from_millis(400),
        release_after: Duration::from_millis(800),
        max_retries: 3,
    };
    config
}

/// Test: a hung worker command is released
/// Given a command that goes silent on its first run and succeeds on its second
/// When the release threshold passes without any output
/// Then the task is released before the wave timeout and completed by
/// another slot
#[cfg(unix)]
#[tokio::test]
async fn test_hung_command_worker_is_released() {
    let home = TestHome::new();
    let marker = home.path.join("first-run");
    let command = format!(
        r#"if [ -e '{m}' ]; then printf '{{"status":"completed"}}'; else : > '{m}'; exec sleep 30; fi"#,
        m = marker.display()
    );
    let mut state = coordinator_state(vec![Task::new("a", "hangs once").with_sequence(0)]);
    let mut pool = worker_pool(&home, Arc::new(CommandWorker::new(command)), 2);

    let mut scheduler = WaveScheduler::new(fast_health(2));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    assert_eq!(report.waves[0].released, vec![TaskId::from("a")]);
    assert!(!report.waves[0].timed_out);
    let task = state.ledger.get(&TaskId::from("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(
        task.owner.as_ref(),
        Some(&WorkerId::slot(WorkerRole::Implementer, 2))
    );
    assert!(home.registry().list().unwrap().is_empty());
}

/// Test: a chatty worker command keeps its task
/// Given a command that writes a progress line every 200ms for two seconds
/// When it runs well past the release threshold
/// Then it is never released
#[cfg(unix)]
#[tokio::test]
async fn test_chatty_command_worker_keeps_task() {
    let home = TestHome::new();
    let command = r#"for i in 1 2 3 4 5 6 7 8 9 10; do echo "step $i" >&2; sleep 0.2; done; printf '{"status":"completed"}'"#;
    let mut state = coordinator_state(vec![Task::new("a", "slow but talking").with_sequence(0)]);
    let mut pool = worker_pool(&home, Arc::new(CommandWorker::new(command)), 1);

    let mut scheduler = WaveScheduler::new(fast_health(1));
    let report = scheduler.run(&mut state, &mut pool, None).await.unwrap();

    assert_eq!(report.waves.len(), 1);
    assert!(report.waves[0].released.is_empty());
    let task = state.ledger.get(&TaskId::from("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 0);
}

/// Test: threshold pass reclaims old groups only
/// Given one group older than the orphan threshold and one fresh group
/// When stale groups are reclaimed
/// Then only the old group is removed
#[test]
fn test_threshold_pass_reclaims_old_groups() {
    let home = TestHome::new();
    let cleanup = home.cleanup();
    register(&home, "old-execute-wave-1", CoordinatorId::new(), 120);
    register(&home, "new-execute-wave-1", CoordinatorId::new(), 1);

    let report = cleanup.reclaim_stale(Utc::now(), |_| true).unwrap();
    assert_eq!(report.removed, vec!["old-execute-wave-1".to_string()]);
    assert_eq!(registered(&home), vec!["new-execute-wave-1".to_string()]);
}

/// Test: declining confirmation leaves everything in place
#[test]
fn test_threshold_pass_respects_confirmation() {
    let home = TestHome::new();
    let cleanup = home.cleanup();
    register(&home, "old-execute-wave-1", CoordinatorId::new(), 120);

    let report = cleanup.reclaim_stale(Utc::now(), |_| false).unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.skipped, vec!["old-execute-wave-1".to_string()]);
    assert_eq!(registered(&home).len(), 1);
}

/// Test: prefix pass ignores age but spares the current coordinator
/// Given a fresh foreign group, an own group and an unreadable directory,
/// all under the stage prefix, plus an unrelated group
/// When the prefix pass runs
/// Then the foreign and unreadable ones are removed
#[test]
fn test_prefix_pass_reclaims_foreign_groups() {
    let home = TestHome::new();
    let cleanup = home.cleanup();
    let me = CoordinatorId::new();
    register(&home, "s1-execute-wave-1", CoordinatorId::new(), 0);
    register(&home, "s1-execute-wave-2", me, 0);
    register(&home, "s2-execute-wave-1", CoordinatorId::new(), 0);
    let junk = cadence::config::Config::groups_dir(&home.path).join("s1-execute-wave-3");
    std::fs::create_dir_all(&junk).unwrap();
    std::fs::write(junk.join("worker.sock"), b"").unwrap();

    let report = cleanup.reclaim_prefixed("s1-execute-", me).unwrap();
    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(
        removed,
        vec!["s1-execute-wave-1".to_string(), "s1-execute-wave-3".to_string()]
    );
    assert!(!junk.exists());
    assert_eq!(
        registered(&home),
        vec!["s1-execute-wave-2".to_string(), "s2-execute-wave-1".to_string()]
    );
}

/// Test: prefix pass leaves a session whose id extends the stage prefix
/// Given session `s1` and session `s1-execute-b` both running execute waves
/// When `s1` runs its prefix pass
/// Then only `s1`'s own wave groups are candidates
#[test]
fn test_prefix_pass_spares_session_sharing_prefix() {
    let home = TestHome::new();
    let cleanup = home.cleanup();
    register(&home, "s1-execute-wave-1", CoordinatorId::new(), 0);
    register(&home, "s1-execute-b-execute-wave-1", CoordinatorId::new(), 0);

    let report = cleanup.reclaim_prefixed("s1-execute-", CoordinatorId::new()).unwrap();
    assert_eq!(report.orphaned, vec!["s1-execute-wave-1".to_string()]);
    assert_eq!(registered(&home), vec!["s1-execute-b-execute-wave-1".to_string()]);
}

/// Test: pre-create guard replaces a leftover group of the same name
/// Given a registry entry left under the name of the next wave
/// When the pool spawns that wave
/// Then the old record is replaced by one owned by the pool
#[tokio::test]
async fn test_spawn_over_leftover_group() {
    let home = TestHome::new();
    register(&home, "it-wave-1", CoordinatorId::new(), 0);

    let mut pool = worker_pool(&home, Arc::new(HangOnce::default()), 1);
    let id = GroupId::parse("it-wave-1").unwrap();
    let members = [(WorkerId::slot(WorkerRole::Implementer, 1), WorkerRole::Implementer)];
    pool.spawn_group(id.clone(), &members).await.unwrap();

    let record = home.registry().load(&id).unwrap().unwrap();
    assert_eq!(record.owner, pool.owner());

    pool.shutdown_group().await.unwrap();
    assert!(!home.registry().exists(&id));
}

/// Test: teardown leaves no registry entry even with forced workers
/// Given a worker stuck inside its executor
/// When the group shuts down and the grace period lapses
/// Then the worker is forced, its task is returned and the entry is gone
#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_leaves_no_zombie_group() {
    use cadence::core::task::{RiskTier, TaskKind};
    use cadence::orchestration::Assignment;

    let home = TestHome::new();
    let mut pool = worker_pool(&home, Arc::new(HangOnce::default()), 1);
    let id = GroupId::parse("it-wave-7").unwrap();
    let worker = WorkerId::slot(WorkerRole::Implementer, 1);
    pool.spawn_group(id.clone(), &[(worker.clone(), WorkerRole::Implementer)])
        .await
        .unwrap();
    pool.assign(
        &worker,
        Assignment {
            task_id: TaskId::from("stuck"),
            subject: "stuck".to_string(),
            kind: TaskKind::Implementation,
            targets: Vec::new(),
            risk_tier: RiskTier::default(),
            verification_steps: 0,
            role: WorkerRole::Implementer,
        },
    )
    .await
    .unwrap();
    // let the worker claim it
    let _ = pool.recv_signal(Duration::from_millis(10)).await;

    let report = pool.shutdown_group().await.unwrap();
    assert_eq!(report.forced, vec![worker]);
    assert_eq!(report.returned, vec![TaskId::from("stuck")]);
    assert!(!home.registry().exists(&id));
    assert!(home.registry().list().unwrap().is_empty());
}
