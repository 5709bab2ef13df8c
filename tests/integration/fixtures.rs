//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Isolated cadence homes and plan files
//! - Scripted in-process workers, repairers and scorers
//! - Building a coordinator state and worker pool for the scheduler

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use async_trait::async_trait;
use cadence::cleanup::{CleanupConfig, CleanupManager};
use cadence::config::{Config, ConflictSettings};
use cadence::core::dag::TaskDAG;
use cadence::core::ledger::{CoordinatorState, TaskLedger};
use cadence::core::task::{Task, TaskId};
use cadence::orchestration::conflicts;
use cadence::orchestration::{
    Assignment, BreakerConfig, Finding, FindingScorer, HealthConfig, PoolConfig, ProgressReporter,
    Repairer, WaveConfig, WorkerExecutor, WorkerPool, WorkerReport,
};
use cadence::session::{CoordinatorId, SessionId};
use cadence::state::GroupRegistry;

/// A throwaway cadence home directory.
pub struct TestHome {
    /// Keeps the directory alive for the duration of the test.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestHome {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    /// Write a TOML plan next to the home and return its path.
    pub fn write_plan(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, body).expect("Failed to write plan");
        path
    }

    pub fn registry(&self) -> GroupRegistry {
        GroupRegistry::from_home(&self.path)
    }

    pub fn cleanup(&self) -> CleanupManager {
        CleanupManager::new(self.registry(), CleanupConfig::default())
    }
}

/// Three tasks: `a` is unrestricted, `b` and `c` both write `f`.
pub const ABC_PLAN: &str = r#"
[[tasks]]
id = "a"
subject = "scaffold module"

[[tasks]]
id = "b"
subject = "first edit of f"
resource_targets = ["f"]

[[tasks]]
id = "c"
subject = "second edit of f"
resource_targets = ["f"]
"#;

pub fn abc_tasks() -> Vec<Task> {
    vec![
        Task::new("a", "scaffold module").with_sequence(0),
        Task::new("b", "first edit of f").with_sequence(1).with_targets(["f"]),
        Task::new("c", "second edit of f").with_sequence(2).with_targets(["f"]),
    ]
}

/// Build the graph, insert synchronization edges and wrap everything in a
/// fresh coordinator state.
pub fn coordinator_state(mut tasks: Vec<Task>) -> CoordinatorState {
    let mut dag = TaskDAG::build(&tasks).expect("acyclic test plan");
    conflicts::apply(&mut tasks, &mut dag, &ConflictSettings::default())
        .expect("conflict resolution");
    CoordinatorState::new(
        SessionId::parse("it").expect("valid session id"),
        TaskLedger::from_tasks(tasks).expect("unique ids"),
        dag,
    )
}

pub fn worker_pool(home: &TestHome, executor: Arc<dyn WorkerExecutor>, size: usize) -> WorkerPool {
    WorkerPool::new(
        executor,
        home.cleanup(),
        CoordinatorId::new(),
        PoolConfig {
            max_workers: size,
            grace_period: Duration::from_secs(5),
        },
    )
}

/// Scheduler settings with short health thresholds for paused-time tests.
pub fn wave_config(pool_size: usize) -> WaveConfig {
    WaveConfig {
        pool_size,
        wave_timeout: Duration::from_secs(600),
        health: HealthConfig {
            poll_interval: Duration::from_secs(1),
            warn_after: Duration::from_secs(5),
            release_after: Duration::from_secs(10),
            max_retries: 3,
        },
        breaker: BreakerConfig::default(),
        group_prefix: "it-".to_string(),
    }
}

/// Default config with a small pool, for coordinator-level tests.
pub fn test_config(pool_size: usize) -> Config {
    let mut config = Config::default();
    config.scheduler.pool_size = pool_size;
    config
}

/// Completes every assignment and reports its declared targets as touched.
pub struct Succeed;

#[async_trait]
impl WorkerExecutor for Succeed {
    async fn execute(&self, assignment: &Assignment, _: &ProgressReporter) -> WorkerReport {
        WorkerReport::completed().with_touched(assignment.targets.clone())
    }
}

/// Tracks which resource targets are held at any moment and records every
/// overlap it observes.
#[derive(Default)]
pub struct RecordingExecutor {
    held: Mutex<BTreeSet<String>>,
    pub overlaps: Mutex<Vec<(TaskId, String)>>,
    pub started: Mutex<Vec<TaskId>>,
    /// Tasks that always fail.
    pub doomed: BTreeSet<TaskId>,
}

impl RecordingExecutor {
    pub fn failing<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        Self {
            doomed: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn overlaps(&self) -> Vec<(TaskId, String)> {
        self.overlaps.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerExecutor for RecordingExecutor {
    async fn execute(&self, assignment: &Assignment, _: &ProgressReporter) -> WorkerReport {
        self.started.lock().unwrap().push(assignment.task_id.clone());
        {
            let mut held = self.held.lock().unwrap();
            for target in &assignment.targets {
                if !held.insert(target.clone()) {
                    self.overlaps
                        .lock()
                        .unwrap()
                        .push((assignment.task_id.clone(), target.clone()));
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut held = self.held.lock().unwrap();
            for target in &assignment.targets {
                held.remove(target);
            }
        }
        if self.doomed.contains(&assignment.task_id) {
            WorkerReport::failed("scripted failure")
        } else {
            WorkerReport::completed().with_touched(assignment.targets.clone())
        }
    }
}

/// Never reports progress on its first assignment; completes every later
/// one.
#[derive(Default)]
pub struct HangOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl WorkerExecutor for HangOnce {
    async fn execute(&self, _: &Assignment, _: &ProgressReporter) -> WorkerReport {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::future::pending::<()>().await;
        }
        WorkerReport::completed()
    }
}

pub fn critical(id: &str, artifact: &str) -> Finding {
    Finding::new(id, cadence::orchestration::Severity::P1, artifact)
}

/// Repairs "touch" every artifact that has a finding.
pub struct TouchAll;

#[async_trait]
impl Repairer for TouchAll {
    async fn repair(&self, _round: u32, findings: &[Finding]) -> cadence::Result<Vec<String>> {
        let mut touched: Vec<String> = findings.iter().map(|f| f.artifact.clone()).collect();
        touched.sort();
        touched.dedup();
        Ok(touched)
    }
}

/// Returns the same number of critical findings for every artifact on
/// every call.
pub struct StubbornScorer {
    pub per_artifact: usize,
    pub calls: AtomicUsize,
}

impl StubbornScorer {
    pub fn new(per_artifact: usize) -> Self {
        Self {
            per_artifact,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FindingScorer for StubbornScorer {
    async fn rescore(&self, artifacts: &[String]) -> cadence::Result<Vec<Finding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(artifacts
            .iter()
            .flat_map(|a| (0..self.per_artifact).map(move |i| critical(&format!("{}-{}", a, i), a)))
            .collect())
    }
}

/// Plays back a fixed sequence of finding counts, one per call; the last
/// entry repeats.
pub struct ScriptedScorer {
    script: Vec<usize>,
    calls: AtomicUsize,
}

impl ScriptedScorer {
    pub fn new(script: Vec<usize>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FindingScorer for ScriptedScorer {
    async fn rescore(&self, artifacts: &[String]) -> cadence::Result<Vec<Finding>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let count = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .copied()
            .unwrap_or(0);
        let artifact = artifacts.first().cloned().unwrap_or_else(|| "x".to_string());
        Ok((0..count)
            .map(|i| critical(&format!("s{}-{}", call, i), &artifact))
            .collect())
    }
}

/// Read a session artifact as raw JSON for equality checks.
pub fn read_artifact(home: &Path, session: &SessionId, name: &str) -> serde_json::Value {
    let paths = cadence::session::SessionPaths::new(home, session);
    let raw = std::fs::read_to_string(paths.artifact(name)).expect("artifact exists");
    serde_json::from_str(&raw).expect("artifact is JSON")
}
