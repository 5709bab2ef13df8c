//! Pipeline coordinator.
//!
//! Drives a session through `plan -> execute -> converge`. Every phase is
//! checkpointed on entry and on exit together with a hash of its artifact;
//! a resumed session skips verified phases and reloads their artifacts.
//!
//! Before any phase runs the coordinator reclaims orphaned worker groups:
//! groups referenced by this session's checkpoints, then any group past the
//! orphan threshold, then (at the start of `execute`) anything carrying the
//! stage's own group-name prefix.

use crate::cleanup::{CleanupConfig, CleanupManager, CleanupReport};
use crate::config::Config;
use crate::core::dag::{EdgeRecord, TaskDAG};
use crate::core::ledger::{CoordinatorState, StatusCounts, TaskLedger};
use crate::core::plan::PlanFile;
use crate::core::task::{Task, TaskStatus};
use crate::orchestration::conflicts;
use crate::orchestration::convergence::{
    ConvergenceLoop, ConvergenceOutcome, FindingScorer, Repairer, Verdict,
};
use crate::orchestration::pool::{PoolConfig, WorkerPool};
use crate::orchestration::scheduler::{
    ScheduleReport, SchedulerEvent, WaveConfig, WaveJournal, WaveScheduler,
};
use crate::orchestration::worker::WorkerExecutor;
use crate::session::{CoordinatorId, Session, SessionId, SessionPaths, SessionStatus};
use crate::state::checkpoint::{
    Checkpoint, CheckpointEntry, CheckpointStore, PhaseStatus, ResumeAction,
};
use crate::state::registry::GroupRegistry;
use crate::util::{blocking, write_atomic};
use crate::workflow::types::{Phase, PhaseOutcome, PhaseRecord, PipelineReport};
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Contents of `plan.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub tasks: Vec<Task>,
    pub edges: Vec<EdgeRecord>,
}

/// Contents of `ledger.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteArtifact {
    pub ledger: TaskLedger,
    pub schedule: ScheduleReport,
}

/// Read-only view of a session for `cadence status`.
#[derive(Debug, Clone)]
pub struct SessionOverview {
    pub session: Session,
    /// Newest checkpoint of each phase, in pipeline order.
    pub checkpoints: Vec<Checkpoint>,
    pub counts: Option<StatusCounts>,
    pub convergence: Option<Verdict>,
}

#[derive(Default)]
struct RunContext {
    state: Option<CoordinatorState>,
    convergence: Option<Verdict>,
    cleanup: CleanupReport,
}

impl RunContext {
    fn state_mut(&mut self, phase: Phase) -> Result<&mut CoordinatorState> {
        self.state
            .as_mut()
            .ok_or_else(|| Error::Validation(format!("phase {} needs a plan", phase)))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

async fn load_artifact<T>(path: PathBuf) -> Result<T>
where
    T: DeserializeOwned + Send + 'static,
{
    blocking(move || read_json(&path)).await
}

async fn store_artifact<T: Serialize>(path: PathBuf, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    blocking(move || write_atomic(&path, body.as_bytes())).await
}

async fn save_session(session: &Session, paths: &SessionPaths) -> Result<()> {
    let (session, paths) = (session.clone(), paths.clone());
    blocking(move || session.save(&paths)).await
}

pub struct Coordinator {
    home: PathBuf,
    config: Config,
    id: CoordinatorId,
    executor: Arc<dyn WorkerExecutor>,
    repairer: Option<Arc<dyn Repairer>>,
    scorer: Option<Arc<dyn FindingScorer>>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Coordinator {
    pub fn new(home: impl Into<PathBuf>, config: Config, executor: Arc<dyn WorkerExecutor>) -> Self {
        Self {
            home: home.into(),
            config,
            id: CoordinatorId::new(),
            executor,
            repairer: None,
            scorer: None,
            events: None,
        }
    }

    /// Enable the `converge` phase.
    pub fn with_convergence(mut self, repairer: Arc<dyn Repairer>, scorer: Arc<dyn FindingScorer>) -> Self {
        self.repairer = Some(repairer);
        self.scorer = Some(scorer);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn phases(&self) -> Vec<Phase> {
        Phase::pipeline(self.repairer.is_some() && self.scorer.is_some())
    }

    fn cleanup_manager(&self) -> CleanupManager {
        CleanupManager::new(
            GroupRegistry::from_home(&self.home),
            CleanupConfig::from_settings(&self.config.pool),
        )
    }

    /// Start a new session for the plan at `plan_path`.
    pub async fn start(&self, plan_path: &Path, session_id: Option<SessionId>) -> Result<PipelineReport> {
        let id = session_id.unwrap_or_else(SessionId::generate);
        let paths = SessionPaths::new(&self.home, &id);
        if paths.meta().exists() {
            return Err(Error::Validation(format!(
                "session {} already exists; use resume",
                id
            )));
        }
        let plan_path = plan_path
            .canonicalize()
            .unwrap_or_else(|_| plan_path.to_path_buf());
        let mut session = Session::new(id, plan_path, self.id);
        save_session(&session, &paths).await?;
        clog!("Session {} started by coordinator {}", session.id, self.id.short());
        self.drive(&mut session, &paths).await
    }

    /// Continue an existing session from its checkpoints.
    pub async fn resume(&self, id: &SessionId) -> Result<PipelineReport> {
        let paths = SessionPaths::new(&self.home, id);
        let meta = paths.clone();
        let mut session = blocking(move || Session::load(&meta)).await?;
        clog!(
            "Session {} resumed by coordinator {} (was {})",
            id,
            self.id.short(),
            session.coordinator_id.short()
        );
        session.coordinator_id = self.id;
        session.set_status(SessionStatus::Running);
        save_session(&session, &paths).await?;
        self.drive(&mut session, &paths).await
    }

    async fn drive(&self, session: &mut Session, paths: &SessionPaths) -> Result<PipelineReport> {
        let cleanup = self.cleanup_manager();
        let mut ctx = RunContext::default();

        let preflight = cleanup.clone();
        let journal = paths.checkpoints();
        let (mut store, report) = blocking(move || {
            let mut store = CheckpointStore::open(&journal)?;
            let mut report = preflight.reconcile_checkpoints(&mut store)?;
            report.merge(preflight.reclaim_stale(Utc::now(), |_| true)?);
            Ok((store, report))
        })
        .await?;
        ctx.cleanup = report;
        if !ctx.cleanup.is_empty() {
            clog!(
                "Preflight cleanup: {} orphaned, {} removed, {} phases reset",
                ctx.cleanup.orphaned_count(),
                ctx.cleanup.removed_count(),
                ctx.cleanup.reset_phases.len()
            );
        }

        let phases = self.phases();
        let names: Vec<&str> = phases.iter().map(Phase::as_str).collect();
        let decisions = store.plan_resume(&names);

        let mut records = Vec::new();
        let mut status = SessionStatus::Completed;
        let mut fatal = None;

        for (phase, decision) in phases.iter().copied().zip(decisions) {
            if let ResumeAction::Run(reason) = &decision.action {
                clog!("Phase {}: running ({:?})", phase, reason);
            } else {
                self.load_phase(phase, session, paths, &mut ctx).await?;
                clog!("Phase {}: checkpoint verified, skipping", phase);
                records.push(PhaseRecord {
                    phase,
                    outcome: PhaseOutcome::Skipped,
                    detail: None,
                });
                continue;
            }

            store
                .append(phase.as_str(), PhaseStatus::InProgress, CheckpointEntry::default())
                .await?;
            let result = self
                .run_phase(phase, session, paths, &cleanup, &mut store, &mut ctx)
                .await;

            match result {
                Ok(PhaseOutcome::Completed) => {
                    store
                        .append(
                            phase.as_str(),
                            PhaseStatus::Completed,
                            CheckpointEntry {
                                artifact: Some(phase.artifact()),
                                worker_group_id: None,
                            },
                        )
                        .await?;
                    clog!("Phase {}: completed", phase);
                    records.push(PhaseRecord {
                        phase,
                        outcome: PhaseOutcome::Completed,
                        detail: None,
                    });
                }
                Ok(outcome) => {
                    store
                        .append(phase.as_str(), PhaseStatus::Failed, CheckpointEntry::default())
                        .await?;
                    clog_warn!(
                        "Phase {} exceeded {:?}; halting",
                        phase,
                        self.config.pipeline.phase_timeout()
                    );
                    records.push(PhaseRecord {
                        phase,
                        outcome,
                        detail: Some("phase timeout".to_string()),
                    });
                    status = SessionStatus::Halted;
                    break;
                }
                Err(e) => {
                    store
                        .append(phase.as_str(), PhaseStatus::Failed, CheckpointEntry::default())
                        .await?;
                    records.push(PhaseRecord {
                        phase,
                        outcome: PhaseOutcome::Failed,
                        detail: Some(e.to_string()),
                    });
                    if e.is_configuration() {
                        clog_error!("Phase {} failed: {}", phase, e);
                        status = SessionStatus::Failed;
                        fatal = Some(e);
                    } else {
                        clog_warn!("Phase {} failed: {}; halting", phase, e);
                        status = SessionStatus::Halted;
                    }
                    break;
                }
            }
        }

        if status == SessionStatus::Completed && ctx.convergence == Some(Verdict::Halted) {
            status = SessionStatus::Halted;
        }
        session.set_status(status);
        save_session(session, paths).await?;
        if let Some(e) = fatal {
            return Err(e);
        }

        let counts = ctx.state.as_ref().map(|s| s.ledger.counts());
        clog!("Session {} finished: {}", session.id, status);
        Ok(PipelineReport {
            session_id: session.id.clone(),
            status,
            phases: records,
            counts,
            convergence: ctx.convergence,
            cleanup: ctx.cleanup,
        })
    }

    /// Reload the artifact of a phase whose checkpoint was verified.
    async fn load_phase(
        &self,
        phase: Phase,
        session: &Session,
        paths: &SessionPaths,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let path = paths.artifact(phase.artifact());
        match phase {
            Phase::Plan => {
                let artifact: PlanArtifact = load_artifact(path.clone()).await?;
                let ids: Vec<_> = artifact.tasks.iter().map(|t| t.id.clone()).collect();
                let dag = TaskDAG::from_records(&ids, &artifact.edges)?;
                let ledger = TaskLedger::from_tasks(artifact.tasks)?;
                let mut state = CoordinatorState::new(session.id.clone(), ledger, dag);
                state.coordinator_id = self.id;
                ctx.state = Some(state);
            }
            Phase::Execute => {
                let mut artifact: ExecuteArtifact = load_artifact(path.clone()).await?;
                artifact.ledger.reindex()?;
                ctx.state_mut(phase)?.ledger = artifact.ledger;
            }
            Phase::Converge => {
                let outcome: ConvergenceOutcome = load_artifact(path.clone()).await?;
                ctx.convergence = Some(outcome.verdict);
                ctx.state_mut(phase)?.convergence = outcome.rounds;
            }
        }
        clog_debug!("reloaded {} artifact {}", phase, path.display());
        Ok(())
    }

    async fn run_phase(
        &self,
        phase: Phase,
        session: &Session,
        paths: &SessionPaths,
        cleanup: &CleanupManager,
        store: &mut CheckpointStore,
        ctx: &mut RunContext,
    ) -> Result<PhaseOutcome> {
        let limit = self.config.pipeline.phase_timeout();
        match phase {
            Phase::Plan => {
                let Ok(built) = tokio::time::timeout(limit, self.plan_phase(session)).await else {
                    return Ok(PhaseOutcome::TimedOut);
                };
                let (state, artifact) = built?;
                store_artifact(paths.artifact(phase.artifact()), &artifact).await?;
                ctx.state = Some(state);
            }
            Phase::Execute => {
                let prefix = format!("{}-execute-", session.id);
                let stage = cleanup.clone();
                let (scan_prefix, owner) = (prefix.clone(), self.id);
                let report = blocking(move || stage.reclaim_prefixed(&scan_prefix, owner)).await?;
                ctx.cleanup.merge(report);

                let mut pool = WorkerPool::new(
                    Arc::clone(&self.executor),
                    self.cleanup_manager(),
                    self.id,
                    PoolConfig::new(self.config.scheduler.pool_size, &self.config.pool),
                );
                let mut scheduler = WaveScheduler::new(WaveConfig::from_config(&self.config, prefix));
                if let Some(tx) = &self.events {
                    scheduler = scheduler.with_events(tx.clone());
                }
                let state = ctx.state_mut(phase)?;
                let journal = WaveJournal {
                    store,
                    phase: phase.as_str(),
                };
                let run = tokio::time::timeout(limit, scheduler.run(state, &mut pool, Some(journal))).await;
                let schedule = match run {
                    Ok(schedule) => schedule?,
                    Err(_) => {
                        if let Err(e) = pool.shutdown_group().await {
                            clog_warn!("Could not shut down worker group after timeout: {}", e);
                        }
                        return Ok(PhaseOutcome::TimedOut);
                    }
                };
                let artifact = ExecuteArtifact {
                    ledger: state.ledger.clone(),
                    schedule,
                };
                store_artifact(paths.artifact(phase.artifact()), &artifact).await?;
            }
            Phase::Converge => {
                let (Some(repairer), Some(scorer)) = (&self.repairer, &self.scorer) else {
                    return Ok(PhaseOutcome::Completed);
                };
                let state = ctx.state_mut(phase)?;
                let artifacts: BTreeSet<String> = state
                    .ledger
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .flat_map(|t| t.resource_targets.iter().cloned())
                    .collect();
                let artifacts: Vec<String> = artifacts.into_iter().collect();
                let convergence = ConvergenceLoop::from_settings(&self.config.convergence);

                let body = async {
                    if artifacts.is_empty() {
                        return Ok::<_, Error>(ConvergenceOutcome {
                            verdict: Verdict::Converged,
                            rounds: Vec::new(),
                            remaining: Vec::new(),
                            evaluations: 0,
                        });
                    }
                    let initial = scorer.rescore(&artifacts).await?;
                    Ok(convergence
                        .run(initial, repairer.as_ref(), scorer.as_ref())
                        .await)
                };
                let Ok(outcome) = tokio::time::timeout(limit, body).await else {
                    return Ok(PhaseOutcome::TimedOut);
                };
                let outcome = outcome?;
                state.convergence.extend(outcome.rounds.iter().cloned());
                ctx.convergence = Some(outcome.verdict);
                store_artifact(paths.artifact(phase.artifact()), &outcome).await?;
            }
        }
        Ok(PhaseOutcome::Completed)
    }

    async fn plan_phase(&self, session: &Session) -> Result<(CoordinatorState, PlanArtifact)> {
        let plan_path = session.plan_path.clone();
        let plan = blocking(move || PlanFile::load(&plan_path)).await?;
        let mut tasks = plan.into_tasks(&self.config.conflicts)?;
        let mut dag = TaskDAG::build(&tasks)?;
        let resolution = conflicts::apply(&mut tasks, &mut dag, &self.config.conflicts)?;
        clog!(
            "Plan: {} tasks, {} declared edges, {} synchronization edges",
            tasks.len(),
            dag.edge_count() - resolution.edges.len(),
            resolution.edges.len()
        );
        let artifact = PlanArtifact {
            tasks: tasks.clone(),
            edges: dag.edges(),
        };
        let ledger = TaskLedger::from_tasks(tasks)?;
        let mut state = CoordinatorState::new(session.id.clone(), ledger, dag);
        state.coordinator_id = self.id;
        Ok((state, artifact))
    }
}

/// Load what `cadence status` shows without touching any state.
pub fn inspect(home: &Path, id: &SessionId) -> Result<SessionOverview> {
    let paths = SessionPaths::new(home, id);
    let session = Session::load(&paths)?;
    let store = CheckpointStore::open(&paths.checkpoints())?;
    let checkpoints = Phase::ALL
        .iter()
        .filter_map(|p| store.latest(p.as_str()).cloned())
        .collect();

    let counts = read_json::<ExecuteArtifact>(&paths.artifact(Phase::Execute.artifact()))
        .ok()
        .map(|a| a.ledger.counts());
    let convergence = read_json::<ConvergenceOutcome>(&paths.artifact(Phase::Converge.artifact()))
        .ok()
        .map(|o| o.verdict);
    Ok(SessionOverview {
        session,
        checkpoints,
        counts,
        convergence,
    })
}
