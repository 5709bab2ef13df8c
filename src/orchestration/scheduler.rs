//! Wave Scheduler.
//!
//! Repeatedly takes the ready set from the ledger, packs as many mutually
//! non-conflicting tasks as the pool allows into a wave, runs that wave on a
//! fresh worker group and waits for every task in it to settle or for the
//! wave timeout. Runs until no task is `pending` or `in_progress`.

use crate::config::Config;
use crate::core::ledger::{CoordinatorState, StatusCounts, TaskLedger, TaskUpdate};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::orchestration::breaker::{BreakerBoard, BreakerConfig};
use crate::orchestration::health::{
    CooldownMap, HealthConfig, HealthEvent, RecoveryAction, StalenessMonitor,
};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::worker::{Assignment, ReportStatus, WorkerId, WorkerReport, WorkerRole, WorkerSignal};
use crate::state::checkpoint::{CheckpointEntry, CheckpointStore, PhaseStatus};
use crate::state::registry::GroupId;
use crate::{clog, clog_debug, clog_warn, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    WaveStarted { wave: usize, tasks: Vec<TaskId> },
    TaskStarted { task: TaskId, worker: WorkerId },
    TaskCompleted { task: TaskId, worker: WorkerId },
    TaskRequeued { task: TaskId, attempt: u32, reason: String },
    TaskBlocked { task: TaskId, reason: String },
    StaleWarning { task: TaskId, worker: WorkerId, idle: Duration },
    TaskReleased { task: TaskId, worker: WorkerId },
    OwnershipViolation { task: TaskId, undeclared: Vec<String> },
    WaveFinished { wave: usize, timed_out: bool },
    AllSettled { counts: StatusCounts },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaveConfig {
    pub pool_size: usize,
    pub wave_timeout: Duration,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    /// Prepended to `wave-<n>` to name each wave's worker group.
    pub group_prefix: String,
}

impl WaveConfig {
    pub fn from_config(config: &Config, group_prefix: impl Into<String>) -> Self {
        Self {
            pool_size: config.scheduler.pool_size,
            wave_timeout: config.scheduler.wave_timeout(),
            health: HealthConfig::from_settings(&config.health, &config.scheduler),
            breaker: BreakerConfig::default(),
            group_prefix: group_prefix.into(),
        }
    }
}

/// What happened in one wave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveReport {
    pub wave: usize,
    pub group: String,
    pub dispatched: Vec<(TaskId, WorkerId)>,
    pub completed: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub released: Vec<TaskId>,
    pub violations: Vec<(TaskId, Vec<String>)>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub waves: Vec<WaveReport>,
    pub counts: StatusCounts,
}

/// Records the current wave's group id against a pipeline phase, so a
/// coordinator resuming after a crash can find the group.
pub struct WaveJournal<'a> {
    pub store: &'a mut CheckpointStore,
    pub phase: &'a str,
}

/// Greedy conflict-free packing of the ready set, in plan order.
pub fn select_wave(ledger: &TaskLedger, pool_size: usize) -> Vec<TaskId> {
    let mut picked: Vec<&Task> = Vec::new();
    for task in ledger.ready() {
        if picked.len() >= pool_size {
            break;
        }
        if picked.iter().all(|p| !p.conflicts_with(task)) {
            picked.push(task);
        }
    }
    picked.into_iter().map(|t| t.id.clone()).collect()
}

pub struct WaveScheduler {
    config: WaveConfig,
    monitor: StalenessMonitor,
    cooldowns: CooldownMap,
    breakers: BreakerBoard,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl WaveScheduler {
    pub fn new(config: WaveConfig) -> Self {
        let breakers = BreakerBoard::new(config.breaker);
        Self {
            config,
            monitor: StalenessMonitor::new(),
            cooldowns: CooldownMap::new(),
            breakers,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Pick a distinct slot for every task in the wave.
    ///
    /// Preference order: a slot whose breaker allows work and that did not
    /// just fail this task; then any slot whose breaker allows work; then
    /// any unused slot.
    fn assign_slots(&self, ledger: &TaskLedger, wave: &[TaskId]) -> Vec<(TaskId, WorkerId, WorkerRole)> {
        let mut used: BTreeSet<WorkerId> = BTreeSet::new();
        let mut out = Vec::with_capacity(wave.len());
        for id in wave {
            let Some(task) = ledger.get(id) else { continue };
            let role = WorkerRole::for_kind(task.kind);
            let slots: Vec<WorkerId> = (1..=self.config.pool_size)
                .map(|n| WorkerId::slot(role, n))
                .filter(|w| !used.contains(w))
                .collect();

            let preferred = slots
                .iter()
                .find(|w| self.breakers.allows(w) && !self.cooldowns.is_cooling(id, w));
            let worker = match preferred {
                Some(w) => w.clone(),
                None => {
                    let fallback = slots
                        .iter()
                        .find(|w| self.breakers.allows(w))
                        .or_else(|| slots.first());
                    let Some(w) = fallback else { continue };
                    clog_warn!("No cooled-down slot for {}; reusing {}", id, w);
                    w.clone()
                }
            };
            used.insert(worker.clone());
            out.push((id.clone(), worker, role));
        }
        out
    }

    /// Mark pending tasks with a blocked predecessor as blocked, repeating
    /// until the chain is exhausted.
    fn block_starved(&self, ledger: &mut TaskLedger) -> Result<Vec<TaskId>> {
        let mut blocked = Vec::new();
        loop {
            let starved = ledger.starved();
            if starved.is_empty() {
                return Ok(blocked);
            }
            for (task, pred) in starved {
                let reason = format!("dependency {} is blocked", pred);
                clog_warn!("Blocking {}: {}", task, reason);
                ledger.update(&task, TaskUpdate::status(TaskStatus::Blocked).error(reason.clone()))?;
                self.emit(SchedulerEvent::TaskBlocked {
                    task: task.clone(),
                    reason,
                });
                blocked.push(task);
            }
        }
    }

    /// Run waves until every task is terminal.
    pub async fn run(
        &mut self,
        state: &mut CoordinatorState,
        pool: &mut WorkerPool,
        mut journal: Option<WaveJournal<'_>>,
    ) -> Result<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut wave_no = 0usize;

        loop {
            self.block_starved(&mut state.ledger)?;
            let counts = state.ledger.counts();
            if counts.pending == 0 && counts.in_progress == 0 {
                break;
            }

            let wave = select_wave(&state.ledger, self.config.pool_size);
            if wave.is_empty() {
                // Every remaining task waits on something that will never finish.
                let stuck: Vec<TaskId> = state
                    .ledger
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.id.clone())
                    .collect();
                for id in stuck {
                    clog_warn!("Task {} has no runnable predecessor chain", id);
                    let reason = "no runnable predecessor chain".to_string();
                    state
                        .ledger
                        .update(&id, TaskUpdate::status(TaskStatus::Blocked).error(reason.clone()))?;
                    self.emit(SchedulerEvent::TaskBlocked { task: id, reason });
                }
                continue;
            }

            wave_no += 1;
            self.breakers.tick();
            let group = GroupId::parse(&format!("{}wave-{}", self.config.group_prefix, wave_no))?;
            if let Some(journal) = journal.as_mut() {
                journal
                    .store
                    .append(
                        journal.phase,
                        PhaseStatus::InProgress,
                        CheckpointEntry {
                            artifact: None,
                            worker_group_id: Some(group.as_str()),
                        },
                    )
                    .await?;
            }
            let wave_report = self.run_wave(wave_no, group, wave, &mut state.ledger, pool).await?;
            report.waves.push(wave_report);
        }

        report.counts = state.ledger.counts();
        clog!(
            "All tasks settled after {} waves: {} completed, {} blocked",
            report.waves.len(),
            report.counts.completed,
            report.counts.blocked
        );
        self.emit(SchedulerEvent::AllSettled {
            counts: report.counts,
        });
        Ok(report)
    }

    async fn run_wave(
        &mut self,
        wave_no: usize,
        group: GroupId,
        wave: Vec<TaskId>,
        ledger: &mut TaskLedger,
        pool: &mut WorkerPool,
    ) -> Result<WaveReport> {
        let mut report = WaveReport {
            wave: wave_no,
            group: group.to_string(),
            ..WaveReport::default()
        };
        let slots = self.assign_slots(ledger, &wave);
        let members: Vec<(WorkerId, WorkerRole)> =
            slots.iter().map(|(_, w, r)| (w.clone(), *r)).collect();

        clog!("Wave {}: dispatching {} tasks on {}", wave_no, slots.len(), group);
        self.emit(SchedulerEvent::WaveStarted {
            wave: wave_no,
            tasks: wave.clone(),
        });
        pool.spawn_group(group, &members).await?;

        let mut outstanding: BTreeMap<TaskId, WorkerId> = BTreeMap::new();
        for (task_id, worker, role) in &slots {
            let Some(task) = ledger.get(task_id) else { continue };
            let assignment = Assignment {
                task_id: task.id.clone(),
                subject: task.subject.clone(),
                kind: task.kind,
                targets: task.resource_targets.iter().cloned().collect(),
                risk_tier: task.risk_tier,
                verification_steps: task.risk_tier.verification_steps(),
                role: *role,
            };
            ledger.update(
                task_id,
                TaskUpdate::status(TaskStatus::InProgress).owner(worker.clone()),
            )?;
            self.monitor.watch(task_id, worker, Instant::now());
            report.dispatched.push((task_id.clone(), worker.clone()));

            if let Err(e) = pool.assign(worker, assignment).await {
                clog_warn!("Could not assign {} to {}: {}", task_id, worker, e);
                self.handle_failure(ledger, task_id, worker, &e.to_string(), &mut report)?;
                continue;
            }
            self.emit(SchedulerEvent::TaskStarted {
                task: task_id.clone(),
                worker: worker.clone(),
            });
            outstanding.insert(task_id.clone(), worker.clone());
        }

        let deadline = Instant::now() + self.config.wave_timeout;
        while !outstanding.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                report.timed_out = true;
                clog_warn!(
                    "Wave {} timed out with {} tasks outstanding",
                    wave_no,
                    outstanding.len()
                );
                break;
            }
            let wait = self.config.health.poll_interval.min(deadline - now);
            if let Some(signal) = pool.recv_signal(wait).await {
                self.on_signal(signal, ledger, &mut outstanding, &mut report)?;
            }
            self.check_health(ledger, pool, &mut outstanding, &mut report)
                .await?;
        }

        let shutdown = pool.shutdown_group().await?;
        for task in &shutdown.returned {
            clog_debug!("{} was in flight on a force-terminated worker", task);
        }
        // Anything still outstanding never reported back.
        let reason = if report.timed_out {
            "wave timed out"
        } else {
            "worker terminated"
        };
        for (task, worker) in std::mem::take(&mut outstanding) {
            self.handle_failure(ledger, &task, &worker, reason, &mut report)?;
        }

        clog!(
            "Wave {} finished: {} completed, {} requeued, {} blocked",
            wave_no,
            report.completed.len(),
            report.requeued.len(),
            report.blocked.len()
        );
        self.emit(SchedulerEvent::WaveFinished {
            wave: wave_no,
            timed_out: report.timed_out,
        });
        Ok(report)
    }

    fn owns(ledger: &TaskLedger, task: &TaskId, worker: &WorkerId) -> bool {
        ledger
            .get(task)
            .is_some_and(|t| t.status == TaskStatus::InProgress && t.owner.as_ref() == Some(worker))
    }

    fn on_signal(
        &mut self,
        signal: WorkerSignal,
        ledger: &mut TaskLedger,
        outstanding: &mut BTreeMap<TaskId, WorkerId>,
        report: &mut WaveReport,
    ) -> Result<()> {
        match signal {
            WorkerSignal::Claimed { worker, task } | WorkerSignal::Progress { worker, task } => {
                self.monitor.touch(&task, &worker, Instant::now());
            }
            WorkerSignal::Finished {
                worker,
                task,
                report: worker_report,
            } => {
                if !Self::owns(ledger, &task, &worker) {
                    clog_debug!("Discarding result for {} from {}: not the owner", task, worker);
                    return Ok(());
                }
                self.monitor.forget(&task);
                outstanding.remove(&task);
                self.check_touched(ledger, &task, &worker_report, report);
                match worker_report.status {
                    ReportStatus::Completed => {
                        ledger.update(&task, TaskUpdate::status(TaskStatus::Completed))?;
                        self.cooldowns.clear(&task);
                        self.breakers.record_success(&worker);
                        clog!("{} completed by {}", task, worker);
                        self.emit(SchedulerEvent::TaskCompleted {
                            task: task.clone(),
                            worker,
                        });
                        report.completed.push(task);
                    }
                    ReportStatus::Failed | ReportStatus::Blocked => {
                        let reason = worker_report.summary.clone().unwrap_or_else(|| {
                            match worker_report.status {
                                ReportStatus::Blocked => "worker reported blocked",
                                _ => "worker reported failure",
                            }
                            .to_string()
                        });
                        self.handle_failure(ledger, &task, &worker, &reason, report)?;
                    }
                }
            }
            WorkerSignal::ShutdownAck { .. } => {}
        }
        Ok(())
    }

    fn check_touched(
        &self,
        ledger: &TaskLedger,
        task: &TaskId,
        worker_report: &WorkerReport,
        report: &mut WaveReport,
    ) {
        let Some(entry) = ledger.get(task) else { return };
        if entry.is_unrestricted() {
            return;
        }
        let declared: Vec<String> = entry.resource_targets.iter().cloned().collect();
        let undeclared = worker_report.undeclared_touches(&declared);
        if undeclared.is_empty() {
            return;
        }
        clog_warn!(
            "{} touched undeclared resources: {}",
            task,
            undeclared.join(", ")
        );
        self.emit(SchedulerEvent::OwnershipViolation {
            task: task.clone(),
            undeclared: undeclared.clone(),
        });
        report.violations.push((task.clone(), undeclared));
    }

    async fn check_health(
        &mut self,
        ledger: &mut TaskLedger,
        pool: &mut WorkerPool,
        outstanding: &mut BTreeMap<TaskId, WorkerId>,
        report: &mut WaveReport,
    ) -> Result<()> {
        for event in self.monitor.check(Instant::now(), &self.config.health) {
            match event {
                HealthEvent::Stale { task, worker, idle } => {
                    clog_warn!("{} on {} has made no progress for {:?}", task, worker, idle);
                    self.emit(SchedulerEvent::StaleWarning { task, worker, idle });
                }
                HealthEvent::Release { task, worker, idle } => {
                    if !Self::owns(ledger, &task, &worker) {
                        continue;
                    }
                    clog_warn!("Releasing {} from {} after {:?} idle", task, worker, idle);
                    pool.release_worker(&worker).await;
                    outstanding.remove(&task);
                    self.emit(SchedulerEvent::TaskReleased {
                        task: task.clone(),
                        worker: worker.clone(),
                    });
                    report.released.push(task.clone());
                    let reason = format!("no progress for {}s", idle.as_secs());
                    self.handle_failure(ledger, &task, &worker, &reason, report)?;
                }
            }
        }
        Ok(())
    }

    /// Failed attempt: back to `pending` with the owner cleared, or
    /// `blocked` once the retry cap is exceeded.
    fn handle_failure(
        &mut self,
        ledger: &mut TaskLedger,
        task: &TaskId,
        worker: &WorkerId,
        reason: &str,
        report: &mut WaveReport,
    ) -> Result<()> {
        self.monitor.forget(task);
        let retry_count = match ledger.get(task) {
            Some(t) if t.status == TaskStatus::InProgress => t.retry_count,
            _ => return Ok(()),
        };
        self.breakers.record_failure(worker);
        ledger.update(task, TaskUpdate::status(TaskStatus::Failed).error(reason))?;

        match RecoveryAction::after_failure(retry_count, self.config.health.max_retries) {
            RecoveryAction::Requeue { attempt } => {
                ledger.update(
                    task,
                    TaskUpdate::status(TaskStatus::Pending)
                        .clear_owner()
                        .retries(attempt),
                )?;
                self.cooldowns.cool(task, worker);
                clog!("{} failed on {} ({}); retry {}", task, worker, reason, attempt);
                self.emit(SchedulerEvent::TaskRequeued {
                    task: task.clone(),
                    attempt,
                    reason: reason.to_string(),
                });
                report.requeued.push(task.clone());
            }
            RecoveryAction::Block { attempts } => {
                ledger.update(
                    task,
                    TaskUpdate::status(TaskStatus::Blocked)
                        .clear_owner()
                        .retries(attempts),
                )?;
                clog_warn!("{} blocked after {} attempts: {}", task, attempts, reason);
                self.emit(SchedulerEvent::TaskBlocked {
                    task: task.clone(),
                    reason: reason.to_string(),
                });
                report.blocked.push(task.clone());
            }
        }
        Ok(())
    }
}
