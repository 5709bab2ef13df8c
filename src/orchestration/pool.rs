//! Worker Pool Manager.
//!
//! Owns the lifecycle of one worker group at a time: spawn (behind the
//! pre-create guard), assignment, signal polling, release of individual
//! workers, and graceful-then-forced shutdown. Every group is mirrored in
//! the durable registry so a later coordinator can find it if this one
//! dies.

use crate::cleanup::CleanupManager;
use crate::config::PoolSettings;
use crate::core::task::TaskId;
use crate::orchestration::worker::{
    worker_loop, Assignment, WorkerExecutor, WorkerId, WorkerMessage, WorkerRole, WorkerSignal,
};
use crate::session::CoordinatorId;
use crate::state::registry::{GroupId, GroupStatus, MemberStatus, TeardownMode, WorkerGroup};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_trace, clog_warn, Error, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const INBOX_CAPACITY: usize = 8;
const SIGNAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// How long shutdown waits for acknowledgements before force-terminating.
    pub grace_period: Duration,
}

impl PoolConfig {
    pub fn new(max_workers: usize, settings: &PoolSettings) -> Self {
        Self {
            max_workers,
            grace_period: Duration::from_secs(settings.grace_period_secs),
        }
    }
}

struct WorkerHandle {
    role: WorkerRole,
    inbox: mpsc::Sender<WorkerMessage>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    current: Option<TaskId>,
}

impl WorkerHandle {
    fn terminate(self) {
        self.cancel.cancel();
        self.join.abort();
    }
}

/// Outcome of [`WorkerPool::shutdown_group`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub acknowledged: Vec<WorkerId>,
    pub forced: Vec<WorkerId>,
    /// Tasks that were still running on force-terminated workers.
    pub returned: Vec<TaskId>,
    pub teardown: Option<TeardownMode>,
}

pub struct WorkerPool {
    executor: Arc<dyn WorkerExecutor>,
    cleanup: CleanupManager,
    owner: CoordinatorId,
    config: PoolConfig,
    group: Option<WorkerGroup>,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    signal_tx: mpsc::Sender<WorkerSignal>,
    signal_rx: mpsc::Receiver<WorkerSignal>,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<dyn WorkerExecutor>,
        cleanup: CleanupManager,
        owner: CoordinatorId,
        config: PoolConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        Self {
            executor,
            cleanup,
            owner,
            config,
            group: None,
            workers: BTreeMap::new(),
            signal_tx,
            signal_rx,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn owner(&self) -> CoordinatorId {
        self.owner
    }

    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        self.group.as_ref().map(|g| &g.group_id)
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn current_task(&self, worker: &WorkerId) -> Option<&TaskId> {
        self.workers.get(worker).and_then(|h| h.current.as_ref())
    }

    async fn persist_group(&self) {
        let Some(group) = self.group.clone() else {
            return;
        };
        let registry = self.cleanup.registry().clone();
        let id = group.group_id.clone();
        if let Err(e) = blocking(move || registry.save(&group)).await {
            clog_warn!("Failed to update registry for {}: {}", id, e);
        }
    }

    async fn set_member(&mut self, worker: &WorkerId, status: MemberStatus) {
        if let Some(group) = self.group.as_mut() {
            group.set_member_status(worker.as_str(), status);
        }
        self.persist_group().await;
    }

    /// Create a worker group and start its members.
    ///
    /// Any stale group registered under the same id is torn down first.
    pub async fn spawn_group(&mut self, group_id: GroupId, members: &[(WorkerId, WorkerRole)]) -> Result<()> {
        if let Some(active) = &self.group {
            return Err(Error::Validation(format!(
                "worker group {} is still active",
                active.group_id
            )));
        }
        if members.len() > self.config.max_workers {
            return Err(Error::PoolFull {
                max: self.config.max_workers,
            });
        }
        let distinct: BTreeSet<&WorkerId> = members.iter().map(|(w, _)| w).collect();
        if distinct.len() != members.len() {
            return Err(Error::Validation(format!(
                "duplicate worker names in group {}",
                group_id
            )));
        }

        let names: Vec<String> = members.iter().map(|(w, _)| w.to_string()).collect();
        let record = WorkerGroup::new(group_id.clone(), self.owner, &names);
        let cleanup = self.cleanup.clone();
        let pending = record.clone();
        blocking(move || {
            cleanup.guard_group_name(&pending.group_id)?;
            cleanup.registry().create(&pending)
        })
        .await?;
        self.group = Some(record);

        for (id, role) in members {
            let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
            let cancel = CancellationToken::new();
            let join = tokio::spawn(worker_loop(
                id.clone(),
                inbox_rx,
                self.signal_tx.clone(),
                Arc::clone(&self.executor),
                cancel.clone(),
            ));
            self.workers.insert(
                id.clone(),
                WorkerHandle {
                    role: *role,
                    inbox: inbox_tx,
                    cancel,
                    join,
                    current: None,
                },
            );
        }
        clog!("Spawned worker group {} with {} workers", group_id, members.len());
        Ok(())
    }

    /// Queue `assignment` on a worker's inbox.
    pub async fn assign(&mut self, worker: &WorkerId, assignment: Assignment) -> Result<()> {
        let handle = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| Error::WorkerNotFound(worker.to_string()))?;
        if !handle.role.can_handle(assignment.kind) {
            return Err(Error::Validation(format!(
                "{} cannot run {} task {}",
                worker, assignment.kind, assignment.task_id
            )));
        }
        let task = assignment.task_id.clone();
        handle
            .inbox
            .send(WorkerMessage::Assign(assignment))
            .await
            .map_err(|_| Error::WorkerNotFound(worker.to_string()))?;
        handle.current = Some(task.clone());
        clog_debug!("assigned {} to {}", task, worker);
        self.set_member(worker, MemberStatus::Busy).await;
        Ok(())
    }

    /// Wait up to `wait` for the next worker signal.
    pub async fn recv_signal(&mut self, wait: Duration) -> Option<WorkerSignal> {
        let signal = tokio::time::timeout(wait, self.signal_rx.recv())
            .await
            .ok()
            .flatten()?;
        clog_trace!("signal {:?}", signal);
        if let WorkerSignal::Finished { worker, task, .. } = &signal {
            let finished_current = self
                .workers
                .get(worker)
                .is_some_and(|h| h.current.as_ref() == Some(task));
            if finished_current {
                if let Some(handle) = self.workers.get_mut(worker) {
                    handle.current = None;
                }
                let worker = worker.clone();
                self.set_member(&worker, MemberStatus::Idle).await;
            }
        }
        Some(signal)
    }

    /// Forcefully stop one worker. Returns the task it was running.
    pub async fn release_worker(&mut self, worker: &WorkerId) -> Option<TaskId> {
        let handle = self.workers.remove(worker)?;
        let current = handle.current.clone();
        handle.terminate();
        clog_warn!("Released worker {}", worker);
        self.set_member(worker, MemberStatus::Terminated).await;
        current
    }

    /// Ask every worker to stop, wait out the grace period for
    /// acknowledgements, force-terminate the rest, then remove the group
    /// from the registry.
    pub async fn shutdown_group(&mut self) -> Result<ShutdownReport> {
        let mut report = ShutdownReport::default();
        let Some(group_id) = self.group.as_ref().map(|g| g.group_id.clone()) else {
            return Ok(report);
        };
        if let Some(group) = self.group.as_mut() {
            group.status = GroupStatus::ShuttingDown;
        }
        self.persist_group().await;

        let mut waiting: BTreeSet<WorkerId> = BTreeSet::new();
        for (id, handle) in &self.workers {
            if handle.inbox.try_send(WorkerMessage::Shutdown).is_ok() {
                waiting.insert(id.clone());
            }
        }

        let deadline = Instant::now() + self.config.grace_period;
        while !waiting.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.signal_rx.recv()).await {
                Ok(Some(WorkerSignal::ShutdownAck { worker })) => {
                    waiting.remove(&worker);
                    report.acknowledged.push(worker);
                }
                Ok(Some(other)) => {
                    clog_debug!("discarding late signal during shutdown: {:?}", other);
                }
                Ok(None) | Err(_) => break,
            }
        }

        let mut joins = Vec::new();
        for (id, handle) in std::mem::take(&mut self.workers) {
            if report.acknowledged.contains(&id) {
                joins.push(handle.join);
                continue;
            }
            clog_warn!("Worker {} did not acknowledge shutdown; terminating", id);
            if let Some(task) = handle.current.clone() {
                report.returned.push(task);
            }
            report.forced.push(id);
            handle.terminate();
        }

        join_all(joins).await;

        // Forced workers may have queued signals before they were aborted.
        while self.signal_rx.try_recv().is_ok() {}

        let registry = self.cleanup.registry().clone();
        let id = group_id.clone();
        let teardown = blocking(move || registry.teardown(&id)).await?;
        report.teardown = Some(teardown);
        self.group = None;
        clog!(
            "Worker group {} shut down ({} acknowledged, {} forced)",
            group_id,
            report.acknowledged.len(),
            report.forced.len()
        );
        Ok(report)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.values() {
            handle.cancel.cancel();
        }
    }
}
