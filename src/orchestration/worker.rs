//! Worker invocation contract and message protocol.
//!
//! A worker is an independent unit with no shared memory. The coordinator
//! talks to it only through a [`WorkerMessage`] inbox and receives
//! [`WorkerSignal`]s back on a shared channel. Message handling is
//! turn-based: a worker busy with a task reads its inbox only after the
//! task finishes.

use crate::core::task::{RiskTier, TaskId, TaskKind};
use crate::{clog_debug, clog_trace};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on a report summary, in bytes.
pub const MAX_SUMMARY_BYTES: usize = 4096;

/// Stable worker slot name, e.g. `implementer-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn slot(role: WorkerRole, n: usize) -> Self {
        Self(format!("{}-{}", role.as_str(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Implement,
    Verify,
    Explore,
}

/// Typed worker role. Roles are matched by capability, never by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Implementer,
    Verifier,
    Generalist,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 3] = [
        WorkerRole::Implementer,
        WorkerRole::Verifier,
        WorkerRole::Generalist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Implementer => "implementer",
            WorkerRole::Verifier => "verifier",
            WorkerRole::Generalist => "generalist",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            WorkerRole::Implementer => &[Capability::Implement],
            WorkerRole::Verifier => &[Capability::Verify],
            WorkerRole::Generalist => &[Capability::Implement, Capability::Verify, Capability::Explore],
        }
    }

    pub fn required_capability(kind: TaskKind) -> Capability {
        match kind {
            TaskKind::Implementation => Capability::Implement,
            TaskKind::Verification => Capability::Verify,
            TaskKind::Other => Capability::Explore,
        }
    }

    pub fn can_handle(&self, kind: TaskKind) -> bool {
        self.capabilities()
            .contains(&Self::required_capability(kind))
    }

    /// Narrowest role able to run a task of this kind.
    pub fn for_kind(kind: TaskKind) -> Self {
        Self::ALL
            .into_iter()
            .find(|r| r.can_handle(kind))
            .unwrap_or(WorkerRole::Generalist)
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker receives for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub subject: String,
    pub kind: TaskKind,
    pub targets: Vec<String>,
    pub risk_tier: RiskTier,
    /// Extra verification passes the worker owes, derived from the tier.
    pub verification_steps: u8,
    pub role: WorkerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed,
    Blocked,
}

/// Terminal result of one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: ReportStatus,
    /// Resources actually modified, checked against the declared targets.
    #[serde(default)]
    pub touched: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl WorkerReport {
    pub fn completed() -> Self {
        Self {
            status: ReportStatus::Completed,
            touched: Vec::new(),
            summary: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Failed,
            touched: Vec::new(),
            summary: Some(reason.into()),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Blocked,
            touched: Vec::new(),
            summary: Some(reason.into()),
        }
    }

    pub fn with_touched<I, S>(mut self, touched: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.touched = touched.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Clamp the summary to [`MAX_SUMMARY_BYTES`].
    pub fn bounded(mut self) -> Self {
        if let Some(summary) = self.summary.as_mut() {
            if summary.len() > MAX_SUMMARY_BYTES {
                let cut = crate::util::truncate_utf8(summary, MAX_SUMMARY_BYTES).len();
                summary.truncate(cut);
            }
        }
        self
    }

    /// Touched resources outside `declared`. Unrestricted tasks
    /// (empty `declared`) never violate.
    pub fn undeclared_touches(&self, declared: &[String]) -> Vec<String> {
        if declared.is_empty() {
            return Vec::new();
        }
        self.touched
            .iter()
            .filter(|t| !declared.contains(t))
            .cloned()
            .collect()
    }
}

/// Coordinator -> worker.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Assign(Assignment),
    Shutdown,
}

/// Worker -> coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerSignal {
    Claimed { worker: WorkerId, task: TaskId },
    Progress { worker: WorkerId, task: TaskId },
    Finished { worker: WorkerId, task: TaskId, report: WorkerReport },
    ShutdownAck { worker: WorkerId },
}

impl WorkerSignal {
    pub fn worker(&self) -> &WorkerId {
        match self {
            WorkerSignal::Claimed { worker, .. }
            | WorkerSignal::Progress { worker, .. }
            | WorkerSignal::Finished { worker, .. }
            | WorkerSignal::ShutdownAck { worker } => worker,
        }
    }
}

/// Lets an executor report liveness while it works on a task.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    worker: WorkerId,
    task: TaskId,
    tx: mpsc::Sender<WorkerSignal>,
}

impl ProgressReporter {
    pub fn new(worker: WorkerId, task: TaskId, tx: mpsc::Sender<WorkerSignal>) -> Self {
        Self { worker, task, tx }
    }

    pub async fn beat(&self) {
        let _ = self
            .tx
            .send(WorkerSignal::Progress {
                worker: self.worker.clone(),
                task: self.task.clone(),
            })
            .await;
    }
}

/// The work itself. The engine only cares about the returned report.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, assignment: &Assignment, progress: &ProgressReporter) -> WorkerReport;
}

/// Run one worker until it is told to shut down or is cancelled.
pub async fn worker_loop(
    id: WorkerId,
    mut inbox: mpsc::Receiver<WorkerMessage>,
    signals: mpsc::Sender<WorkerSignal>,
    executor: Arc<dyn WorkerExecutor>,
    cancel: CancellationToken,
) {
    clog_debug!("worker {} started", id);
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbox.recv() => message,
        };

        match message {
            Some(WorkerMessage::Assign(assignment)) => {
                let task = assignment.task_id.clone();
                clog_trace!("worker {} claimed {}", id, task);
                let _ = signals
                    .send(WorkerSignal::Claimed {
                        worker: id.clone(),
                        task: task.clone(),
                    })
                    .await;

                let progress = ProgressReporter::new(id.clone(), task.clone(), signals.clone());
                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = executor.execute(&assignment, &progress) => report,
                };
                let _ = signals
                    .send(WorkerSignal::Finished {
                        worker: id.clone(),
                        task,
                        report: report.bounded(),
                    })
                    .await;
            }
            Some(WorkerMessage::Shutdown) | None => {
                let _ = signals
                    .send(WorkerSignal::ShutdownAck { worker: id.clone() })
                    .await;
                break;
            }
        }
    }
    clog_debug!("worker {} stopped", id);
}
