//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its lifecycle status, current owner, predecessors, the resources it will
//! mutate, and how many times it has been retried.

use crate::orchestration::worker::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a task, as written by the plan author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of work a task represents. Drives the worker role it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Implementation,
    Verification,
    Other,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Implementation => write!(f, "implementation"),
            TaskKind::Verification => write!(f, "verification"),
            TaskKind::Other => write!(f, "other"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending -> in_progress -> {completed | failed -> pending | blocked}`.
/// `failed` is transient: the scheduler immediately requeues or blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Completed and blocked tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Blocked)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Failed, Blocked)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Ordinal risk tier, 0 (trivial) to 3 (critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub struct RiskTier(u8);

impl RiskTier {
    pub const MAX: u8 = 3;

    pub fn new(tier: u8) -> Option<Self> {
        (tier <= Self::MAX).then_some(Self(tier))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Extra verification passes a worker runs for this tier.
    pub fn verification_steps(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for RiskTier {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        RiskTier::new(value)
            .ok_or_else(|| format!("risk tier {} out of range 0..={}", value, RiskTier::MAX))
    }
}

impl From<RiskTier> for u8 {
    fn from(tier: RiskTier) -> Self {
        tier.0
    }
}

/// A single unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Worker currently holding the task.
    pub owner: Option<WorkerId>,
    /// Declared and inferred predecessors.
    pub blocked_by: BTreeSet<TaskId>,
    /// Resources this task may mutate. Empty means unrestricted.
    pub resource_targets: BTreeSet<String>,
    pub risk_tier: RiskTier,
    pub retry_count: u32,
    /// Position in the ingested plan; orders inferred edges.
    pub sequence: usize,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, subject: &str) -> Self {
        Self {
            id: id.into(),
            subject: subject.to_string(),
            description: String::new(),
            kind: TaskKind::default(),
            status: TaskStatus::Pending,
            owner: None,
            blocked_by: BTreeSet::new(),
            resource_targets: BTreeSet::new(),
            risk_tier: RiskTier::default(),
            retry_count: 0,
            sequence: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_risk_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = tier;
        self
    }

    pub fn with_sequence(mut self, sequence: usize) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.resource_targets.is_empty()
    }

    /// Resource targets shared with `other`. Unrestricted tasks share nothing.
    pub fn shared_targets<'a>(&'a self, other: &'a Task) -> impl Iterator<Item = &'a String> {
        self.resource_targets.intersection(&other.resource_targets)
    }

    pub fn conflicts_with(&self, other: &Task) -> bool {
        self.shared_targets(other).next().is_some()
    }
}
