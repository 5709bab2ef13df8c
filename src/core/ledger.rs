//! Task ledger: the only mutation surface for task state.
//!
//! The scheduler, the pool and (through their signals) the workers all go
//! through [`TaskLedger::update`], which enforces the task state machine.

use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId, TaskKind, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::convergence::ConvergenceRound;
use crate::orchestration::worker::WorkerId;
use crate::session::{CoordinatorId, SessionId};
use crate::clog_debug;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fields to change on a task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the owner.
    pub owner: Option<Option<WorkerId>>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn owner(mut self, owner: WorkerId) -> Self {
        self.owner = Some(Some(owner));
        self
    }

    pub fn clear_owner(mut self) -> Self {
        self.owner = Some(None);
        self
    }

    pub fn retries(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }
}

/// Criteria for [`TaskLedger::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub owner: Option<WorkerId>,
    pub kind: Option<TaskKind>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn owned_by(owner: WorkerId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.owner.as_ref().map_or(true, |o| task.owner.as_ref() == Some(o))
            && self.kind.map_or(true, |k| task.kind == k)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.blocked
    }

    /// Nothing left to schedule or wait for.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0 && self.failed == 0
    }
}

/// Ordered task store. Iteration follows plan sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskLedger {
    tasks: Vec<Task>,
    #[serde(skip)]
    index: HashMap<TaskId, usize>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut ledger = Self::new();
        for task in tasks {
            ledger.create(task)?;
        }
        Ok(ledger)
    }

    /// Rebuild the id index after deserialization.
    pub fn reindex(&mut self) -> Result<()> {
        self.tasks.sort_by_key(|t| t.sequence);
        self.index.clear();
        for (i, task) in self.tasks.iter().enumerate() {
            if self.index.insert(task.id.clone(), i).is_some() {
                return Err(Error::DuplicateTask(task.id.clone()));
            }
        }
        Ok(())
    }

    pub fn create(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        clog_debug!("ledger create {} (seq {})", task.id, task.sequence);
        let at = self
            .tasks
            .partition_point(|t| t.sequence <= task.sequence);
        self.tasks.insert(at, task);
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Apply `update` to a task, validating any status change.
    pub fn update(&mut self, id: &TaskId, update: TaskUpdate) -> Result<&Task> {
        let &i = self
            .index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let task = &mut self.tasks[i];

        if let Some(next) = update.status {
            if next != task.status {
                if !task.status.can_transition_to(next) {
                    return Err(Error::InvalidTransition {
                        task: id.clone(),
                        from: task.status,
                        to: next,
                    });
                }
                clog_debug!("ledger {}: {} -> {}", id, task.status, next);
                task.status = next;
                match next {
                    TaskStatus::InProgress => task.started_at = Some(Utc::now()),
                    TaskStatus::Completed | TaskStatus::Blocked => {
                        task.completed_at = Some(Utc::now())
                    }
                    _ => {}
                }
            }
        }
        if let Some(owner) = update.owner {
            task.owner = owner;
        }
        if let Some(count) = update.retry_count {
            task.retry_count = count;
        }
        if let Some(err) = update.last_error {
            task.last_error = err;
        }
        Ok(task)
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.tasks.iter().filter(|t| filter.matches(t)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// Pending tasks whose predecessors are all completed, in sequence order.
    pub fn ready(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.blocked_by.iter().all(|p| {
                    self.get(p)
                        .is_some_and(|pred| pred.status == TaskStatus::Completed)
                })
            })
            .collect()
    }

    /// Pending tasks with a blocked predecessor. They can never run.
    pub fn starved(&self) -> Vec<(TaskId, TaskId)> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                t.blocked_by
                    .iter()
                    .find(|p| {
                        self.get(p)
                            .is_some_and(|pred| pred.status == TaskStatus::Blocked)
                    })
                    .map(|p| (t.id.clone(), p.clone()))
            })
            .collect()
    }
}

/// Everything the coordinator owns for one session, passed explicitly to
/// the components that need it.
#[derive(Debug)]
pub struct CoordinatorState {
    pub session_id: SessionId,
    pub coordinator_id: CoordinatorId,
    pub ledger: TaskLedger,
    pub dag: TaskDAG,
    pub convergence: Vec<ConvergenceRound>,
}

impl CoordinatorState {
    pub fn new(session_id: SessionId, ledger: TaskLedger, dag: TaskDAG) -> Self {
        Self {
            session_id,
            coordinator_id: CoordinatorId::new(),
            ledger,
            dag,
            convergence: Vec::new(),
        }
    }
}
