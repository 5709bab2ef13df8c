use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task {task} is blocked by unknown task {missing}")]
    UnknownDependency { task: TaskId, missing: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid status transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker group teardown failed for {group}: {reason}")]
    GroupTeardown { group: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker command failed: {0}")]
    Command(String),
}

impl Error {
    /// Configuration errors are fatal and reported before any scheduling
    /// begins. Everything else degrades gracefully.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::InvalidIdentifier { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::TomlParse(_)
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
