//! Plan file ingestion.
//!
//! A plan is an ordered list of task specs in TOML (`[[tasks]]`) or JSON
//! (`{"tasks": [...]}`). Position in the file becomes the task sequence
//! number, which orders resource-conflict edges later on.

use crate::config::ConflictSettings;
use crate::core::task::{RiskTier, Task, TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::clog_debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;

/// Path-looking tokens: anything with a directory separator, or a bare
/// file name with a common source extension.
static PATH_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[A-Za-z0-9_.\-]+/)+[A-Za-z0-9_.\-]+|\b[A-Za-z0-9_\-]+\.(?:rs|toml|md|json|ya?ml|py|ts|tsx|js|go|java|c|h|cpp|hpp|sh|sql)\b",
    )
    .expect("path hint pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub resource_targets: Vec<String>,
    #[serde(default)]
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl PlanFile {
    /// Load a plan, choosing the format from the file extension
    /// (`.json` is JSON, anything else is TOML).
    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("PlanFile::load path={}", path.display());
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&content),
            _ => Self::parse_toml(&content),
        }
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Validation(format!("invalid plan: {}", e)))
    }

    /// Turn specs into ledger tasks. Ids must be non-empty and unique;
    /// dependency references are checked when the DAG is built.
    pub fn into_tasks(self, settings: &ConflictSettings) -> Result<Vec<Task>> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());

        for (sequence, spec) in self.tasks.into_iter().enumerate() {
            let id = spec.id.trim();
            if id.is_empty() {
                return Err(Error::Validation(format!(
                    "task #{} has an empty id",
                    sequence + 1
                )));
            }
            let id = TaskId::from(id);
            if !seen.insert(id.clone()) {
                return Err(Error::DuplicateTask(id));
            }

            let mut targets: BTreeSet<String> = spec
                .resource_targets
                .iter()
                .filter_map(|t| normalize_target(t))
                .collect();
            if settings.infer_from_description {
                let hints = extract_path_hints(&spec.description);
                if !hints.is_empty() {
                    clog_debug!("Task {} gained {} hinted targets", id, hints.len());
                }
                targets.extend(hints);
            }

            let mut task = Task::new(id, &spec.subject)
                .with_kind(spec.kind)
                .with_risk_tier(spec.risk_tier)
                .with_sequence(sequence)
                .with_blocked_by(spec.blocked_by.iter().map(|s| s.trim()));
            task.resource_targets = targets;
            task.description = spec.description;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

/// Trim whitespace and a leading `./`; empty targets are dropped.
pub fn normalize_target(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Path-like tokens in free text. Over-claims on purpose: a false
/// positive only serializes two tasks.
pub fn extract_path_hints(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .filter(|word| !word.contains("://"))
        .flat_map(|word| PATH_HINT_RE.find_iter(word))
        .filter_map(|m| normalize_target(m.as_str().trim_end_matches(['.', ',', ':'])))
        .collect()
}
