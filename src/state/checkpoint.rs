//! Checkpoint Store.
//!
//! An append-only journal of phase transitions, persisted as one JSON file
//! per session and rewritten atomically on every append. The newest row
//! for a phase (highest sequence number) wins.
//!
//! Each row may reference an artifact file by name, relative to the
//! journal's directory, together with the SHA-256 of its contents when the
//! row was written. On resume a completed phase is skipped only if its
//! artifact still hashes to the recorded value.

use crate::util::{blocking, sha256_hex, write_atomic};
use crate::{clog, clog_debug, clog_warn, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: String,
    pub status: PhaseStatus,
    pub artifact: Option<String>,
    pub artifact_hash: Option<String>,
    pub worker_group_id: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Why a phase has to run on resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    NeverStarted,
    /// Crashed mid-phase; restarts from scratch.
    Interrupted,
    PreviouslyFailed,
    /// Completed, but the artifact is missing or its hash changed.
    CorruptArtifact,
    /// An earlier phase is re-running, so this one's input changed.
    UpstreamRerun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    Skip,
    Run(RunReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDecision {
    pub phase: String,
    pub action: ResumeAction,
}

/// What a new row should say.
#[derive(Debug, Clone, Default)]
pub struct CheckpointEntry<'a> {
    pub artifact: Option<&'a str>,
    pub worker_group_id: Option<&'a str>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    rows: Vec<Checkpoint>,
}

impl CheckpointStore {
    /// Open the journal at `path`. An unreadable journal is treated as
    /// empty so every phase re-runs.
    pub fn open(path: &Path) -> Result<Self> {
        let rows = if path.exists() {
            match serde_json::from_str::<Vec<Checkpoint>>(&fs::read_to_string(path)?) {
                Ok(rows) => rows,
                Err(e) => {
                    clog_warn!(
                        "Checkpoint journal {} is corrupt ({}); starting over",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        clog_debug!("CheckpointStore::open {} rows={}", path.display(), rows.len());
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn rows(&self) -> &[Checkpoint] {
        &self.rows
    }

    fn next_sequence(&self) -> u64 {
        self.rows.iter().map(|r| r.sequence).max().map_or(1, |s| s + 1)
    }

    fn push_row(
        &mut self,
        phase: &str,
        status: PhaseStatus,
        entry: &CheckpointEntry<'_>,
        artifact_hash: Option<String>,
    ) -> Checkpoint {
        let row = Checkpoint {
            phase: phase.to_string(),
            status,
            artifact: entry.artifact.map(str::to_string),
            artifact_hash,
            worker_group_id: entry.worker_group_id.map(str::to_string),
            sequence: self.next_sequence(),
            timestamp: Utc::now(),
        };
        self.rows.push(row.clone());
        clog_debug!("checkpoint #{} {} {}", row.sequence, phase, status);
        row
    }

    /// Append a row and persist the whole journal.
    pub fn record(
        &mut self,
        phase: &str,
        status: PhaseStatus,
        entry: CheckpointEntry<'_>,
    ) -> Result<Checkpoint> {
        let artifact_hash = match entry.artifact {
            Some(name) => Some(sha256_hex(&fs::read(self.base_dir().join(name))?)),
            None => None,
        };
        let row = self.push_row(phase, status, &entry, artifact_hash);
        write_atomic(&self.path, serde_json::to_string_pretty(&self.rows)?.as_bytes())?;
        Ok(row)
    }

    /// [`record`](Self::record) for async callers: hashing and the journal
    /// write run on the blocking pool.
    pub async fn append(
        &mut self,
        phase: &str,
        status: PhaseStatus,
        entry: CheckpointEntry<'_>,
    ) -> Result<Checkpoint> {
        let artifact_hash = match entry.artifact {
            Some(name) => {
                let path = self.base_dir().join(name);
                Some(blocking(move || Ok(sha256_hex(&fs::read(path)?))).await?)
            }
            None => None,
        };
        let row = self.push_row(phase, status, &entry, artifact_hash);
        let path = self.path.clone();
        let body = serde_json::to_string_pretty(&self.rows)?;
        blocking(move || write_atomic(&path, body.as_bytes())).await?;
        Ok(row)
    }

    pub fn latest(&self, phase: &str) -> Option<&Checkpoint> {
        self.rows
            .iter()
            .filter(|r| r.phase == phase)
            .max_by_key(|r| r.sequence)
    }

    pub fn latest_per_phase(&self) -> BTreeMap<&str, &Checkpoint> {
        let mut latest: BTreeMap<&str, &Checkpoint> = BTreeMap::new();
        for row in &self.rows {
            let newer = latest
                .get(row.phase.as_str())
                .map_or(true, |cur| row.sequence > cur.sequence);
            if newer {
                latest.insert(&row.phase, row);
            }
        }
        latest
    }

    /// The artifact still matches the recorded hash. Rows without an
    /// artifact always verify.
    pub fn verify(&self, row: &Checkpoint) -> bool {
        let (Some(name), Some(expected)) = (&row.artifact, &row.artifact_hash) else {
            return row.artifact.is_none();
        };
        match fs::read(self.base_dir().join(name)) {
            Ok(bytes) => &sha256_hex(&bytes) == expected,
            Err(_) => false,
        }
    }

    /// Decide, for phases in pipeline order, which to skip and which to
    /// run. Once one phase runs, every later phase runs too.
    pub fn plan_resume(&self, phases: &[&str]) -> Vec<PhaseDecision> {
        let mut upstream_rerun = false;
        phases
            .iter()
            .map(|&phase| {
                let action = if upstream_rerun {
                    ResumeAction::Run(RunReason::UpstreamRerun)
                } else {
                    match self.latest(phase) {
                        None => ResumeAction::Run(RunReason::NeverStarted),
                        Some(row) => match row.status {
                            PhaseStatus::Completed if self.verify(row) => ResumeAction::Skip,
                            PhaseStatus::Completed => {
                                clog_warn!("Checkpoint for {} failed hash verification", phase);
                                ResumeAction::Run(RunReason::CorruptArtifact)
                            }
                            PhaseStatus::InProgress => ResumeAction::Run(RunReason::Interrupted),
                            PhaseStatus::Failed => ResumeAction::Run(RunReason::PreviouslyFailed),
                            PhaseStatus::Pending => ResumeAction::Run(RunReason::NeverStarted),
                        },
                    }
                };
                if action != ResumeAction::Skip {
                    upstream_rerun = true;
                }
                PhaseDecision {
                    phase: phase.to_string(),
                    action,
                }
            })
            .collect()
    }

    /// Record a `pending` row for every phase whose newest row is
    /// `in_progress`. Returns the group ids those rows referenced.
    pub fn reset_interrupted(&mut self) -> Result<Vec<(String, Option<String>)>> {
        let interrupted: Vec<(String, Option<String>)> = self
            .latest_per_phase()
            .into_values()
            .filter(|r| r.status == PhaseStatus::InProgress)
            .map(|r| (r.phase.clone(), r.worker_group_id.clone()))
            .collect();
        for (phase, _) in &interrupted {
            clog!("Phase {} was interrupted; resetting to pending", phase);
            self.record(phase, PhaseStatus::Pending, CheckpointEntry::default())?;
        }
        Ok(interrupted)
    }

    /// Group ids referenced by the newest row of each phase.
    pub fn checkpointed_groups(&self) -> Vec<(String, String)> {
        self.latest_per_phase()
            .into_values()
            .filter_map(|r| {
                r.worker_group_id
                    .as_ref()
                    .map(|g| (r.phase.clone(), g.clone()))
            })
            .collect()
    }
}
