//! Pipeline phase and report types.

use crate::cleanup::CleanupReport;
use crate::core::ledger::StatusCounts;
use crate::orchestration::convergence::Verdict;
use crate::session::{SessionId, SessionStatus};
use crate::Error;
use serde::{Deserialize, Serialize};

/// Phases of a coordination session, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ingest the plan, build the graph and insert synchronization edges.
    Plan,
    /// Run every task through the wave scheduler.
    Execute,
    /// Optional repair-then-rescore loop over the executed artifacts.
    Converge,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Plan, Phase::Execute, Phase::Converge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Converge => "converge",
        }
    }

    /// File name of the artifact the phase leaves in the session directory.
    pub fn artifact(&self) -> &'static str {
        match self {
            Phase::Plan => "plan.json",
            Phase::Execute => "ledger.json",
            Phase::Converge => "convergence.json",
        }
    }

    /// Phases to run. Convergence is only part of the pipeline when a
    /// scorer is configured.
    pub fn pipeline(converge: bool) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| converge || *p != Phase::Converge)
            .collect()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown phase '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Verified checkpoint; artifact reloaded.
    Skipped,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub detail: Option<String>,
}

/// Summary of one `start` or `resume`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub phases: Vec<PhaseRecord>,
    pub counts: Option<StatusCounts>,
    pub convergence: Option<Verdict>,
    pub cleanup: CleanupReport,
}

impl PipelineReport {
    pub fn outcome(&self, phase: Phase) -> Option<PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| r.outcome)
    }
}
