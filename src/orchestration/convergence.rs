//! Convergence Loop: bounded repair-then-rescore cycles.
//!
//! Each round hands the current findings to a [`Repairer`], then re-scores
//! only the artifacts the repair touched. Findings on untouched artifacts
//! carry over unchanged. The round cap and the "must decrease" rule
//! together bound the loop.

use crate::config::ConvergenceSettings;
use crate::{clog, clog_warn, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Critical. Convergence requires none of these.
    P1,
    P2,
    P3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    /// Artifact the finding is about (usually a path).
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Finding {
    pub fn new(id: impl Into<String>, severity: Severity, artifact: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            artifact: artifact.into(),
            detail: None,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::P1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Converged,
    Retry,
    Halted,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Converged => "converged",
            Verdict::Retry => "retry",
            Verdict::Halted => "halted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceRound {
    pub round: u32,
    pub findings_before: usize,
    pub findings_after: usize,
    pub p1_remaining: usize,
    pub verdict: Verdict,
}

/// Decide the outcome of `round` (1-based).
pub fn decide(round: u32, max_rounds: u32, before: usize, after: usize, p1_remaining: usize) -> Verdict {
    if p1_remaining == 0 && after <= before {
        Verdict::Converged
    } else if after >= before || round >= max_rounds {
        Verdict::Halted
    } else {
        Verdict::Retry
    }
}

/// Applies fixes for a set of findings and reports which artifacts changed.
#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, round: u32, findings: &[Finding]) -> Result<Vec<String>>;
}

/// Re-checks specific artifacts and returns every finding on them.
#[async_trait]
pub trait FindingScorer: Send + Sync {
    async fn rescore(&self, artifacts: &[String]) -> Result<Vec<Finding>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceOutcome {
    pub verdict: Verdict,
    pub rounds: Vec<ConvergenceRound>,
    pub remaining: Vec<Finding>,
    /// Scoring passes, counting the initial one that produced the input.
    pub evaluations: u32,
}

pub struct ConvergenceLoop {
    max_rounds: u32,
}

impl ConvergenceLoop {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn from_settings(settings: &ConvergenceSettings) -> Self {
        Self::new(settings.max_rounds)
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Run rounds until the verdict is not `retry`.
    ///
    /// Repair and scoring failures do not abort the loop: a failed repair
    /// touches nothing, a failed rescore keeps the previous findings, and
    /// either way the count does not drop so the round halts.
    pub async fn run(
        &self,
        initial: Vec<Finding>,
        repairer: &dyn Repairer,
        scorer: &dyn FindingScorer,
    ) -> ConvergenceOutcome {
        let mut findings = initial;
        let mut rounds = Vec::new();
        let mut evaluations = 1;

        if findings.is_empty() {
            clog!("Convergence: nothing to repair");
            return ConvergenceOutcome {
                verdict: Verdict::Converged,
                rounds,
                remaining: findings,
                evaluations,
            };
        }

        let mut verdict = Verdict::Retry;
        for round in 1..=self.max_rounds {
            let before = findings.len();
            let touched: BTreeSet<String> = match repairer.repair(round, &findings).await {
                Ok(touched) => touched.into_iter().collect(),
                Err(e) => {
                    clog_warn!("Convergence round {}: repair failed: {}", round, e);
                    BTreeSet::new()
                }
            };

            if !touched.is_empty() {
                let artifacts: Vec<String> = touched.iter().cloned().collect();
                evaluations += 1;
                match scorer.rescore(&artifacts).await {
                    Ok(rescored) => {
                        findings.retain(|f| !touched.contains(&f.artifact));
                        findings.extend(rescored);
                    }
                    Err(e) => {
                        clog_warn!("Convergence round {}: rescore failed: {}", round, e);
                    }
                }
            }

            let after = findings.len();
            let p1_remaining = findings.iter().filter(|f| f.is_critical()).count();
            verdict = decide(round, self.max_rounds, before, after, p1_remaining);
            clog!(
                "Convergence round {}: {} -> {} findings ({} critical): {}",
                round,
                before,
                after,
                p1_remaining,
                verdict
            );
            rounds.push(ConvergenceRound {
                round,
                findings_before: before,
                findings_after: after,
                p1_remaining,
                verdict,
            });
            if verdict != Verdict::Retry {
                break;
            }
        }

        if verdict == Verdict::Halted {
            clog_warn!(
                "Convergence halted with {} findings remaining; continuing",
                findings.len()
            );
        }
        ConvergenceOutcome {
            verdict,
            rounds,
            remaining: findings,
            evaluations,
        }
    }
}
