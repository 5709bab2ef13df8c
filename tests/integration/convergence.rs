//! Convergence loop integration tests.
//!
//! These tests verify the halting rules of the repair-then-rescore loop,
//! on its own and as the last pipeline phase.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cadence::orchestration::{ConvergenceLoop, Verdict};
use cadence::session::SessionId;
use cadence::workflow::{self, Coordinator, Phase, PhaseOutcome};
use cadence::SessionStatus;

use crate::fixtures::{
    critical, test_config, ScriptedScorer, StubbornScorer, Succeed, TestHome, TouchAll, ABC_PLAN,
};

fn five_critical() -> Vec<cadence::orchestration::Finding> {
    (0..5).map(|i| critical(&format!("p1-{}", i), "f")).collect()
}

/// Test: no improvement halts instead of retrying
/// Given five critical findings that a repair leaves at five
/// When the loop runs
/// Then the verdict is halted after one round
#[tokio::test]
async fn test_five_to_five_halts() {
    let scorer = ScriptedScorer::new(vec![5]);
    let outcome = ConvergenceLoop::new(3)
        .run(five_critical(), &TouchAll, &scorer)
        .await;

    assert_eq!(outcome.verdict, Verdict::Halted);
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(outcome.rounds[0].findings_before, 5);
    assert_eq!(outcome.rounds[0].findings_after, 5);
    assert_eq!(outcome.rounds[0].p1_remaining, 5);
    assert_eq!(outcome.rounds[0].verdict, Verdict::Halted);
}

/// Test: steady improvement converges
/// Given findings that drop 5 -> 2 -> 0
/// When the loop runs with a cap of three
/// Then it retries once and converges in round two
#[tokio::test]
async fn test_improvement_converges() {
    let scorer = ScriptedScorer::new(vec![2, 0]);
    let outcome = ConvergenceLoop::new(3)
        .run(five_critical(), &TouchAll, &scorer)
        .await;

    let verdicts: Vec<Verdict> = outcome.rounds.iter().map(|r| r.verdict).collect();
    assert_eq!(verdicts, vec![Verdict::Retry, Verdict::Converged]);
    assert_eq!(outcome.verdict, Verdict::Converged);
    assert!(outcome.remaining.is_empty());
    assert_eq!(outcome.evaluations, 3);
}

/// Test: the round cap stops a slowly improving loop
/// Given findings that drop by one per round
/// When the cap is two
/// Then the second round halts with criticals remaining
#[tokio::test]
async fn test_round_cap_halts() {
    let scorer = ScriptedScorer::new(vec![4, 3, 2, 1]);
    let outcome = ConvergenceLoop::new(2)
        .run(five_critical(), &TouchAll, &scorer)
        .await;

    assert_eq!(outcome.verdict, Verdict::Halted);
    assert_eq!(outcome.rounds.len(), 2);
    assert_eq!(scorer.calls(), 2);
    assert!(outcome.evaluations <= 3);
}

/// Test: a halted convergence phase halts the session but keeps its work
/// Given a scorer that always reports five criticals on `f`
/// When the full pipeline runs
/// Then converge completes with verdict halted and the session is halted
#[tokio::test]
async fn test_pipeline_converge_phase_halts_session() {
    let home = TestHome::new();
    let plan = home.write_plan("plan.toml", ABC_PLAN);
    let id = SessionId::parse("conv-1").unwrap();
    let scorer = Arc::new(StubbornScorer::new(5));
    let coordinator = Coordinator::new(home.path.clone(), test_config(4), Arc::new(Succeed))
        .with_convergence(Arc::new(TouchAll), scorer.clone());

    let report = coordinator.start(&plan, Some(id.clone())).await.unwrap();
    assert_eq!(report.outcome(Phase::Converge), Some(PhaseOutcome::Completed));
    assert_eq!(report.convergence, Some(Verdict::Halted));
    assert_eq!(report.status, SessionStatus::Halted);
    // initial score plus one rescore
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);

    let overview = workflow::inspect(&home.path, &id).unwrap();
    assert_eq!(overview.convergence, Some(Verdict::Halted));
    assert_eq!(overview.counts.unwrap().completed, 3);

    // resuming reloads the verdict without scoring again
    let resumed = Coordinator::new(home.path.clone(), test_config(4), Arc::new(Succeed))
        .with_convergence(Arc::new(TouchAll), scorer.clone())
        .resume(&id)
        .await
        .unwrap();
    assert_eq!(resumed.outcome(Phase::Converge), Some(PhaseOutcome::Skipped));
    assert_eq!(resumed.convergence, Some(Verdict::Halted));
    assert_eq!(resumed.status, SessionStatus::Halted);
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
}
