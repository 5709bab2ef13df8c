//! Property tests over generated plans.
//!
//! Plans are small random DAGs (edges only point from lower to higher
//! index, so they are acyclic by construction) over a handful of shared
//! resource targets.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use cadence::config::ConflictSettings;
use cadence::core::dag::TaskDAG;
use cadence::core::task::{Task, TaskStatus};
use cadence::orchestration::{conflicts, ConvergenceLoop, Verdict, WaveScheduler};
use cadence::Error;

use crate::fixtures::{
    coordinator_state, critical, wave_config, worker_pool, RecordingExecutor, ScriptedScorer,
    TestHome, TouchAll,
};

const TARGETS: [&str; 4] = ["src/a.rs", "src/b.rs", "src/c.rs", "docs/x.md"];

#[derive(Debug, Clone)]
struct TaskShape {
    deps: Vec<usize>,
    targets: Vec<usize>,
    doomed: bool,
}

fn task_shape() -> impl Strategy<Value = TaskShape> {
    (
        prop::collection::vec(0usize..8, 0..3),
        prop::collection::vec(0usize..TARGETS.len(), 0..3),
        prop::bool::weighted(0.15),
    )
        .prop_map(|(deps, targets, doomed)| TaskShape {
            deps,
            targets,
            doomed,
        })
}

fn build(shapes: &[TaskShape]) -> Vec<Task> {
    shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let deps: BTreeSet<String> = shape
                .deps
                .iter()
                .filter(|d| **d < i)
                .map(|d| format!("t{}", d))
                .collect();
            let targets: BTreeSet<&str> = shape.targets.iter().map(|t| TARGETS[*t]).collect();
            Task::new(format!("t{}", i), "generated")
                .with_sequence(i)
                .with_blocked_by(deps)
                .with_targets(targets)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every pair of tasks sharing a target ends up ordered in the graph.
    #[test]
    fn prop_conflicting_pairs_are_ordered(shapes in prop::collection::vec(task_shape(), 1..10)) {
        let mut tasks = build(&shapes);
        let mut dag = TaskDAG::build(&tasks).unwrap();
        conflicts::apply(&mut tasks, &mut dag, &ConflictSettings::default()).unwrap();

        for (i, a) in tasks.iter().enumerate() {
            for b in &tasks[i + 1..] {
                if a.conflicts_with(b) {
                    prop_assert!(dag.is_ordered(&a.id, &b.id), "{} and {} unordered", a.id, b.id);
                }
            }
        }
        prop_assert!(dag.find_cycle().is_none());
    }

    /// Conflict resolution is a pure function of the task list.
    #[test]
    fn prop_conflict_resolution_is_deterministic(shapes in prop::collection::vec(task_shape(), 1..10)) {
        let tasks = build(&shapes);
        let dag = TaskDAG::build(&tasks).unwrap();
        let first = conflicts::resolve(&tasks, &dag, &ConflictSettings::default());
        let second = conflicts::resolve(&tasks, &dag, &ConflictSettings::default());
        prop_assert_eq!(first, second);
    }

    /// Closing any chain back on itself is rejected with the cycle.
    #[test]
    fn prop_cycles_are_rejected(len in 1usize..8, back_to in 0usize..8) {
        let back_to = back_to % len;
        let mut tasks: Vec<Task> = (0..len)
            .map(|i| {
                let task = Task::new(format!("t{}", i), "chain").with_sequence(i);
                if i == 0 { task } else { task.with_blocked_by([format!("t{}", i - 1)]) }
            })
            .collect();
        let last = format!("t{}", len - 1);
        tasks[back_to].blocked_by.insert(last.as_str().into());

        match TaskDAG::build(&tasks) {
            Err(Error::CyclicDependency { cycle }) => prop_assert!(!cycle.is_empty()),
            other => prop_assert!(false, "expected a cycle, got {:?}", other.map(|d| d.edge_count())),
        }
    }

    /// The loop always stops within `max_rounds + 1` scoring passes.
    #[test]
    fn prop_convergence_terminates(
        initial in 1usize..10,
        script in prop::collection::vec(0usize..12, 1..8),
        max_rounds in 1u32..5,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let findings = (0..initial).map(|i| critical(&format!("f{}", i), "a")).collect();
        let scorer = ScriptedScorer::new(script);
        let outcome = rt.block_on(ConvergenceLoop::new(max_rounds).run(findings, &TouchAll, &scorer));

        prop_assert!(outcome.evaluations <= max_rounds + 1);
        prop_assert!(outcome.rounds.len() as u32 <= max_rounds);
        prop_assert_ne!(outcome.verdict, Verdict::Retry);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every generated plan settles with all tasks terminal and no target
    /// ever held by two running tasks.
    #[test]
    fn prop_scheduler_settles_without_overlap(
        shapes in prop::collection::vec(task_shape(), 1..8),
        pool_size in 1usize..4,
    ) {
        let tasks = build(&shapes);
        let doomed: Vec<String> = tasks
            .iter()
            .zip(&shapes)
            .filter(|(_, s)| s.doomed)
            .map(|(t, _)| t.id.to_string())
            .collect();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let home = TestHome::new();
        let executor = Arc::new(RecordingExecutor::failing(doomed));
        let mut state = coordinator_state(tasks);

        let report = rt.block_on(async {
            let mut pool = worker_pool(&home, executor.clone(), pool_size);
            let mut scheduler = WaveScheduler::new(wave_config(pool_size));
            scheduler.run(&mut state, &mut pool, None).await
        }).unwrap();

        prop_assert!(state.ledger.iter().all(|t| t.is_terminal()));
        prop_assert_eq!(report.counts.pending + report.counts.in_progress + report.counts.failed, 0);
        prop_assert!(executor.overlaps().is_empty(), "overlaps: {:?}", executor.overlaps());
        for task in state.ledger.iter().filter(|t| t.status == TaskStatus::Blocked) {
            prop_assert!(task.last_error.is_some());
        }
        prop_assert!(home.registry().list().unwrap().is_empty());
    }
}
