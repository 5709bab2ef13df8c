//! Ownership Conflict Resolver.
//!
//! Two tasks that mutate the same resource must never run concurrently.
//! For every such pair that the graph does not already order, the resolver
//! inserts a synchronization edge from the lower-sequence task to the
//! higher-sequence one. The computation is pure: the same task list and
//! graph always yield the same edges, in the same order.

use crate::config::ConflictSettings;
use crate::core::dag::{DependencyEdge, TaskDAG};
use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::{clog, clog_debug};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// An inserted ordering between two conflicting tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub shared: Vec<String>,
}

/// How targets were compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    File,
    /// Too many distinct targets; each was widened to its parent directory.
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub granularity: Granularity,
    pub edges: Vec<SyncEdge>,
}

/// Parent directory of a target, `.` for top-level names.
pub fn directory_of(target: &str) -> String {
    match Path::new(target).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

/// Compute synchronization edges without modifying anything.
pub fn resolve(tasks: &[Task], dag: &TaskDAG, settings: &ConflictSettings) -> Resolution {
    let distinct: BTreeSet<&str> = tasks
        .iter()
        .flat_map(|t| t.resource_targets.iter().map(String::as_str))
        .collect();
    let granularity = if distinct.len() > settings.max_targets {
        Granularity::Directory
    } else {
        Granularity::File
    };

    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by(|a, b| (a.sequence, &a.id).cmp(&(b.sequence, &b.id)));

    // Inverted index: target -> positions (in `ordered`) of tasks claiming it.
    let mut owners: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (pos, task) in ordered.iter().enumerate() {
        let keys: BTreeSet<String> = match granularity {
            Granularity::File => task.resource_targets.iter().cloned().collect(),
            Granularity::Directory => task.resource_targets.iter().map(|t| directory_of(t)).collect(),
        };
        for key in keys {
            owners.entry(key).or_default().push(pos);
        }
    }

    let mut pairs: BTreeMap<(usize, usize), Vec<String>> = BTreeMap::new();
    for (target, positions) in &owners {
        for (i, &lo) in positions.iter().enumerate() {
            for &hi in &positions[i + 1..] {
                pairs.entry((lo, hi)).or_default().push(target.clone());
            }
        }
    }

    // Nearest earlier task first, so chains form and transitive pairs drop out.
    let mut pairs: Vec<((usize, usize), Vec<String>)> = pairs.into_iter().collect();
    pairs.sort_by_key(|&((lo, hi), _)| (hi, Reverse(lo)));

    // Edges added earlier in this pass count as existing ordering.
    let mut graph = dag.clone();
    let mut edges = Vec::new();
    for ((lo, hi), shared) in pairs {
        let (from, to) = (&ordered[lo].id, &ordered[hi].id);
        if graph.is_ordered(from, to) {
            continue;
        }
        // Both ids come from `tasks`; a graph missing them just skips the pair.
        if graph
            .add_edge(from, to, DependencyEdge::Inferred { targets: shared.clone() })
            .is_err()
        {
            continue;
        }
        edges.push(SyncEdge {
            from: from.clone(),
            to: to.clone(),
            shared,
        });
    }

    Resolution { granularity, edges }
}

/// Resolve conflicts and record the new edges in both the graph and the
/// tasks' `blocked_by` sets.
pub fn apply(tasks: &mut [Task], dag: &mut TaskDAG, settings: &ConflictSettings) -> Result<Resolution> {
    let resolution = resolve(tasks, dag, settings);
    if resolution.granularity == Granularity::Directory {
        clog!(
            "More than {} distinct resource targets; comparing at directory level",
            settings.max_targets
        );
    }

    for edge in &resolution.edges {
        clog_debug!(
            "sync edge {} -> {} on {}",
            edge.from,
            edge.to,
            edge.shared.join(", ")
        );
        dag.add_edge(
            &edge.from,
            &edge.to,
            DependencyEdge::Inferred {
                targets: edge.shared.clone(),
            },
        )?;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == edge.to) {
            task.blocked_by.insert(edge.from.clone());
        }
    }
    clog!("Conflict resolver inserted {} synchronization edges", resolution.edges.len());
    Ok(resolution)
}
