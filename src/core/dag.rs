//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are task ids; an edge `from -> to` means `to` cannot start until
//! `from` has completed. Edges are either declared by the plan author or
//! inferred by the conflict resolver from overlapping resource targets.
//! A cycle is a plan-authoring defect and is rejected when the graph is built.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::clog_warn;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why one task must wait for another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyEdge {
    /// Declared in the plan through `blocked_by`.
    Explicit,
    /// Inserted because both tasks mutate the same resources.
    Inferred { targets: Vec<String> },
}

impl DependencyEdge {
    pub fn is_explicit(&self) -> bool {
        matches!(self, DependencyEdge::Explicit)
    }
}

impl std::fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyEdge::Explicit => write!(f, "explicit"),
            DependencyEdge::Inferred { targets } => write!(f, "inferred: {}", targets.join(", ")),
        }
    }
}

/// Serializable form of one edge, used in plan artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: TaskId,
    pub to: TaskId,
    #[serde(flatten)]
    pub edge: DependencyEdge,
}

/// The task dependency graph.
#[derive(Clone)]
pub struct TaskDAG {
    graph: DiGraph<TaskId, DependencyEdge>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build and validate the graph from explicit `blocked_by` links.
    ///
    /// Fails on duplicate ids, references to unknown tasks, or any cycle
    /// (the error lists the cycle). Explicit edges between tasks whose
    /// resource sets are known and disjoint are logged as unnecessary.
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task.id.clone())?;
        }
        for task in tasks {
            for pred in &task.blocked_by {
                if !dag.contains_task(pred) {
                    return Err(Error::UnknownDependency {
                        task: task.id.clone(),
                        missing: pred.clone(),
                    });
                }
                dag.add_edge(pred, &task.id, DependencyEdge::Explicit)?;
            }
        }

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CyclicDependency { cycle });
        }

        for (from, to) in dag.unnecessary_edges(tasks) {
            clog_warn!(
                "Unnecessary dependency {} -> {}: resource targets are disjoint",
                from,
                to
            );
        }
        Ok(dag)
    }

    /// Rebuild a graph from a saved edge list. The result is validated
    /// the same way as [`TaskDAG::build`].
    pub fn from_records(ids: &[TaskId], records: &[EdgeRecord]) -> Result<Self> {
        let mut dag = Self::new();
        for id in ids {
            dag.add_task(id.clone())?;
        }
        for record in records {
            dag.add_edge(&record.from, &record.to, record.edge.clone())?;
        }
        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CyclicDependency { cycle });
        }
        Ok(dag)
    }

    pub fn add_task(&mut self, id: TaskId) -> Result<NodeIndex> {
        if self.task_index.contains_key(&id) {
            return Err(Error::DuplicateTask(id));
        }
        let index = self.graph.add_node(id.clone());
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add `from -> to`. Does not check for cycles; callers either validate
    /// afterwards or only add edges that cannot close one.
    pub fn add_edge(&mut self, from: &TaskId, to: &TaskId, edge: DependencyEdge) -> Result<()> {
        let from_index = self.index_of(from, to)?;
        let to_index = self.index_of(to, from)?;
        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, edge);
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId, referenced_by: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownDependency {
                task: referenced_by.clone(),
                missing: id.clone(),
            })
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyEdge> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    /// True when `to` is reachable from `from` (or they are the same task).
    pub fn has_path(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Either task transitively waits for the other.
    pub fn is_ordered(&self, a: &TaskId, b: &TaskId) -> bool {
        self.has_path(a, b) || self.has_path(b, a)
    }

    pub fn predecessors(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: petgraph::Direction) -> Vec<&TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<&TaskId> = self
            .graph
            .neighbors_directed(index, dir)
            .map(|n| &self.graph[n])
            .collect();
        out.sort();
        out
    }

    pub fn edges(&self) -> Vec<EdgeRecord> {
        let mut records: Vec<EdgeRecord> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                Some(EdgeRecord {
                    from: self.graph[a].clone(),
                    to: self.graph[b].clone(),
                    edge: self.graph[e].clone(),
                })
            })
            .collect();
        records.sort_by(|x, y| (&x.from, &x.to).cmp(&(&y.from, &y.to)));
        records
    }

    /// Depth-first search with recursion-stack marking. Returns the first
    /// cycle found as a closed path (`a -> b -> a`), visiting roots in
    /// insertion order so the report is stable.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::OnStack;
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> =
                vec![(start, self.successors_for_dfs(start))];

            loop {
                let Some((node, pending)) = stack.last_mut() else {
                    break;
                };
                let node = *node;
                match pending.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            stack.push((next, self.successors_for_dfs(next)));
                        }
                        Mark::OnStack => {
                            let pos = stack.iter().position(|(n, _)| *n == next)?;
                            let mut cycle: Vec<TaskId> = stack[pos..]
                                .iter()
                                .map(|(n, _)| self.graph[*n].clone())
                                .collect();
                            cycle.push(self.graph[next].clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    // Reverse index order so popping yields the earliest-added successor first.
    fn successors_for_dfs(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        next.sort_by(|a, b| b.cmp(a));
        next
    }

    /// Explicit edges between two tasks that both declare resources and
    /// share none of them.
    pub fn unnecessary_edges(&self, tasks: &[Task]) -> Vec<(TaskId, TaskId)> {
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        self.edges()
            .into_iter()
            .filter(|r| r.edge.is_explicit())
            .filter(|r| match (by_id.get(&r.from), by_id.get(&r.to)) {
                (Some(a), Some(b)) => {
                    !a.is_unrestricted() && !b.is_unrestricted() && !a.conflicts_with(b)
                }
                _ => false,
            })
            .map(|r| (r.from, r.to))
            .collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
