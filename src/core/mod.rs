//! Core domain models: tasks, the plan they come from, the dependency
//! graph between them and the ledger that owns their state.

pub mod dag;
pub mod ledger;
pub mod plan;
pub mod task;

pub use dag::{DependencyEdge, EdgeRecord, TaskDAG};
pub use ledger::{CoordinatorState, StatusCounts, TaskFilter, TaskLedger, TaskUpdate};
pub use plan::{PlanFile, TaskSpec};
pub use task::{RiskTier, Task, TaskId, TaskKind, TaskStatus};
