//! Session pipeline: phase types and the checkpointed coordinator.

mod pipeline;
mod types;

pub use pipeline::{inspect, Coordinator, ExecuteArtifact, PlanArtifact, SessionOverview};
pub use types::{Phase, PhaseOutcome, PhaseRecord, PipelineReport};
