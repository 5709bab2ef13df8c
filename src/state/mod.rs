//! Durable coordinator state: the checkpoint journal and the worker-group
//! registry.

pub mod checkpoint;
pub mod registry;

pub use checkpoint::{
    Checkpoint, CheckpointEntry, CheckpointStore, PhaseDecision, PhaseStatus, ResumeAction,
    RunReason,
};
pub use registry::{
    GroupId, GroupMember, GroupRegistry, GroupStatus, MemberStatus, TeardownMode, WorkerGroup,
};
