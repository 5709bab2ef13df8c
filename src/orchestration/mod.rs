//! Orchestration layer: conflict resolution, wave scheduling, the worker
//! pool and the convergence loop.
//!
//! Workers are either in-process [`WorkerExecutor`] implementations or a
//! shell command wrapped by [`CommandWorker`].

pub mod breaker;
pub mod command;
pub mod conflicts;
pub mod convergence;
pub mod health;
pub mod pool;
pub mod scheduler;
pub mod worker;

pub use breaker::{BreakerBoard, BreakerConfig, CircuitBreaker, CircuitState};
pub use command::{CommandScorer, CommandWorker};
pub use conflicts::{Granularity, Resolution, SyncEdge};
pub use convergence::{
    ConvergenceLoop, ConvergenceOutcome, ConvergenceRound, Finding, FindingScorer, Repairer,
    Severity, Verdict,
};
pub use health::{CooldownMap, HealthConfig, HealthEvent, RecoveryAction, StalenessMonitor};
pub use pool::{PoolConfig, ShutdownReport, WorkerPool};
pub use scheduler::{
    select_wave, ScheduleReport, SchedulerEvent, WaveConfig, WaveJournal, WaveReport,
    WaveScheduler,
};
pub use worker::{
    Assignment, Capability, ProgressReporter, ReportStatus, WorkerExecutor, WorkerId,
    WorkerMessage, WorkerReport, WorkerRole, WorkerSignal,
};
