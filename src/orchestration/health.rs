//! Worker health: staleness detection, retry decisions and cooldowns.
//!
//! Staleness escalates in two steps. A task with no worker activity for
//! `warn_after` is logged once; at `release_after` its ownership is
//! released and the task goes back through the retry path.

use crate::config::{HealthSettings, SchedulerConfig};
use crate::core::task::TaskId;
use crate::orchestration::worker::WorkerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Thresholds used by the scheduler's health checks.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub poll_interval: Duration,
    pub warn_after: Duration,
    pub release_after: Duration,
    pub max_retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_settings(&HealthSettings::default(), &SchedulerConfig::default())
    }
}

impl HealthConfig {
    pub fn from_settings(health: &HealthSettings, scheduler: &SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(health.poll_interval_secs),
            warn_after: Duration::from_secs(health.warn_after_secs),
            release_after: Duration::from_secs(health.release_after_secs),
            max_retries: scheduler.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// No progress for `idle`; logged once per claim.
    Stale {
        task: TaskId,
        worker: WorkerId,
        idle: Duration,
    },
    /// Ownership must be released.
    Release {
        task: TaskId,
        worker: WorkerId,
        idle: Duration,
    },
}

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Back to `pending`; `retry_count` becomes `attempt`.
    Requeue { attempt: u32 },
    /// Retry cap exceeded.
    Block { attempts: u32 },
}

impl RecoveryAction {
    /// A task may be retried `max_retries` times; the failure that pushes
    /// `retry_count` past the cap blocks it.
    pub fn after_failure(retry_count: u32, max_retries: u32) -> Self {
        let attempt = retry_count + 1;
        if attempt > max_retries {
            RecoveryAction::Block { attempts: attempt }
        } else {
            RecoveryAction::Requeue { attempt }
        }
    }
}

#[derive(Debug, Clone)]
struct Watch {
    worker: WorkerId,
    last_activity: Instant,
    warned: bool,
}

/// Tracks last activity for every in-flight task.
#[derive(Debug, Clone, Default)]
pub struct StalenessMonitor {
    watches: HashMap<TaskId, Watch>,
}

impl StalenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) watching a task claimed by `worker`.
    pub fn watch(&mut self, task: &TaskId, worker: &WorkerId, now: Instant) {
        self.watches.insert(
            task.clone(),
            Watch {
                worker: worker.clone(),
                last_activity: now,
                warned: false,
            },
        );
    }

    /// Record progress. Signals from a worker that no longer owns the task
    /// are ignored.
    pub fn touch(&mut self, task: &TaskId, worker: &WorkerId, now: Instant) {
        if let Some(watch) = self.watches.get_mut(task) {
            if &watch.worker == worker {
                watch.last_activity = now;
                watch.warned = false;
            }
        }
    }

    pub fn forget(&mut self, task: &TaskId) {
        self.watches.remove(task);
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Evaluate every watch against the thresholds. Released tasks stop
    /// being watched; warned tasks are not reported again until they
    /// make progress.
    pub fn check(&mut self, now: Instant, config: &HealthConfig) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        let mut released = Vec::new();

        let mut ids: Vec<&TaskId> = self.watches.keys().collect();
        ids.sort();
        let ids: Vec<TaskId> = ids.into_iter().cloned().collect();

        for task in ids {
            let Some(watch) = self.watches.get_mut(&task) else {
                continue;
            };
            let idle = now.saturating_duration_since(watch.last_activity);
            if idle >= config.release_after {
                events.push(HealthEvent::Release {
                    task: task.clone(),
                    worker: watch.worker.clone(),
                    idle,
                });
                released.push(task);
            } else if idle >= config.warn_after && !watch.warned {
                watch.warned = true;
                events.push(HealthEvent::Stale {
                    task: task.clone(),
                    worker: watch.worker.clone(),
                    idle,
                });
            }
        }

        for task in released {
            self.watches.remove(&task);
        }
        events
    }
}

/// Remembers which worker last failed each task so that worker does not
/// immediately reclaim it. Keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct CooldownMap {
    last_failed: HashMap<TaskId, WorkerId>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cool(&mut self, task: &TaskId, worker: &WorkerId) {
        self.last_failed.insert(task.clone(), worker.clone());
    }

    pub fn is_cooling(&self, task: &TaskId, worker: &WorkerId) -> bool {
        self.last_failed.get(task) == Some(worker)
    }

    pub fn cooled_worker(&self, task: &TaskId) -> Option<&WorkerId> {
        self.last_failed.get(task)
    }

    pub fn clear(&mut self, task: &TaskId) {
        self.last_failed.remove(task);
    }
}
