//! Worker-group cleanup and orphan recovery.
//!
//! A group left in the registry after its coordinator exited is an orphan.
//! Three independent passes reclaim them:
//!
//! 1. On resume, groups named in the checkpoint journal are reconciled
//!    against the registry and interrupted phases are reset.
//! 2. On startup, active groups older than the orphan threshold are
//!    reclaimed, after confirmation when a person is driving.
//! 3. At the start of a pipeline stage, groups carrying that stage's name
//!    prefix but owned by another coordinator are reclaimed.
//!
//! Before any group is created the pre-create guard tears down a stale
//! group of the same name.

use crate::config::PoolSettings;
use crate::session::CoordinatorId;
use crate::state::checkpoint::CheckpointStore;
use crate::state::registry::{GroupId, GroupRegistry, GroupStatus, TeardownMode};
use crate::{clog, clog_debug, clog_warn, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

static WAVE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^wave-\d+$").expect("wave suffix pattern is valid"));

/// True when `id` is a wave group of the stage named by `prefix`. The
/// remainder must be exactly `wave-<n>`, so a session whose id happens to
/// extend the prefix is not mistaken for this stage.
fn is_stage_group(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .is_some_and(|rest| WAVE_SUFFIX_RE.is_match(rest))
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Age after which a still-active group counts as a crash artifact.
    pub orphan_threshold: chrono::Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}

impl CleanupConfig {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            orphan_threshold: chrono::Duration::seconds(
                i64::try_from(settings.orphan_threshold_secs).unwrap_or(i64::MAX),
            ),
        }
    }
}

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Groups removed.
    pub removed: Vec<String>,
    /// Candidates left alone (declined, or not stale).
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Groups identified as orphans, whether or not they were removed.
    pub orphaned: Vec<String>,
    /// Phases reset to pending during checkpoint reconciliation.
    pub reset_phases: Vec<String>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn orphaned_count(&self) -> usize {
        self.orphaned.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.skipped.is_empty()
            && self.failed.is_empty()
            && self.orphaned.is_empty()
            && self.reset_phases.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.orphaned.extend(other.orphaned);
        self.reset_phases.extend(other.reset_phases);
    }
}

/// A group that looks abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanCandidate {
    pub id: String,
    pub age: Option<chrono::Duration>,
    pub owner: Option<CoordinatorId>,
    /// False when the record could not be parsed.
    pub readable: bool,
}

#[derive(Debug, Clone)]
pub struct CleanupManager {
    registry: GroupRegistry,
    config: CleanupConfig,
}

impl CleanupManager {
    pub fn new(registry: GroupRegistry, config: CleanupConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Pre-create guard: make sure nothing is registered under `id`.
    pub fn guard_group_name(&self, id: &GroupId) -> Result<TeardownMode> {
        let mode = self.registry.teardown(id)?;
        match mode {
            TeardownMode::Absent => {}
            TeardownMode::Clean => clog!("Removed stale worker group {} before re-creating it", id),
            TeardownMode::Forced => clog_warn!("Force-reclaimed stale worker group {}", id),
        }
        Ok(mode)
    }

    fn reclaim(&self, candidate: &OrphanCandidate, report: &mut CleanupReport) {
        let result = if candidate.readable {
            GroupId::parse(&candidate.id).and_then(|id| self.registry.teardown(&id).map(|_| ()))
        } else {
            self.registry.teardown_force(&candidate.id)
        };
        match result {
            Ok(()) => report.removed.push(candidate.id.clone()),
            Err(e) => {
                clog_warn!("Failed to reclaim worker group {}: {}", candidate.id, e);
                report.failed.push((candidate.id.clone(), e.to_string()));
            }
        }
    }

    /// Layer 1: reconcile the checkpoint journal with the live registry.
    ///
    /// Any checkpointed group still registered belonged to the crashed
    /// coordinator and is reclaimed. Phases that were in progress are
    /// recorded as pending so they re-run from scratch.
    pub fn reconcile_checkpoints(&self, store: &mut CheckpointStore) -> Result<CleanupReport> {
        let mut report = CleanupReport::new();
        for (phase, raw_id) in store.checkpointed_groups() {
            let live = GroupId::parse(&raw_id)
                .map(|id| self.registry.exists(&id))
                .unwrap_or(false);
            if live {
                clog_warn!("Group {} from phase {} outlived its coordinator", raw_id, phase);
                report.orphaned.push(raw_id.clone());
                let candidate = OrphanCandidate {
                    id: raw_id,
                    age: None,
                    owner: None,
                    readable: true,
                };
                self.reclaim(&candidate, &mut report);
            } else {
                clog_debug!("Checkpointed group {} is not live", raw_id);
            }
        }
        for (phase, _) in store.reset_interrupted()? {
            report.reset_phases.push(phase);
        }
        Ok(report)
    }

    /// Active groups (and unreadable group directories) older than the
    /// orphan threshold.
    pub fn find_stale(&self, now: DateTime<Utc>) -> Result<Vec<OrphanCandidate>> {
        let scan = self.registry.scan()?;
        let threshold = self.config.orphan_threshold;

        let mut stale: Vec<OrphanCandidate> = scan
            .groups
            .into_iter()
            .filter(|g| g.status != GroupStatus::Closed && g.age(now) > threshold)
            .map(|g| OrphanCandidate {
                age: Some(g.age(now)),
                id: g.group_id.to_string(),
                owner: Some(g.owner),
                readable: true,
            })
            .collect();

        stale.extend(scan.unreadable.into_iter().filter_map(|u| {
            let age = u.modified.map(|m| now - m);
            age.filter(|a| *a > threshold).map(|a| OrphanCandidate {
                id: u.dir_name,
                age: Some(a),
                owner: None,
                readable: false,
            })
        }));
        Ok(stale)
    }

    /// Layer 2: reclaim stale groups if `confirm` approves the list.
    /// Pipeline preflight passes a closure that always approves.
    pub fn reclaim_stale<F>(&self, now: DateTime<Utc>, confirm: F) -> Result<CleanupReport>
    where
        F: FnOnce(&[OrphanCandidate]) -> bool,
    {
        let mut report = CleanupReport::new();
        let stale = self.find_stale(now)?;
        if stale.is_empty() {
            return Ok(report);
        }
        report.orphaned = stale.iter().map(|c| c.id.clone()).collect();

        if !confirm(&stale) {
            clog!("Orphan reclamation declined for {} groups", stale.len());
            report.skipped = report.orphaned.clone();
            return Ok(report);
        }
        for candidate in &stale {
            self.reclaim(candidate, &mut report);
        }
        clog!(
            "Reclaimed {} of {} orphaned worker groups",
            report.removed.len(),
            stale.len()
        );
        Ok(report)
    }

    /// Layer 3: reclaim the stage's wave groups (`{prefix}wave-<n>`) that
    /// the current coordinator does not own, regardless of age.
    pub fn reclaim_prefixed(&self, prefix: &str, current: CoordinatorId) -> Result<CleanupReport> {
        let mut report = CleanupReport::new();
        let scan = self.registry.scan()?;

        let mut candidates: Vec<OrphanCandidate> = scan
            .groups
            .into_iter()
            .filter(|g| is_stage_group(g.group_id.as_str(), prefix))
            .filter(|g| g.owner != current)
            .map(|g| OrphanCandidate {
                id: g.group_id.to_string(),
                age: None,
                owner: Some(g.owner),
                readable: true,
            })
            .collect();
        candidates.extend(
            scan.unreadable
                .into_iter()
                .filter(|u| is_stage_group(&u.dir_name, prefix))
                .map(|u| OrphanCandidate {
                    id: u.dir_name,
                    age: None,
                    owner: None,
                    readable: false,
                }),
        );

        for candidate in &candidates {
            clog_warn!("Stale group {} matches stage prefix {}", candidate.id, prefix);
            report.orphaned.push(candidate.id.clone());
            self.reclaim(candidate, &mut report);
        }
        Ok(report)
    }
}
