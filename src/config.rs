use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

/// Wave scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    /// Retries allowed before a failing task becomes `blocked`.
    pub max_retries: u32,
    pub wave_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_retries: 3,
            wave_timeout_secs: 30 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn wave_timeout(&self) -> Duration {
        Duration::from_secs(self.wave_timeout_secs)
    }
}

/// Worker staleness thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_secs: u64,
    pub warn_after_secs: u64,
    pub release_after_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            warn_after_secs: 5 * 60,
            release_after_secs: 10 * 60,
        }
    }
}

/// Worker group lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub grace_period_secs: u64,
    pub orphan_threshold_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            orphan_threshold_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictSettings {
    /// Distinct targets considered at file granularity before falling back
    /// to directories.
    pub max_targets: usize,
    pub infer_from_description: bool,
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            max_targets: 200,
            infer_from_description: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSettings {
    pub max_rounds: u32,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self { max_rounds: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub phase_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            phase_timeout_secs: 2 * 60 * 60,
        }
    }
}

impl PipelineSettings {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub conflicts: ConflictSettings,
    #[serde(default)]
    pub convergence: ConvergenceSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Shell command run once per assignment.
    pub worker_command: Option<String>,
    /// Shell command that re-scores artifacts during convergence.
    pub scorer_command: Option<String>,
}

impl Config {
    /// Root directory for config, logs, sessions and the group registry.
    /// `CADENCE_HOME` overrides `~/.cadence`.
    pub fn cadence_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("CADENCE_HOME") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn sessions_dir(home: &Path) -> PathBuf {
        home.join("sessions")
    }

    pub fn groups_dir(home: &Path) -> PathBuf {
        home.join("groups")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: pool_size={}, max_retries={}, max_rounds={}",
            config.scheduler.pool_size,
            config.scheduler.max_retries,
            config.convergence.max_rounds
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        crate::util::write_atomic(path, toml::to_string_pretty(self)?.as_bytes())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.pool_size == 0 {
            return Err(Error::Validation(
                "scheduler.pool_size must be at least 1".to_string(),
            ));
        }
        if self.convergence.max_rounds == 0 {
            return Err(Error::Validation(
                "convergence.max_rounds must be at least 1".to_string(),
            ));
        }
        if self.health.warn_after_secs >= self.health.release_after_secs {
            return Err(Error::Validation(format!(
                "health.warn_after_secs ({}) must be below health.release_after_secs ({})",
                self.health.warn_after_secs, self.health.release_after_secs
            )));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(Error::Validation(
                "health.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
