use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::Config;
use crate::{clog_debug, Error, Result};

const MAX_SESSION_ID_LENGTH: usize = 64;

/// Session identifier. Restricted to `[A-Za-z0-9_-]` because it ends up in
/// paths that cleanup may delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self> {
        validate_session_id(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// Fresh id of the form `s-<12 hex>`.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("s-{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        validate_session_id(&value)?;
        Ok(Self(value))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

fn validate_session_id(raw: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidIdentifier {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("session id cannot be empty"));
    }
    if raw.contains("..") {
        return Err(invalid("parent directory references are not allowed"));
    }
    if raw.len() > MAX_SESSION_ID_LENGTH {
        return Err(invalid("session id too long"));
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("only letters, digits, '-' and '_' are allowed"));
    }
    Ok(())
}

/// Identifies one coordinator process. Recorded on every worker group it
/// creates so later instances can tell its groups from their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinatorId(pub Uuid);

impl CoordinatorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CoordinatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CoordinatorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    /// Finished with a logged gap (phase timeout or halted convergence).
    Halted,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Halted => write!(f, "halted"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// File layout of `<home>/sessions/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    pub fn new(home: &Path, id: &SessionId) -> Self {
        Self {
            dir: Config::sessions_dir(home).join(id.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.dir.join("checkpoints.json")
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join("session.log")
    }
}

/// Session metadata stored next to the checkpoint journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub coordinator_id: CoordinatorId,
    pub plan_path: PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, plan_path: PathBuf, coordinator_id: CoordinatorId) -> Self {
        let now = Utc::now();
        Self {
            id,
            coordinator_id,
            plan_path,
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn load(paths: &SessionPaths) -> Result<Self> {
        let path = paths.meta();
        clog_debug!("Session::load path={}", path.display());
        if !path.exists() {
            return Err(Error::Validation(format!(
                "no session at {}",
                paths.dir().display()
            )));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, paths: &SessionPaths) -> Result<()> {
        crate::util::write_atomic(&paths.meta(), serde_json::to_string_pretty(self)?.as_bytes())
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Every readable session under `home`, oldest first.
    pub fn list(home: &Path) -> Result<Vec<Session>> {
        let dir = Config::sessions_dir(home);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir)?.flatten() {
            let Ok(id) = SessionId::parse(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if let Ok(session) = Session::load(&SessionPaths::new(home, &id)) {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
