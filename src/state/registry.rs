//! Durable worker-group registry.
//!
//! Each group lives in `<home>/groups/<group_id>/group.json`. A directory
//! that outlives its coordinator is an orphan; the cleanup module finds
//! and reclaims those.

use crate::session::CoordinatorId;
use crate::{clog_debug, clog_warn, Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const GROUP_FILE: &str = "group.json";

/// Identifiers allowed anywhere near a destructive filesystem call.
static GROUP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("group id pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Validate against the allow-list `^[A-Za-z0-9_-]{1,128}$`.
    pub fn parse(raw: &str) -> Result<Self> {
        if !GROUP_ID_RE.is_match(raw) {
            return Err(Error::InvalidIdentifier {
                value: raw.to_string(),
                reason: "group ids must match [A-Za-z0-9_-]{1,128}".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GroupId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Idle,
    Busy,
    Stopped,
    /// Forcefully terminated or released for staleness.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub name: String,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub group_id: GroupId,
    pub members: Vec<GroupMember>,
    pub created_at: DateTime<Utc>,
    pub status: GroupStatus,
    pub owner: CoordinatorId,
}

impl WorkerGroup {
    pub fn new(group_id: GroupId, owner: CoordinatorId, members: &[String]) -> Self {
        Self {
            group_id,
            members: members
                .iter()
                .map(|name| GroupMember {
                    name: name.clone(),
                    status: MemberStatus::Idle,
                })
                .collect(),
            created_at: Utc::now(),
            status: GroupStatus::Active,
            owner,
        }
    }

    pub fn set_member_status(&mut self, name: &str, status: MemberStatus) {
        if let Some(member) = self.members.iter_mut().find(|m| m.name == name) {
            member.status = status;
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// How a group directory was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    Clean,
    Forced,
    /// Nothing was registered under that id.
    Absent,
}

/// A registry directory whose record could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableGroup {
    pub dir_name: String,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryScan {
    pub groups: Vec<WorkerGroup>,
    pub unreadable: Vec<UnreadableGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRegistry {
    root: PathBuf,
}

impl GroupRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Registry rooted at `<home>/groups`.
    pub fn from_home(home: &Path) -> Self {
        Self::new(crate::config::Config::groups_dir(home))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, id: &GroupId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn exists(&self, id: &GroupId) -> bool {
        self.group_dir(id).exists()
    }

    /// Register a new group. Fails if the id is already taken.
    pub fn create(&self, group: &WorkerGroup) -> Result<()> {
        let dir = self.group_dir(&group.group_id);
        if dir.exists() {
            return Err(Error::Validation(format!(
                "worker group {} already exists",
                group.group_id
            )));
        }
        fs::create_dir_all(&dir)?;
        self.save(group)?;
        clog_debug!("registry: created group {}", group.group_id);
        Ok(())
    }

    pub fn save(&self, group: &WorkerGroup) -> Result<()> {
        let path = self.group_dir(&group.group_id).join(GROUP_FILE);
        crate::util::write_atomic(&path, serde_json::to_string_pretty(group)?.as_bytes())
    }

    pub fn load(&self, id: &GroupId) -> Result<Option<WorkerGroup>> {
        let path = self.group_dir(id).join(GROUP_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// Every group directory. Records that fail to parse, or whose
    /// directory name fails the allow-list, are reported separately.
    pub fn scan(&self) -> Result<RegistryScan> {
        let mut scan = RegistryScan::default();
        if !self.root.exists() {
            return Ok(scan);
        }
        for entry in fs::read_dir(&self.root)?.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let record = GroupId::parse(&dir_name)
                .ok()
                .and_then(|id| self.load(&id).ok().flatten());
            match record {
                Some(group) => scan.groups.push(group),
                None => {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from);
                    scan.unreadable.push(UnreadableGroup { dir_name, modified });
                }
            }
        }
        scan.groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        scan.unreadable.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(scan)
    }

    pub fn list(&self) -> Result<Vec<WorkerGroup>> {
        Ok(self.scan()?.groups)
    }

    /// Remove the record and then the (now empty) directory. Anything
    /// unexpected left inside makes this fail.
    pub fn teardown_clean(&self, id: &GroupId) -> Result<()> {
        let dir = self.group_dir(id);
        let file = dir.join(GROUP_FILE);
        if file.exists() {
            fs::remove_file(&file)?;
        }
        fs::remove_dir(&dir).map_err(|e| Error::GroupTeardown {
            group: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Recursively delete a group directory. The raw name is re-checked
    /// against the allow-list first.
    pub fn teardown_force(&self, raw_id: &str) -> Result<()> {
        let id = GroupId::parse(raw_id)?;
        let dir = self.group_dir(&id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::GroupTeardown {
                group: id.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Clean teardown, falling back to forced reclamation.
    pub fn teardown(&self, id: &GroupId) -> Result<TeardownMode> {
        if !self.exists(id) {
            return Ok(TeardownMode::Absent);
        }
        match self.teardown_clean(id) {
            Ok(()) => {
                clog_debug!("registry: group {} torn down", id);
                Ok(TeardownMode::Clean)
            }
            Err(e) => {
                clog_warn!("Clean teardown of {} failed ({}); forcing", id, e);
                self.teardown_force(id.as_str())?;
                Ok(TeardownMode::Forced)
            }
        }
    }
}
