use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::Sandbox;

/// A logical project owning a persisted file set and at most one live
/// sandbox at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Last-known provider sandbox id, used for reconnect attempts.
    pub sandbox_id: Option<String>,
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Sandbox binding state machine. No state is terminal; any state can be
/// re-entered on the next access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Unprovisioned,
    Provisioning,
    Running,
    Stopped,
    Reconnecting,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprovisioned" => Ok(Self::Unprovisioned),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "reconnecting" => Ok(Self::Reconnecting),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// A persisted file (or folder marker) scoped to a project.
/// `(project_id, path)` is unique; folders carry empty content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub project_id: String,
    pub path: String,
    pub content: String,
    pub is_folder: bool,
    pub updated_at: String,
}

impl FileRecord {
    pub fn file(project_id: &str, path: &str, content: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            is_folder: false,
            updated_at: String::new(),
        }
    }

    pub fn folder(project_id: &str, path: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: path.to_string(),
            content: String::new(),
            is_folder: true,
            updated_at: String::new(),
        }
    }
}

/// One file in a sandbox write batch: absolute path inside the sandbox
/// plus its full content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFile {
    pub path: String,
    pub content: String,
}

/// One entry from listing a sandbox directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Captured output of a command run inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Result of resolving a sandbox for a project.
#[derive(Clone)]
pub struct Provisioned {
    pub sandbox: Arc<dyn Sandbox>,
    pub sandbox_id: String,
    /// True when the sandbox was freshly created and must be restored
    /// from the persisted file set before use.
    pub is_new: bool,
}

/// Outcome of a kill request. Kill never raises; provider "already gone"
/// responses count as success and call sites only log.
#[derive(Debug, Clone, PartialEq)]
pub enum KillOutcome {
    /// A live or reconnected sandbox was destroyed.
    Killed,
    /// The provider reported the sandbox was already gone.
    AlreadyGone,
    /// Neither a cached handle nor a stored id existed; the provider was
    /// not contacted.
    NothingToKill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_round_trips_through_str() {
        for status in [
            ProjectStatus::Unprovisioned,
            ProjectStatus::Provisioning,
            ProjectStatus::Running,
            ProjectStatus::Stopped,
            ProjectStatus::Reconnecting,
        ] {
            let parsed: ProjectStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn folder_record_has_no_content() {
        let rec = FileRecord::folder("p1", "src");
        assert!(rec.is_folder);
        assert!(rec.content.is_empty());
    }
}
