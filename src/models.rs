//! Core domain types shared by every subsystem.
//!
//! The inbound event types (`Repo`, `PullRequest`, `CommentCommand`,
//! `CommandEvent`) are the normalized form produced by the webhook layer;
//! nothing in this crate sees provider-specific payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// The Terraform workspace used when none is named.
pub const DEFAULT_WORKSPACE: &str = "default";

/// A repository as seen by the VCS host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    /// Full name, e.g. `acme/infra`.
    pub full_name: String,
    /// URL used to clone the repository. May embed credentials.
    pub clone_url: String,
}

/// The pull request a command was issued against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub num: u64,
    /// Branch the pull request was opened from.
    pub head_ref: String,
    /// Branch the pull request targets.
    pub base_ref: String,
    /// Commit the head branch pointed at when the event was generated.
    #[serde(default)]
    pub head_commit: Option<String>,
    /// Clone URL of the head repository when the PR comes from a fork.
    #[serde(default)]
    pub head_clone_url: Option<String>,
    #[serde(default)]
    pub author: String,
}

/// Immutable key identifying one Terraform root: the unit of mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub repo_full_name: String,
    /// Repo-relative directory, normalized (`.` for the repository root).
    pub dir: String,
    pub workspace: String,
}

impl ProjectIdentity {
    pub fn new(
        repo_full_name: impl Into<String>,
        dir: impl AsRef<str>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            dir: normalize_dir(dir.as_ref()),
            workspace: workspace.into(),
        }
    }

    /// Key under which the lock record is persisted: `repo#dir#workspace`.
    pub fn lock_key(&self) -> String {
        format!("{}#{}#{}", self.repo_full_name, self.dir, self.workspace)
    }
}

impl std::fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lock_key())
    }
}

/// Normalize a repo-relative directory: strips `./` prefixes and trailing
/// slashes, collapses `.` components, and maps the empty path to `.`.
pub fn normalize_dir(dir: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(dir.trim()).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| p != "..") {
                    parts.pop();
                } else {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Terraform workspace names: letters, digits, `-`, `_` and `.`, but not
/// `.` or `..` alone. Workspaces name checkout directories and plan files,
/// so anything path-like is refused.
pub fn is_valid_workspace(workspace: &str) -> bool {
    !workspace.is_empty()
        && workspace != "."
        && workspace != ".."
        && workspace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Join a normalized repo-relative dir onto a checkout root.
pub fn project_path(checkout: &Path, dir: &str) -> PathBuf {
    if dir == "." {
        checkout.to_path_buf()
    } else {
        checkout.join(dir)
    }
}

/// Policy evaluation state attached to a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// No policy check has run for the current plan.
    #[default]
    Unchecked,
    Passed,
    /// A policy check failed; apply is refused until approved.
    Failed,
    /// A failed check was approved by the lock holder.
    Approved,
}

impl PolicyStatus {
    /// Whether apply may proceed under this status.
    pub fn permits_apply(&self) -> bool {
        !matches!(self, PolicyStatus::Failed)
    }
}

/// Reference to the plan produced while the lock was held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRef {
    /// Absolute path of the saved plan file inside the checkout.
    pub path: PathBuf,
    /// Head commit the plan was produced from, when known.
    #[serde(default)]
    pub head_commit: Option<String>,
}

/// A durable assertion that one pull request owns a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    pub identity: ProjectIdentity,
    pub pull_num: u64,
    #[serde(default)]
    pub user: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default)]
    pub plan: Option<PlanRef>,
    #[serde(default)]
    pub policy: PolicyStatus,
}

impl LockRecord {
    pub fn new(identity: ProjectIdentity, pull_num: u64, user: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            pull_num,
            user: user.into(),
            locked_at: Utc::now(),
            plan: None,
            policy: PolicyStatus::Unchecked,
        }
    }

    pub fn key(&self) -> String {
        self.identity.lock_key()
    }
}

/// Command keywords a pull request comment (or autoplan) can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Plan,
    Apply,
    Unlock,
    ApprovePolicies,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Plan => "plan",
            CommandName::Apply => "apply",
            CommandName::Unlock => "unlock",
            CommandName::ApprovePolicies => "approve_policies",
        }
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CommandName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(CommandName::Plan),
            "apply" => Ok(CommandName::Apply),
            "unlock" => Ok(CommandName::Unlock),
            "approve_policies" | "approve-policies" => Ok(CommandName::ApprovePolicies),
            _ => anyhow::bail!(
                "Invalid command '{}'. Valid values: plan, apply, unlock, approve_policies",
                s
            ),
        }
    }
}

/// A parsed command with its optional targeting flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentCommand {
    pub name: CommandName,
    /// `-d`: explicit repo-relative directory.
    #[serde(default)]
    pub dir: Option<String>,
    /// `-w`: explicit workspace.
    #[serde(default)]
    pub workspace: Option<String>,
    /// `-p`: explicit project name.
    #[serde(default)]
    pub project: Option<String>,
    /// Arguments given after `--`, appended to terraform invocations.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// True when generated by a push/open event rather than typed by a user.
    #[serde(default)]
    pub autoplan: bool,
}

impl CommentCommand {
    pub fn new(name: CommandName) -> Self {
        Self {
            name,
            dir: None,
            workspace: None,
            project: None,
            extra_args: Vec::new(),
            autoplan: false,
        }
    }

    /// An autoplan command triggered by new commits.
    pub fn autoplan() -> Self {
        Self {
            autoplan: true,
            ..Self::new(CommandName::Plan)
        }
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// True when the command names its targets instead of relying on the
    /// changed-file set.
    pub fn is_explicit(&self) -> bool {
        !self.autoplan
            && (self.dir.is_some() || self.workspace.is_some() || self.project.is_some())
    }
}

/// One inbound, already-normalized VCS event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub repo: Repo,
    pub pull: PullRequest,
    #[serde(default)]
    pub user: String,
    /// Repo-relative paths changed by the pull request.
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub command: CommentCommand,
}
