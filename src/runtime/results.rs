//! Result value objects handed to the comment renderer.

use std::path::PathBuf;

use serde::Serialize;

use crate::builder::ProjectContext;
use crate::models::{CommandName, LockRecord, ProjectIdentity};
use crate::repo_config::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// The step could not be run at all (spawn failure, missing plan, store error).
    Error,
}

/// Output of one executed step. Skipped steps produce no result.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub stage: Stage,
    pub command: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// How a project's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProjectOutcome {
    Success,
    /// Plan ran, but another pull request holds the lock; the plan file was removed.
    Discarded { locked_by_pull: u64 },
    /// Apply refused because this pull request does not hold the lock.
    LockConflict {
        message: String,
        locked_by_pull: Option<u64>,
    },
    /// Apply refused because policy checks failed and were not approved.
    PoliciesFailed { message: String },
    StepFailed { step: String, exit_code: Option<i32> },
    TimedOut { step: String, after_secs: u64 },
    Cancelled { step: Option<String> },
    CheckoutFailed { message: String },
    Error { message: String },
}

impl ProjectOutcome {
    /// Outcomes that need operator attention. Lock conflicts and discarded
    /// plans are informational.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ProjectOutcome::Success
                | ProjectOutcome::Discarded { .. }
                | ProjectOutcome::LockConflict { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectResult {
    pub identity: ProjectIdentity,
    pub project_name: Option<String>,
    pub command: CommandName,
    #[serde(flatten)]
    pub outcome: ProjectOutcome,
    pub steps: Vec<StepResult>,
    pub plan_file: Option<PathBuf>,
    pub duration_ms: u64,
}

impl ProjectResult {
    pub fn new(ctx: &ProjectContext, outcome: ProjectOutcome) -> Self {
        Self {
            identity: ctx.identity.clone(),
            project_name: ctx.project_name.clone(),
            command: ctx.command,
            outcome,
            steps: Vec::new(),
            plan_file: None,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ProjectOutcome::Success
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// The pull-request level result of one orchestration pass.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: CommandName,
    pub repo: String,
    pub pull: u64,
    /// Set when the pass failed before any project ran (bad config, checkout).
    pub error: Option<String>,
    pub projects: Vec<ProjectResult>,
    /// Locks released by this command (unlock).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unlocked: Vec<LockRecord>,
}

impl CommandResult {
    pub fn new(command: CommandName, repo: &str, pull: u64) -> Self {
        Self {
            command,
            repo: repo.to_string(),
            pull,
            error: None,
            projects: Vec::new(),
            unlocked: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn has_errors(&self) -> bool {
        self.error.is_some() || self.projects.iter().any(|p| p.outcome.is_failure())
    }

    pub fn project(&self, lock_key: &str) -> Option<&ProjectResult> {
        self.projects
            .iter()
            .find(|p| p.identity.lock_key() == lock_key)
    }
}
