//! Per-project execution context.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::models::{CommandName, DEFAULT_WORKSPACE, ProjectIdentity, PullRequest, Repo, project_path};
use crate::repo_config::{Stage, Step, Workflow};

/// Everything the step runner needs to execute one project for one command.
/// Built fresh for each orchestration pass.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectContext {
    pub identity: ProjectIdentity,
    pub project_name: Option<String>,
    pub command: CommandName,
    pub repo: Repo,
    pub pull: PullRequest,
    pub user: String,
    #[serde(skip)]
    pub workflow: Arc<Workflow>,
    /// Arguments given after `--` in the comment.
    pub comment_args: Vec<String>,
    pub autoplan: bool,
}

impl ProjectContext {
    /// `name` if the project is named, else `dir/workspace`.
    pub fn label(&self) -> String {
        match &self.project_name {
            Some(name) => name.clone(),
            None => format!("{}/{}", self.identity.dir, self.identity.workspace),
        }
    }

    pub fn steps(&self, stage: Stage) -> &[Step] {
        self.workflow.stage(stage)
    }

    pub fn project_dir(&self, checkout: &Path) -> PathBuf {
        project_path(checkout, &self.identity.dir)
    }

    /// `<workspace>.tfplan`, prefixed with the project name when there is one
    /// so that named projects sharing a dir never share a plan file.
    /// Workspaces are already restricted to path-safe characters; the name is
    /// escaped so that distinct names map to distinct files.
    pub fn plan_file_name(&self) -> String {
        let workspace = &self.identity.workspace;
        match &self.project_name {
            Some(name) => format!("{}-{}.tfplan", escape_name(name), workspace),
            None => format!("{}.tfplan", workspace),
        }
    }

    pub fn plan_file(&self, checkout: &Path) -> PathBuf {
        self.project_dir(checkout).join(self.plan_file_name())
    }

    /// Variables every step of this project sees.
    pub fn base_env(&self, plan_file: &Path) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("WORKSPACE".to_string(), self.identity.workspace.clone());
        env.insert("DIR".to_string(), self.identity.dir.clone());
        env.insert(
            "PROJECT_NAME".to_string(),
            self.project_name.clone().unwrap_or_default(),
        );
        env.insert("PULL_NUM".to_string(), self.pull.num.to_string());
        env.insert("PULL_AUTHOR".to_string(), self.pull.author.clone());
        env.insert("USER_NAME".to_string(), self.user.clone());
        env.insert("BASE_REPO_NAME".to_string(), self.repo.full_name.clone());
        env.insert("HEAD_REF".to_string(), self.pull.head_ref.clone());
        env.insert("BASE_REF".to_string(), self.pull.base_ref.clone());
        env.insert(
            "PLANFILE".to_string(),
            plan_file.to_string_lossy().to_string(),
        );
        env.insert("COMMENT_ARGS".to_string(), self.comment_args.join(","));
        if self.identity.workspace != DEFAULT_WORKSPACE {
            env.insert("TF_WORKSPACE".to_string(), self.identity.workspace.clone());
        }
        env
    }
}

/// Percent-escape the characters that would either leave the project dir
/// or blur the name/workspace boundary.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            '-' => out.push_str("%2D"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(c),
        }
    }
    out
}
