//! Project command builder.
//!
//! Turns one inbound event plus the repository's config into the list of
//! project contexts to execute. Resolution never guesses: anything that
//! could put two plans under one lock key is a `ConfigError`.

pub mod context;
pub mod matcher;

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::ConfigError;
use crate::models::{CommandEvent, CommentCommand, DEFAULT_WORKSPACE, ProjectIdentity};
use crate::repo_config::{ProjectDecl, RepoConfig, checked_dir, checked_workspace};

pub use context::ProjectContext;
pub use matcher::WhenModified;

#[derive(Debug, Clone, Default)]
pub struct ProjectCommandBuilder {
    /// When set, explicit `-d`/`-w` commands must name a declared project.
    require_declared_projects: bool,
}

impl ProjectCommandBuilder {
    pub fn new(require_declared_projects: bool) -> Self {
        Self {
            require_declared_projects,
        }
    }

    pub fn build(
        &self,
        event: &CommandEvent,
        config: &RepoConfig,
    ) -> Result<Vec<ProjectContext>, ConfigError> {
        let contexts = if event.command.is_explicit() {
            vec![self.resolve_explicit(event, config)?]
        } else {
            self.resolve_modified(event, config)?
        };
        debug!(
            repo = %event.repo.full_name,
            pull = event.pull.num,
            command = %event.command.name,
            projects = contexts.len(),
            "Built project contexts"
        );
        Ok(contexts)
    }

    /// Match the changed files against every project's `when_modified`.
    /// Autoplan events skip projects with autoplan disabled; a typed command
    /// without flags considers all of them.
    fn resolve_modified(
        &self,
        event: &CommandEvent,
        config: &RepoConfig,
    ) -> Result<Vec<ProjectContext>, ConfigError> {
        let fallback;
        let projects: &[ProjectDecl] = if config.has_projects() {
            &config.projects
        } else {
            fallback = [ProjectDecl::repo_root()];
            &fallback
        };

        let mut matched: Vec<&ProjectDecl> = Vec::new();
        let mut claims: BTreeMap<&str, Vec<&ProjectDecl>> = BTreeMap::new();
        for project in projects {
            if event.command.autoplan && !project.autoplan.enabled {
                continue;
            }
            let trigger = project.when_modified()?;
            let hits: Vec<&str> = event
                .changed_files
                .iter()
                .map(String::as_str)
                .filter(|f| trigger.matches(f))
                .collect();
            if hits.is_empty() {
                continue;
            }
            for file in hits {
                claims.entry(file).or_default().push(project);
            }
            matched.push(project);
        }

        // A file claimed by several unnamed projects in different dirs has
        // no defined owner.
        for owners in claims.values() {
            let unnamed: Vec<&&ProjectDecl> = owners.iter().filter(|p| p.name.is_none()).collect();
            let first_dir = unnamed.first().map(|p| p.dir.as_str());
            if unnamed.iter().any(|p| Some(p.dir.as_str()) != first_dir) {
                return Err(ConfigError::Ambiguous {
                    candidates: unnamed.iter().map(|p| p.label()).collect(),
                });
            }
        }

        // Two matches on the same identity would plan twice under one lock.
        let mut by_identity: BTreeMap<(&str, &str), Vec<&ProjectDecl>> = BTreeMap::new();
        for project in &matched {
            by_identity
                .entry((project.dir.as_str(), project.workspace.as_str()))
                .or_default()
                .push(project);
        }
        for group in by_identity.values() {
            if group.len() > 1 {
                return Err(ConfigError::Ambiguous {
                    candidates: group.iter().map(|p| p.label()).collect(),
                });
            }
        }

        matched
            .into_iter()
            .map(|project| self.context_for(event, config, project))
            .collect()
    }

    fn resolve_explicit(
        &self,
        event: &CommandEvent,
        config: &RepoConfig,
    ) -> Result<ProjectContext, ConfigError> {
        let cmd = &event.command;
        let dir = cmd.dir.as_deref().map(checked_dir).transpose()?;
        let workspace = cmd.workspace.as_deref().map(checked_workspace).transpose()?;

        if let Some(name) = &cmd.project {
            let project = config
                .projects
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| ConfigError::UnknownProject { name: name.clone() })?;
            let dir_mismatch = dir.as_ref().is_some_and(|d| d != &project.dir);
            let ws_mismatch = workspace.as_ref().is_some_and(|w| w != &project.workspace);
            if dir_mismatch || ws_mismatch {
                return Err(ConfigError::NoProjectConfigured {
                    dir: dir.unwrap_or_else(|| project.dir.clone()),
                    workspace: workspace.unwrap_or_else(|| project.workspace.clone()),
                });
            }
            return self.context_for(event, config, project);
        }

        let dir = dir.unwrap_or_else(|| ".".to_string());
        let workspace = workspace.unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
        let candidates: Vec<&ProjectDecl> = config
            .projects
            .iter()
            .filter(|p| p.dir == dir && p.workspace == workspace)
            .collect();

        match candidates.as_slice() {
            [project] => self.context_for(event, config, project),
            [] if self.require_declared_projects => {
                Err(ConfigError::NoProjectConfigured { dir, workspace })
            }
            [] => {
                let adhoc = ProjectDecl {
                    dir,
                    workspace,
                    ..ProjectDecl::repo_root()
                };
                self.context_for(event, config, &adhoc)
            }
            many => Err(ConfigError::Ambiguous {
                candidates: many.iter().map(|p| p.label()).collect(),
            }),
        }
    }

    fn context_for(
        &self,
        event: &CommandEvent,
        config: &RepoConfig,
        project: &ProjectDecl,
    ) -> Result<ProjectContext, ConfigError> {
        let workflow = config
            .workflow(&project.workflow)
            .ok_or_else(|| ConfigError::UndefinedWorkflow {
                project: project.label(),
                workflow: project.workflow.clone(),
            })?;
        Ok(ProjectContext {
            identity: ProjectIdentity::new(&event.repo.full_name, &project.dir, &project.workspace),
            project_name: project.name.clone(),
            command: event.command.name,
            repo: event.repo.clone(),
            pull: event.pull.clone(),
            user: event.user.clone(),
            workflow,
            comment_args: comment_args(&event.command),
            autoplan: event.command.autoplan,
        })
    }
}

fn comment_args(cmd: &CommentCommand) -> Vec<String> {
    cmd.extra_args
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}
