//! Declarative repository configuration (`terrapin.yaml`).
//!
//! ```yaml
//! version: 3
//! projects:
//!   - name: prod
//!     dir: prod
//!     workspace: default
//!     workflow: custom
//!     autoplan:
//!       enabled: true
//!       when_modified: ["*.tf", "../modules/**/*.tf"]
//! workflows:
//!   custom:
//!     plan:
//!       steps: [init, {plan: {extra_args: ["-lock=false"]}}]
//! ```

pub mod steps;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builder::matcher::{DEFAULT_WHEN_MODIFIED, WhenModified};
use crate::errors::ConfigError;
use crate::models::{DEFAULT_WORKSPACE, is_valid_workspace, normalize_dir};

pub use steps::{RunStep, Stage, Step, StepArgs, Workflow};

fn default_version() -> u32 {
    3
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

fn default_workflow_name() -> String {
    Workflow::DEFAULT_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_when_modified() -> Vec<String> {
    DEFAULT_WHEN_MODIFIED.iter().map(|p| p.to_string()).collect()
}

/// Autoplan trigger settings for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Autoplan {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_when_modified")]
    pub when_modified: Vec<String>,
}

impl Default for Autoplan {
    fn default() -> Self {
        Self {
            enabled: true,
            when_modified: default_when_modified(),
        }
    }
}

/// One declared Terraform root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDecl {
    #[serde(default)]
    pub name: Option<String>,
    pub dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_workflow_name")]
    pub workflow: String,
    #[serde(default)]
    pub autoplan: Autoplan,
}

impl ProjectDecl {
    /// The project a repository without declarations gets: the repo root in
    /// the default workspace.
    pub fn repo_root() -> Self {
        Self {
            name: None,
            dir: ".".to_string(),
            workspace: default_workspace(),
            workflow: default_workflow_name(),
            autoplan: Autoplan::default(),
        }
    }

    /// Human label used in ambiguity messages.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("dir: {} workspace: {}", self.dir, self.workspace),
        }
    }

    pub fn when_modified(&self) -> Result<WhenModified, ConfigError> {
        WhenModified::compile(&self.dir, &self.autoplan.when_modified)
    }
}

#[derive(Debug, Deserialize)]
struct RawRepoConfig {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    projects: Vec<ProjectDecl>,
    #[serde(default)]
    workflows: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed and validated repository configuration. Read-only once loaded;
/// workflows are shared by reference with every context built from it.
#[derive(Debug, Clone, Serialize)]
pub struct RepoConfig {
    pub version: u32,
    pub projects: Vec<ProjectDecl>,
    pub workflows: BTreeMap<String, Arc<Workflow>>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        let mut workflows = BTreeMap::new();
        workflows.insert(
            Workflow::DEFAULT_NAME.to_string(),
            Arc::new(Workflow::builtin_default()),
        );
        Self {
            version: default_version(),
            projects: Vec::new(),
            workflows,
        }
    }
}

impl RepoConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise return the empty default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawRepoConfig = if content.trim().is_empty() {
            RawRepoConfig {
                version: default_version(),
                projects: Vec::new(),
                workflows: BTreeMap::new(),
            }
        } else {
            serde_yaml::from_str(content)?
        };

        let mut config = Self {
            version: raw.version,
            projects: raw.projects,
            ..Self::default()
        };
        for (name, body) in &raw.workflows {
            config
                .workflows
                .insert(name.clone(), Arc::new(Workflow::parse(name, body)?));
        }
        config.normalize_and_validate()?;
        Ok(config)
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn default_workflow(&self) -> Arc<Workflow> {
        self.workflow(Workflow::DEFAULT_NAME)
            .unwrap_or_else(|| Arc::new(Workflow::builtin_default()))
    }

    pub fn has_projects(&self) -> bool {
        !self.projects.is_empty()
    }

    fn normalize_and_validate(&mut self) -> Result<(), ConfigError> {
        for project in &mut self.projects {
            project.dir = checked_dir(&project.dir)?;
            project.workspace = checked_workspace(&project.workspace)?;
            if let Some(name) = &project.name {
                if name.trim().is_empty() {
                    project.name = None;
                }
            }
        }

        let mut names = HashSet::new();
        let mut by_identity: HashMap<(&str, &str), Vec<&ProjectDecl>> = HashMap::new();
        for project in &self.projects {
            if let Some(name) = &project.name {
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateName { name: name.clone() });
                }
            }
            if !self.workflows.contains_key(&project.workflow) {
                return Err(ConfigError::UndefinedWorkflow {
                    project: project.label(),
                    workflow: project.workflow.clone(),
                });
            }
            project.when_modified()?;
            by_identity
                .entry((project.dir.as_str(), project.workspace.as_str()))
                .or_default()
                .push(project);
        }

        // Names are already unique, so a group is fine once every member has one.
        let mut groups: Vec<_> = by_identity.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        for ((dir, workspace), group) in groups {
            if group.len() > 1 && group.iter().any(|p| p.name.is_none()) {
                return Err(ConfigError::DuplicateProject {
                    dir: dir.to_string(),
                    workspace: workspace.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Normalize a project dir and reject anything outside the repository.
pub fn checked_dir(dir: &str) -> Result<String, ConfigError> {
    let trimmed = dir.trim();
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute() {
        return Err(ConfigError::InvalidDir {
            dir: dir.to_string(),
        });
    }
    let normalized = normalize_dir(trimmed);
    if normalized == ".." || normalized.starts_with("../") {
        return Err(ConfigError::InvalidDir {
            dir: dir.to_string(),
        });
    }
    Ok(normalized)
}

/// Reject workspace names that could escape or alias a checkout directory.
pub fn checked_workspace(workspace: &str) -> Result<String, ConfigError> {
    let trimmed = workspace.trim();
    if is_valid_workspace(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ConfigError::InvalidWorkspace {
            workspace: workspace.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let config = RepoConfig::parse(
            r#"
version: 3
projects:
  - name: prod
    dir: ./prod/
    workflow: custom
    autoplan:
      when_modified: ["*.tf", "../modules/**/*.tf"]
  - dir: staging
    workspace: blue
workflows:
  custom:
    plan:
      steps:
        - init
        - plan: {extra_args: ["-lock=false"]}
        - run: tflint
"#,
        )
        .unwrap();

        assert_eq!(config.version, 3);
        assert_eq!(config.projects.len(), 2);
        assert_eq!(config.projects[0].dir, "prod");
        assert_eq!(config.projects[1].workspace, "blue");
        assert_eq!(config.projects[1].workflow, "default");
        assert!(config.projects[1].autoplan.enabled);
        assert_eq!(config.projects[1].autoplan.when_modified, default_when_modified());

        let custom = config.workflow("custom").unwrap();
        assert_eq!(custom.plan.len(), 3);
        assert_eq!(custom.plan[2].name(), "run");
        assert!(config.workflow("default").is_some());
    }

    #[test]
    fn test_empty_config_has_default_workflow() {
        let config = RepoConfig::parse("").unwrap();
        assert!(!config.has_projects());
        assert_eq!(*config.default_workflow(), Workflow::builtin_default());
    }

    #[test]
    fn test_default_workflow_can_be_overridden() {
        let config = RepoConfig::parse(
            "workflows:\n  default:\n    plan:\n      steps: [plan]\n",
        )
        .unwrap();
        assert_eq!(config.default_workflow().plan, vec![Step::Plan(StepArgs::default())]);
    }

    #[test]
    fn test_unknown_step_fails_load() {
        let err = RepoConfig::parse(
            "workflows:\n  custom:\n    plan:\n      steps: [init, destroy]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStep { .. }));
    }

    #[test]
    fn test_undefined_workflow() {
        let err = RepoConfig::parse("projects:\n  - dir: prod\n    workflow: missing\n").unwrap_err();
        match err {
            ConfigError::UndefinedWorkflow { workflow, .. } => assert_eq!(workflow, "missing"),
            other => panic!("Expected UndefinedWorkflow, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_dir_workspace_requires_names() {
        let err = RepoConfig::parse("projects:\n  - dir: prod\n  - dir: ./prod\n").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProject { .. }));

        let err =
            RepoConfig::parse("projects:\n  - dir: prod\n    name: a\n  - dir: prod\n").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProject { .. }));

        let ok = RepoConfig::parse(
            "projects:\n  - dir: prod\n    name: a\n  - dir: prod\n    name: b\n",
        );
        assert!(ok.is_ok());

        let ok = RepoConfig::parse(
            "projects:\n  - dir: prod\n  - dir: prod\n    workspace: staging\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_duplicate_names() {
        let err = RepoConfig::parse(
            "projects:\n  - dir: prod\n    name: x\n  - dir: staging\n    name: x\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
    }

    #[test]
    fn test_dir_must_stay_inside_repo() {
        for dir in ["/etc", "../outside", "prod/../../x"] {
            let yaml = format!("projects:\n  - dir: '{}'\n", dir);
            assert!(
                matches!(RepoConfig::parse(&yaml), Err(ConfigError::InvalidDir { .. })),
                "{} should be rejected",
                dir
            );
        }
        assert_eq!(checked_dir("").unwrap(), ".");
        assert_eq!(checked_dir("a/../b").unwrap(), "b");
    }

    #[test]
    fn test_workspace_must_not_name_a_path() {
        for workspace in ["..", ".", "team/a", "../other", ""] {
            let yaml = format!("projects:\n  - dir: prod\n    workspace: '{}'\n", workspace);
            assert!(
                matches!(
                    RepoConfig::parse(&yaml),
                    Err(ConfigError::InvalidWorkspace { .. })
                ),
                "{:?} should be rejected",
                workspace
            );
        }
        let config = RepoConfig::parse("projects:\n  - dir: prod\n    workspace: ' blue '\n").unwrap();
        assert_eq!(config.projects[0].workspace, "blue");
    }

    #[test]
    fn test_unknown_project_key_is_rejected() {
        let err = RepoConfig::parse("projects:\n  - dir: prod\n    workspaces: [a]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_when_modified_pattern() {
        let err = RepoConfig::parse(
            "projects:\n  - dir: prod\n    autoplan:\n      when_modified: ['[bad']\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_load_and_load_or_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terrapin.yaml");
        assert!(matches!(RepoConfig::load(&path), Err(ConfigError::Read { .. })));
        assert!(!RepoConfig::load_or_default(&path).unwrap().has_projects());

        std::fs::write(&path, "projects:\n  - dir: prod\n").unwrap();
        assert_eq!(RepoConfig::load_or_default(&path).unwrap().projects.len(), 1);
    }
}
