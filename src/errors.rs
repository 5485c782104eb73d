//! Typed error hierarchy for terrapin.
//!
//! One enum per subsystem:
//! - `ConfigError`: bad or ambiguous project declarations, surfaced before any execution
//! - `StoreError`: lock store unavailable or corrupt
//! - `LockError`: project locker failures (conflicts and store exhaustion)
//! - `CheckoutError`: clone/fetch/merge failures in the working directory manager
//! - `StepError`: failures launching or supervising an external process

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::LockRecord;

/// Errors in the repository's declarative configuration or in command targeting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read repo config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse repo config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown step type '{name}' in workflow '{workflow}'")]
    UnknownStep { workflow: String, name: String },

    #[error("Invalid step in workflow '{workflow}': {message}")]
    InvalidStep { workflow: String, message: String },

    #[error("Unknown stage '{stage}' in workflow '{workflow}'")]
    UnknownStage { workflow: String, stage: String },

    #[error("Project '{project}' references undefined workflow '{workflow}'")]
    UndefinedWorkflow { project: String, workflow: String },

    #[error("Project dir '{dir}' must be a relative path inside the repository")]
    InvalidDir { dir: String },

    #[error("Invalid workspace '{workspace}': use letters, digits, '-', '_' or '.'")]
    InvalidWorkspace { workspace: String },

    #[error("Invalid when_modified pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Duplicate project name '{name}'")]
    DuplicateName { name: String },

    #[error(
        "Projects in dir '{dir}' with workspace '{workspace}' must each set a distinct name"
    )]
    DuplicateProject { dir: String, workspace: String },

    #[error("No project configured for dir '{dir}' and workspace '{workspace}'")]
    NoProjectConfigured { dir: String, workspace: String },

    #[error("No project named '{name}' is configured")]
    UnknownProject { name: String },

    #[error("Ambiguous match: {candidates:?} all match; select one with -p")]
    Ambiguous { candidates: Vec<String> },
}

/// Errors from the durable lock store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Lock store is busy: {0}")]
    Busy(String),

    #[error("Lock store I/O failed: {0}")]
    Io(String),

    #[error("Corrupt lock record at key '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Lock store task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Transient conditions that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err.to_string())
            }
            _ => StoreError::Io(err.to_string()),
        }
    }
}

/// Errors from the project locker.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Project {key} is locked by pull request #{}", .holder.pull_num)]
    HeldByOther { key: String, holder: Box<LockRecord> },

    #[error("No plan found for {key}: pull request #{pull} does not hold the lock")]
    NotHeld { key: String, pull: u64 },

    #[error("Policy checks failed for {key}; approve policies before applying")]
    PoliciesFailed { key: String },

    #[error("Lock store unavailable after {attempts} attempts: {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Errors materializing a pull request checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Git operation '{op}' failed in {path}: {message}")]
    Git {
        op: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error(
        "Cannot update checkout at {path}: {message}. Terraform will not run against a partially merged tree"
    )]
    MergeConflict { path: PathBuf, message: String },

    #[error("No checkout exists at {path}; run plan first")]
    NotCloned { path: PathBuf },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing checkout for invalid workspace '{workspace}'")]
    InvalidWorkspace { workspace: String },

    #[error("Checkout task failed: {0}")]
    Task(String),
}

/// Errors launching or supervising an external process.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step timed out after {0:?}")]
    TimedOut(Duration),

    #[error("No plan file found at {path}")]
    MissingPlan { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectIdentity;

    #[test]
    fn store_error_busy_is_transient() {
        assert!(StoreError::Busy("locked".into()).is_transient());
        assert!(!StoreError::Io("disk".into()).is_transient());
        assert!(
            !StoreError::Corrupt {
                key: "k".into(),
                message: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn lock_error_held_by_other_names_pull() {
        let holder = LockRecord::new(ProjectIdentity::new("r", "prod", "default"), 1, "alice");
        let err = LockError::HeldByOther {
            key: holder.key(),
            holder: Box::new(holder),
        };
        assert!(err.to_string().contains("#1"));
        assert!(err.to_string().contains("r#prod#default"));
    }

    #[test]
    fn config_error_unknown_step_carries_names() {
        let err = ConfigError::UnknownStep {
            workflow: "custom".into(),
            name: "destroy".into(),
        };
        match &err {
            ConfigError::UnknownStep { workflow, name } => {
                assert_eq!(workflow, "custom");
                assert_eq!(name, "destroy");
            }
            _ => panic!("Expected UnknownStep"),
        }
    }

    #[test]
    fn merge_conflict_mentions_partial_tree() {
        let err = CheckoutError::MergeConflict {
            path: PathBuf::from("/data/repos/r/1/default"),
            message: "conflict in main.tf".into(),
        };
        assert!(err.to_string().contains("partially merged"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::DuplicateName { name: "x".into() });
        assert_std_error(&StoreError::Io("x".into()));
        assert_std_error(&LockError::NotHeld {
            key: "k".into(),
            pull: 1,
        });
        assert_std_error(&CheckoutError::Task("x".into()));
        assert_std_error(&StepError::TimedOut(Duration::from_secs(1)));
    }
}
