//! Working directory manager.
//!
//! Owns the on-disk checkouts under `<data_dir>/repos/<owner>/<repo>/<pull>/<workspace>`.
//! Every clone, fetch, merge or delete of a checkout path runs under that
//! path's write lock; callers that execute steps keep the returned
//! [`Checkout`] alive, which holds the read side until they are done.

pub mod git;
pub mod path_locks;

use std::path::{Path, PathBuf};

use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, info, warn};

use crate::errors::CheckoutError;
use crate::models::{PullRequest, Repo, is_valid_workspace};

pub use git::{CheckoutSpec, CheckoutStrategy, redact};
pub use path_locks::PathLocks;

/// A materialized checkout, pinned against concurrent mutation while held.
#[derive(Debug)]
pub struct Checkout {
    pub path: PathBuf,
    /// Pull request head commit the tree reflects.
    pub head_commit: String,
    /// Whether this call changed the tree (fresh clone or new head).
    pub updated: bool,
    _guard: OwnedRwLockReadGuard<()>,
}

#[derive(Debug)]
pub struct WorkingDirManager {
    data_dir: PathBuf,
    strategy: CheckoutStrategy,
    locks: PathLocks,
}

impl WorkingDirManager {
    pub fn new(data_dir: impl Into<PathBuf>, strategy: CheckoutStrategy) -> Self {
        Self {
            data_dir: data_dir.into(),
            strategy,
            locks: PathLocks::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn strategy(&self) -> CheckoutStrategy {
        self.strategy
    }

    /// Directory holding every workspace checkout of one pull request.
    pub fn pull_dir(&self, repo: &Repo, pull_num: u64) -> PathBuf {
        self.data_dir
            .join("repos")
            .join(&repo.full_name)
            .join(pull_num.to_string())
    }

    /// Checkout path for one workspace of a pull request.
    pub fn checkout_dir(&self, repo: &Repo, pull_num: u64, workspace: &str) -> PathBuf {
        self.pull_dir(repo, pull_num).join(workspace)
    }

    fn checked_dir(&self, repo: &Repo, pull_num: u64, workspace: &str) -> Result<PathBuf, CheckoutError> {
        if !is_valid_workspace(workspace) {
            return Err(CheckoutError::InvalidWorkspace {
                workspace: workspace.to_string(),
            });
        }
        Ok(self.checkout_dir(repo, pull_num, workspace))
    }

    /// Clone the pull request into the workspace's checkout, or bring an
    /// existing checkout up to the current head.
    pub async fn get_or_create(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<Checkout, CheckoutError> {
        let path = self.checked_dir(repo, pull.num, workspace)?;
        let spec = CheckoutSpec {
            base_url: repo.clone_url.clone(),
            head_url: pull
                .head_clone_url
                .clone()
                .unwrap_or_else(|| repo.clone_url.clone()),
            base_ref: pull.base_ref.clone(),
            head_ref: pull.head_ref.clone(),
            strategy: self.strategy,
        };

        let write = self.locks.write(&path).await;
        let task_path = path.clone();
        let state = tokio::task::spawn_blocking(move || {
            if git::is_checkout(&task_path) {
                debug!(path = %task_path.display(), "Refreshing existing checkout");
                return git::refresh(&task_path, &spec);
            }
            git::discard(&task_path)?;
            info!(path = %task_path.display(), strategy = ?spec.strategy, "Cloning pull request");
            let result = git::clone_fresh(&task_path, &spec);
            if result.is_err() {
                if let Err(e) = git::discard(&task_path) {
                    warn!(path = %task_path.display(), error = %e, "Failed to remove partial checkout");
                }
            }
            result
        })
        .await
        .map_err(|e| CheckoutError::Task(e.to_string()))??;

        if let Some(expected) = &pull.head_commit {
            if expected != &state.head_commit {
                warn!(
                    expected = %expected,
                    fetched = %state.head_commit,
                    "Fetched head differs from event head; the branch moved since the event"
                );
            }
        }

        Ok(Checkout {
            path,
            head_commit: state.head_commit,
            updated: state.updated,
            _guard: write.downgrade(),
        })
    }

    /// Pin an existing checkout without touching it.
    pub async fn existing(
        &self,
        repo: &Repo,
        pull_num: u64,
        workspace: &str,
    ) -> Result<Checkout, CheckoutError> {
        let path = self.checked_dir(repo, pull_num, workspace)?;
        let guard = self.locks.read(&path).await;
        let task_path = path.clone();
        let head_commit = tokio::task::spawn_blocking(move || {
            if !git::is_checkout(&task_path) {
                return Err(CheckoutError::NotCloned { path: task_path });
            }
            git::pull_head(&task_path)
        })
        .await
        .map_err(|e| CheckoutError::Task(e.to_string()))??;

        Ok(Checkout {
            path,
            head_commit,
            updated: false,
            _guard: guard,
        })
    }

    /// Delete every checkout of the pull request. Waits for in-flight step
    /// executions in each workspace to release their read locks first.
    pub async fn clean(&self, repo: &Repo, pull_num: u64) -> Result<(), CheckoutError> {
        let pull_dir = self.pull_dir(repo, pull_num);
        let mut workspaces = match std::fs::read_dir(&pull_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(CheckoutError::Io {
                    path: pull_dir,
                    source,
                });
            }
        };
        workspaces.sort();

        let mut guards = Vec::with_capacity(workspaces.len());
        for path in &workspaces {
            guards.push(self.locks.write(path).await);
        }

        let target = pull_dir.clone();
        tokio::task::spawn_blocking(move || git::discard(&target))
            .await
            .map_err(|e| CheckoutError::Task(e.to_string()))??;
        info!(path = %pull_dir.display(), "Removed pull request checkouts");

        drop(guards);
        for path in &workspaces {
            self.locks.prune(path);
        }
        Ok(())
    }
}
