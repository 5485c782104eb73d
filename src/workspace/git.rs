//! Git plumbing for pull request checkouts.
//!
//! Every function here is synchronous and is run on the blocking pool by
//! `WorkingDirManager` while it holds the path's write lock.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use git2::build::CheckoutBuilder;
use git2::{Cred, FetchOptions, Oid, RemoteCallbacks, Repository, Signature};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::CheckoutError;

const BASE_REMOTE: &str = "origin";
const HEAD_REMOTE: &str = "head";
const MERGE_MESSAGE: &str = "terrapin-merge";

static URL_CREDENTIALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*://)(?P<user>[^:@/\s]+)(?::(?P<pass>[^@/\s]+))?@")
        .expect("static regex is valid")
});

/// How the pull request is materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStrategy {
    /// Check out the pull request head as-is.
    #[default]
    Branch,
    /// Check out the base branch with the pull request head merged into it.
    Merge,
}

/// Everything needed to fetch and materialize one pull request.
#[derive(Debug, Clone)]
pub struct CheckoutSpec {
    pub base_url: String,
    pub head_url: String,
    pub base_ref: String,
    pub head_ref: String,
    pub strategy: CheckoutStrategy,
}

/// Result of bringing a checkout up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutState {
    /// The pull request head commit the tree now reflects.
    pub head_commit: String,
    /// Whether the working tree changed.
    pub updated: bool,
}

/// Replace `user:pass@` in any URL with a redaction marker.
pub fn redact(text: &str) -> String {
    URL_CREDENTIALS
        .replace_all(text, "${scheme}<redacted>@")
        .into_owned()
}

fn git_err(op: &'static str, path: &Path, err: git2::Error) -> CheckoutError {
    CheckoutError::Git {
        op,
        path: path.to_path_buf(),
        message: redact(err.message()),
    }
}

fn fetch_options(url: &str) -> FetchOptions<'static> {
    let creds = URL_CREDENTIALS.captures(url).and_then(|c| {
        let user = c.name("user")?.as_str().to_string();
        let pass = c.name("pass").map(|m| m.as_str()).unwrap_or("").to_string();
        Some((user, pass))
    });

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username, _allowed| match &creds {
        Some((user, pass)) => Cred::userpass_plaintext(user, pass),
        None => Cred::default().or_else(|_| Cred::username(username.unwrap_or("git"))),
    });
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

fn ensure_remote(repo: &Repository, path: &Path, name: &str, url: &str) -> Result<(), CheckoutError> {
    match repo.find_remote(name) {
        Ok(remote) if remote.url() == Some(url) => Ok(()),
        Ok(_) => repo
            .remote_set_url(name, url)
            .map_err(|e| git_err("remote set-url", path, e)),
        Err(_) => repo
            .remote(name, url)
            .map(|_| ())
            .map_err(|e| git_err("remote add", path, e)),
    }
}

/// Fetch `branch` from `remote` into `refs/remotes/<remote>/<branch>` and return its tip.
fn fetch_branch(
    repo: &Repository,
    path: &Path,
    remote: &str,
    url: &str,
    branch: &str,
) -> Result<Oid, CheckoutError> {
    let tracking = format!("refs/remotes/{}/{}", remote, branch);
    let refspec = format!("+refs/heads/{}:{}", branch, tracking);
    let mut handle = repo
        .find_remote(remote)
        .map_err(|e| git_err("find remote", path, e))?;
    handle
        .fetch(&[refspec.as_str()], Some(&mut fetch_options(url)), None)
        .map_err(|e| git_err("fetch", path, e))?;
    debug!(remote, branch, "Fetched branch");
    repo.refname_to_id(&tracking)
        .map_err(|e| git_err("resolve fetched ref", path, e))
}

struct FetchedTips {
    base: Oid,
    head: Oid,
}

fn fetch_tips(repo: &Repository, path: &Path, spec: &CheckoutSpec) -> Result<FetchedTips, CheckoutError> {
    ensure_remote(repo, path, BASE_REMOTE, &spec.base_url)?;
    ensure_remote(repo, path, HEAD_REMOTE, &spec.head_url)?;
    let base = fetch_branch(repo, path, BASE_REMOTE, &spec.base_url, &spec.base_ref)?;
    let head = fetch_branch(repo, path, HEAD_REMOTE, &spec.head_url, &spec.head_ref)?;
    Ok(FetchedTips { base, head })
}

fn checkout_commit(repo: &Repository, path: &Path, oid: Oid) -> Result<(), CheckoutError> {
    let commit = repo
        .find_commit(oid)
        .map_err(|e| git_err("find commit", path, e))?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
        .map_err(|e| git_err("checkout", path, e))?;
    repo.set_head_detached(oid)
        .map_err(|e| git_err("set head", path, e))
}

/// Produce the commit the tree should show for `head` under the strategy.
fn target_commit(
    repo: &Repository,
    path: &Path,
    strategy: CheckoutStrategy,
    tips: &FetchedTips,
) -> Result<Oid, CheckoutError> {
    if strategy == CheckoutStrategy::Branch {
        return Ok(tips.head);
    }

    let already_contains_base = tips.head == tips.base
        || repo
            .graph_descendant_of(tips.head, tips.base)
            .map_err(|e| git_err("merge-base", path, e))?;
    if already_contains_base {
        return Ok(tips.head);
    }

    let base = repo
        .find_commit(tips.base)
        .map_err(|e| git_err("find base", path, e))?;
    let head = repo
        .find_commit(tips.head)
        .map_err(|e| git_err("find head", path, e))?;
    let mut index = repo
        .merge_commits(&base, &head, None)
        .map_err(|e| git_err("merge", path, e))?;

    if index.has_conflicts() {
        let conflicted: Vec<String> = index
            .conflicts()
            .map_err(|e| git_err("read conflicts", path, e))?
            .filter_map(|c| c.ok())
            .filter_map(|c| c.our.or(c.their))
            .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
            .collect();
        return Err(CheckoutError::MergeConflict {
            path: path.to_path_buf(),
            message: format!(
                "merging {} into {} conflicts in: {}",
                spec_name(&head),
                spec_name(&base),
                conflicted.join(", ")
            ),
        });
    }

    let tree_id = index
        .write_tree_to(repo)
        .map_err(|e| git_err("write merge tree", path, e))?;
    let tree = repo
        .find_tree(tree_id)
        .map_err(|e| git_err("find merge tree", path, e))?;
    let sig = Signature::now("terrapin", "terrapin@localhost")
        .map_err(|e| git_err("signature", path, e))?;
    repo.commit(None, &sig, &sig, MERGE_MESSAGE, &tree, &[&base, &head])
        .map_err(|e| git_err("commit merge", path, e))
}

fn spec_name(commit: &git2::Commit<'_>) -> String {
    commit.id().to_string()[..8].to_string()
}

/// The pull request head currently reflected by HEAD: the second parent of
/// a merge commit we made, otherwise HEAD itself.
fn current_pull_head(repo: &Repository, path: &Path) -> Result<Oid, CheckoutError> {
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| git_err("read HEAD", path, e))?;
    if head.parent_count() == 2 && head.message() == Some(MERGE_MESSAGE) {
        return head
            .parent_id(1)
            .map_err(|e| git_err("read merge parent", path, e));
    }
    Ok(head.id())
}

/// Initialize a fresh checkout at `path`, which must not exist yet.
pub fn clone_fresh(path: &Path, spec: &CheckoutSpec) -> Result<CheckoutState, CheckoutError> {
    std::fs::create_dir_all(path).map_err(|source| CheckoutError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let repo = Repository::init(path).map_err(|e| git_err("init", path, e))?;
    let tips = fetch_tips(&repo, path, spec)?;
    let target = target_commit(&repo, path, spec.strategy, &tips)?;
    checkout_commit(&repo, path, target)?;
    Ok(CheckoutState {
        head_commit: tips.head.to_string(),
        updated: true,
    })
}

/// Bring an existing checkout up to the latest pull request head.
///
/// Only forward movement is accepted: if the new head does not descend
/// from the head the checkout currently reflects, the update fails rather
/// than leaving an ambiguous tree.
pub fn refresh(path: &Path, spec: &CheckoutSpec) -> Result<CheckoutState, CheckoutError> {
    let repo = Repository::open(path).map_err(|e| git_err("open", path, e))?;
    let current = current_pull_head(&repo, path)?;
    let tips = fetch_tips(&repo, path, spec)?;

    if tips.head == current {
        return Ok(CheckoutState {
            head_commit: current.to_string(),
            updated: false,
        });
    }

    let fast_forward = repo
        .graph_descendant_of(tips.head, current)
        .map_err(|e| git_err("merge-base", path, e))?;
    if !fast_forward {
        return Err(CheckoutError::MergeConflict {
            path: path.to_path_buf(),
            message: format!(
                "new head {} does not descend from checked-out head {}; fast-forward is impossible",
                tips.head, current
            ),
        });
    }

    let target = target_commit(&repo, path, spec.strategy, &tips)?;
    checkout_commit(&repo, path, target)?;
    Ok(CheckoutState {
        head_commit: tips.head.to_string(),
        updated: true,
    })
}

/// The pull request head commit an existing checkout reflects.
pub fn pull_head(path: &Path) -> Result<String, CheckoutError> {
    let repo = Repository::open(path).map_err(|e| git_err("open", path, e))?;
    current_pull_head(&repo, path).map(|oid| oid.to_string())
}

/// Whether `path` holds a usable repository.
pub fn is_checkout(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Remove a checkout that failed half-way through creation.
pub fn discard(path: &Path) -> Result<(), CheckoutError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|source| CheckoutError::Io {
            path: PathBuf::from(path),
            source,
        })?;
    }
    Ok(())
}
