//! Mutual exclusion over the lock store.
//!
//! All store access runs on tokio's blocking pool. Transient store errors
//! (busy/locked database) are retried a bounded number of times; anything
//! else, or exhausting the retries, surfaces as `LockError::Store` so callers
//! never proceed without a confirmed lock state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::store::{LockStore, SaveOutcome};
use crate::errors::{LockError, StoreError};
use crate::models::{LockRecord, PlanRef, PolicyStatus, ProjectIdentity};

const DEFAULT_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryLockOutcome {
    /// The caller holds the lock (newly created, or already held by the same pull request).
    Acquired(LockRecord),
    /// Another pull request holds the lock.
    HeldBy(LockRecord),
}

impl TryLockOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, TryLockOutcome::Acquired(_))
    }

    pub fn record(&self) -> &LockRecord {
        match self {
            TryLockOutcome::Acquired(r) | TryLockOutcome::HeldBy(r) => r,
        }
    }
}

/// Project-level try-lock/unlock keyed by `ProjectIdentity`.
#[derive(Clone)]
pub struct ProjectLocker {
    store: Arc<dyn LockStore>,
    retries: u32,
}

impl ProjectLocker {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Set how many times a transient store error is retried.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Run a store operation on the blocking pool, retrying transient failures.
    async fn call<F, R>(&self, op: &'static str, f: F) -> Result<R, LockError>
    where
        F: Fn(&dyn LockStore) -> Result<R, StoreError> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let store = self.store.clone();
            let f = f.clone();
            let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
                .await
                .unwrap_or_else(|e| Err(StoreError::Task(e.to_string())));

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= self.retries => {
                    warn!(op, attempt, error = %err, "Transient lock store error, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    return Err(LockError::Store {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// Attempt to lock `identity` for `pull_num`.
    ///
    /// If the lock already belongs to the same pull request the existing
    /// record is returned as acquired; otherwise the current holder is
    /// returned so the caller can report it without another lookup.
    pub async fn try_lock(
        &self,
        identity: &ProjectIdentity,
        pull_num: u64,
        user: &str,
    ) -> Result<TryLockOutcome, LockError> {
        let candidate = LockRecord::new(identity.clone(), pull_num, user);
        let saved = candidate.clone();
        let outcome = self.call("save", move |s| s.save(&saved)).await?;

        let outcome = match outcome {
            SaveOutcome::Saved => {
                info!(lock_key = %identity, pull = pull_num, "Acquired project lock");
                TryLockOutcome::Acquired(candidate)
            }
            SaveOutcome::Exists(existing) if existing.pull_num == pull_num => {
                debug!(lock_key = %identity, pull = pull_num, "Lock already held by this pull request");
                TryLockOutcome::Acquired(existing)
            }
            SaveOutcome::Exists(existing) => {
                info!(
                    lock_key = %identity,
                    pull = pull_num,
                    holder = existing.pull_num,
                    "Project locked by another pull request"
                );
                TryLockOutcome::HeldBy(existing)
            }
        };
        Ok(outcome)
    }

    /// Release the lock on `identity`. Unlocking an unlocked project is not an error.
    pub async fn unlock(&self, identity: &ProjectIdentity) -> Result<Option<LockRecord>, LockError> {
        let key = identity.lock_key();
        let removed = self.call("delete", move |s| s.delete(&key)).await?;
        if let Some(ref lock) = removed {
            info!(lock_key = %identity, pull = lock.pull_num, "Released project lock");
        }
        Ok(removed)
    }

    /// Release every lock held by a pull request, whoever created it.
    pub async fn unlock_all_for_pull_request(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<LockRecord>, LockError> {
        let repo = repo_full_name.to_string();
        let removed = self
            .call("delete_by_pull_request", move |s| {
                s.delete_by_pull_request(&repo, pull_num)
            })
            .await?;
        info!(
            repo = repo_full_name,
            pull = pull_num,
            released = removed.len(),
            "Released pull request locks"
        );
        Ok(removed)
    }

    pub async fn get_lock(&self, identity: &ProjectIdentity) -> Result<Option<LockRecord>, LockError> {
        let key = identity.lock_key();
        self.call("get", move |s| s.get(&key)).await
    }

    pub async fn list(&self) -> Result<Vec<LockRecord>, LockError> {
        self.call("list", |s| s.list()).await
    }

    /// Return the lock record if `pull_num` currently holds `identity`.
    pub async fn ensure_held(
        &self,
        identity: &ProjectIdentity,
        pull_num: u64,
    ) -> Result<LockRecord, LockError> {
        match self.get_lock(identity).await? {
            Some(lock) if lock.pull_num == pull_num => Ok(lock),
            Some(lock) => Err(LockError::HeldByOther {
                key: identity.lock_key(),
                holder: Box::new(lock),
            }),
            None => Err(LockError::NotHeld {
                key: identity.lock_key(),
                pull: pull_num,
            }),
        }
    }

    /// Persist a modified copy of a held lock.
    async fn store_update(&self, lock: LockRecord) -> Result<LockRecord, LockError> {
        let pull = lock.pull_num;
        let key = lock.key();
        let written = lock.clone();
        if self.call("update", move |s| s.update(&written)).await? {
            Ok(lock)
        } else {
            Err(LockError::NotHeld { key, pull })
        }
    }

    /// Attach the plan produced under the lock. Resets policy status, since
    /// any earlier check applied to a previous plan.
    pub async fn record_plan(
        &self,
        identity: &ProjectIdentity,
        pull_num: u64,
        plan: PlanRef,
    ) -> Result<LockRecord, LockError> {
        let mut lock = self.ensure_held(identity, pull_num).await?;
        lock.plan = Some(plan);
        lock.policy = PolicyStatus::Unchecked;
        self.store_update(lock).await
    }

    pub async fn record_policy(
        &self,
        identity: &ProjectIdentity,
        pull_num: u64,
        status: PolicyStatus,
    ) -> Result<LockRecord, LockError> {
        let mut lock = self.ensure_held(identity, pull_num).await?;
        lock.policy = status;
        self.store_update(lock).await
    }

    /// Approve failed policy checks for a project the pull request holds.
    pub async fn approve_policies(
        &self,
        identity: &ProjectIdentity,
        pull_num: u64,
    ) -> Result<LockRecord, LockError> {
        let mut lock = self.ensure_held(identity, pull_num).await?;
        if lock.policy == PolicyStatus::Failed {
            lock.policy = PolicyStatus::Approved;
            info!(lock_key = %identity, pull = pull_num, "Approved failing policies");
            return self.store_update(lock).await;
        }
        Ok(lock)
    }
}
