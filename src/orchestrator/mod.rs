//! Command orchestrator.
//!
//! One `execute` call is one orchestration pass: load the repo config from the
//! pull request's checkout, build project contexts, run them on a bounded
//! worker pool and collect every result before returning. Passes for the same
//! pull request share a cancellation token and a gate so that closing the pull
//! request can stop them and wait for them to drain.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::builder::{ProjectCommandBuilder, ProjectContext};
use crate::errors::{CheckoutError, LockError, StoreError};
use crate::locking::{LockStore, ProjectLocker, SqliteLockStore};
use crate::models::{CommandEvent, CommandName, DEFAULT_WORKSPACE, ProjectIdentity, Repo};
use crate::repo_config::RepoConfig;
use crate::runtime::{CommandResult, ProjectOutcome, ProjectResult, StepRunner, remove_plan};
use crate::server_config::ServerConfig;
use crate::workspace::{WorkingDirManager, redact};

/// Per pull request coordination shared by all of its passes.
#[derive(Clone)]
struct PullState {
    cancel: CancellationToken,
    gate: Arc<RwLock<()>>,
}

impl PullState {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            gate: Arc::new(RwLock::new(())),
        }
    }
}

/// What a spawned project task needs; cheap to clone.
#[derive(Clone)]
struct Worker {
    working_dirs: Arc<WorkingDirManager>,
    runner: Arc<StepRunner>,
}

impl Worker {
    async fn run_project(&self, ctx: &ProjectContext, cancel: &CancellationToken) -> ProjectResult {
        let checkout = match self
            .working_dirs
            .existing(&ctx.repo, ctx.pull.num, &ctx.identity.workspace)
            .await
        {
            Ok(checkout) => checkout,
            Err(e) => return checkout_failed(ctx, &e),
        };
        // The checkout's read guard is held until the steps finish.
        self.runner
            .run(ctx, &checkout.path, &checkout.head_commit, cancel)
            .await
    }
}

fn checkout_failed(ctx: &ProjectContext, err: &CheckoutError) -> ProjectResult {
    ProjectResult::new(
        ctx,
        ProjectOutcome::CheckoutFailed {
            message: redact(&err.to_string()),
        },
    )
}

pub struct CommandOrchestrator {
    builder: ProjectCommandBuilder,
    locker: ProjectLocker,
    worker: Worker,
    repo_config_file: String,
    max_parallel: usize,
    pulls: DashMap<(String, u64), PullState>,
}

impl CommandOrchestrator {
    pub fn new(config: &ServerConfig, store: Arc<dyn LockStore>) -> Self {
        let locker = ProjectLocker::new(store).with_retries(config.toml.execution.store_retries);
        let working_dirs = WorkingDirManager::new(
            &config.data_dir,
            config.toml.server.checkout_strategy,
        );
        let runner = StepRunner::new(locker.clone(), config.runner_settings());
        Self {
            builder: ProjectCommandBuilder::new(config.toml.server.require_declared_projects),
            locker,
            worker: Worker {
                working_dirs: Arc::new(working_dirs),
                runner: Arc::new(runner),
            },
            repo_config_file: config.repo_config_file().to_string(),
            max_parallel: config.max_parallel(),
            pulls: DashMap::new(),
        }
    }

    /// Open the durable lock store under the data dir and build the orchestrator on it.
    pub fn open(config: &ServerConfig) -> Result<Self, StoreError> {
        let store = SqliteLockStore::open(&config.lock_db_path())?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn locker(&self) -> &ProjectLocker {
        &self.locker
    }

    pub fn working_dirs(&self) -> &WorkingDirManager {
        &self.worker.working_dirs
    }

    fn pull_state(&self, repo: &str, pull: u64) -> PullState {
        self.pulls
            .entry((repo.to_string(), pull))
            .or_insert_with(PullState::new)
            .clone()
    }

    /// Run one orchestration pass for an inbound event.
    pub async fn execute(&self, event: &CommandEvent) -> CommandResult {
        let span = info_span!(
            "command",
            repo = %event.repo.full_name,
            pull = event.pull.num,
            command = %event.command.name
        );
        async {
            let state = self.pull_state(&event.repo.full_name, event.pull.num);
            let _pass = state.gate.clone().read_owned().await;
            let result = CommandResult::new(event.command.name, &event.repo.full_name, event.pull.num);
            if state.cancel.is_cancelled() {
                return result.with_error("pull request was closed");
            }

            let result = match event.command.name {
                CommandName::Unlock => self.unlock(event, result).await,
                CommandName::ApprovePolicies => self.approve_policies(event, result).await,
                CommandName::Plan | CommandName::Apply => {
                    self.run_projects(event, result, &state.cancel).await
                }
            };
            info!(
                projects = result.projects.len(),
                errors = result.has_errors(),
                "Command finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Read the repo config from the default-workspace checkout. Plan refreshes
    /// the checkout first; every other command uses what the last plan left.
    async fn load_repo_config(&self, event: &CommandEvent) -> Result<RepoConfig, String> {
        let wd = &self.worker.working_dirs;
        let checkout = if event.command.name == CommandName::Plan {
            wd.get_or_create(&event.repo, &event.pull, DEFAULT_WORKSPACE)
                .await
        } else {
            wd.existing(&event.repo, event.pull.num, DEFAULT_WORKSPACE)
                .await
        }
        .map_err(|e| redact(&e.to_string()))?;

        let path = checkout.path.join(&self.repo_config_file);
        RepoConfig::load_or_default(&path).map_err(|e| e.to_string())
    }

    async fn build_contexts(&self, event: &CommandEvent) -> Result<Vec<ProjectContext>, String> {
        let config = self.load_repo_config(event).await?;
        self.builder
            .build(event, &config)
            .map_err(|e| e.to_string())
    }

    async fn run_projects(
        &self,
        event: &CommandEvent,
        mut result: CommandResult,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let contexts = match self.build_contexts(event).await {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!(error = %e, "Command rejected before execution");
                return result.with_error(e);
            }
        };
        if contexts.is_empty() {
            info!("No projects matched");
            return result;
        }

        let prepared = if event.command.name == CommandName::Plan {
            self.prepare_checkouts(event, &contexts).await
        } else {
            Vec::new()
        };

        result.projects = self.fan_out(contexts, prepared, cancel).await;
        result
    }

    /// Clone or refresh every non-default workspace a plan touches, once per
    /// pass, before projects pin their checkouts.
    async fn prepare_checkouts(
        &self,
        event: &CommandEvent,
        contexts: &[ProjectContext],
    ) -> Vec<(String, CheckoutError)> {
        let workspaces: BTreeSet<&str> = contexts
            .iter()
            .map(|c| c.identity.workspace.as_str())
            .filter(|w| *w != DEFAULT_WORKSPACE)
            .collect();

        let wd = &self.worker.working_dirs;
        let refreshes = workspaces.into_iter().map(|workspace| async move {
            let outcome = wd.get_or_create(&event.repo, &event.pull, workspace).await;
            (workspace.to_string(), outcome.err())
        });
        join_all(refreshes)
            .await
            .into_iter()
            .filter_map(|(workspace, err)| err.map(|e| (workspace, e)))
            .collect()
    }

    /// Run contexts on at most `max_parallel` tasks. Results land in a slot per
    /// context, so output order matches build order whatever the completion order.
    async fn fan_out(
        &self,
        contexts: Vec<ProjectContext>,
        failed_checkouts: Vec<(String, CheckoutError)>,
        cancel: &CancellationToken,
    ) -> Vec<ProjectResult> {
        let count = contexts.len();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, ProjectResult)>(count);
        let mut slots: Vec<Option<ProjectResult>> = vec![None; count];
        let mut handles = Vec::with_capacity(count);

        for (index, ctx) in contexts.iter().enumerate() {
            if let Some((_, err)) = failed_checkouts
                .iter()
                .find(|(ws, _)| ws == &ctx.identity.workspace)
            {
                slots[index] = Some(checkout_failed(ctx, err));
                continue;
            }

            let semaphore = semaphore.clone();
            let result_tx = result_tx.clone();
            let worker = self.worker.clone();
            let cancel = cancel.clone();
            let ctx = ctx.clone();
            let handle = tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => worker.run_project(&ctx, &cancel).await,
                    Err(e) => ProjectResult::new(
                        &ctx,
                        ProjectOutcome::Error {
                            message: format!("worker pool closed: {}", e),
                        },
                    ),
                };
                result_tx.send((index, result)).await.ok();
            });
            handles.push((index, handle));
        }
        drop(result_tx);

        while let Some((index, result)) = result_rx.recv().await {
            slots[index] = Some(result);
        }

        for (index, handle) in handles {
            if let Err(e) = handle.await {
                error!(project = %contexts[index].identity, error = %e, "Project task failed");
                if slots[index].is_none() {
                    slots[index] = Some(ProjectResult::new(
                        &contexts[index],
                        ProjectOutcome::Error {
                            message: format!("project task failed: {}", e),
                        },
                    ));
                }
            }
        }

        slots
            .into_iter()
            .zip(contexts.iter())
            .map(|(slot, ctx)| {
                slot.unwrap_or_else(|| {
                    ProjectResult::new(
                        ctx,
                        ProjectOutcome::Error {
                            message: "project produced no result".to_string(),
                        },
                    )
                })
            })
            .collect()
    }

    /// `unlock` releases every lock the pull request holds, or with `-d`/`-w`
    /// just that project's.
    async fn unlock(&self, event: &CommandEvent, mut result: CommandResult) -> CommandResult {
        let cmd = &event.command;
        let released = if cmd.dir.is_some() || cmd.workspace.is_some() {
            let identity = ProjectIdentity::new(
                &event.repo.full_name,
                cmd.dir.as_deref().unwrap_or("."),
                cmd.workspace.as_deref().unwrap_or(DEFAULT_WORKSPACE),
            );
            match self.locker.ensure_held(&identity, event.pull.num).await {
                Ok(_) => self
                    .locker
                    .unlock(&identity)
                    .await
                    .map(|r| r.into_iter().collect::<Vec<_>>()),
                Err(LockError::NotHeld { .. }) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        } else {
            self.locker
                .unlock_all_for_pull_request(&event.repo.full_name, event.pull.num)
                .await
        };

        match released {
            Ok(locks) => {
                for plan in locks.iter().filter_map(|lock| lock.plan.as_ref()) {
                    remove_plan(&plan.path);
                }
                result.unlocked = locks;
                result
            }
            Err(e) => result.with_error(e.to_string()),
        }
    }

    async fn approve_policies(&self, event: &CommandEvent, mut result: CommandResult) -> CommandResult {
        let contexts = match self.build_contexts(event).await {
            Ok(contexts) => contexts,
            Err(e) => return result.with_error(e),
        };
        for ctx in &contexts {
            let outcome = match self.locker.approve_policies(&ctx.identity, ctx.pull.num).await {
                Ok(_) => ProjectOutcome::Success,
                Err(LockError::HeldByOther { holder, key }) => ProjectOutcome::LockConflict {
                    message: format!("{} is locked by pull request #{}", key, holder.pull_num),
                    locked_by_pull: Some(holder.pull_num),
                },
                Err(e @ LockError::NotHeld { .. }) => ProjectOutcome::LockConflict {
                    message: e.to_string(),
                    locked_by_pull: None,
                },
                Err(e) => ProjectOutcome::Error {
                    message: e.to_string(),
                },
            };
            result.projects.push(ProjectResult::new(ctx, outcome));
        }
        result
    }

    /// Handle a closed or merged pull request: cancel its in-flight passes,
    /// wait for them to stop, release every lock it holds and delete its
    /// checkouts.
    pub async fn close_pull_request(&self, repo: &Repo, pull: u64) -> CommandResult {
        let state = self.pull_state(&repo.full_name, pull);
        state.cancel.cancel();
        let _exclusive = state.gate.clone().write_owned().await;
        self.pulls.remove(&(repo.full_name.clone(), pull));
        info!(repo = %repo.full_name, pull, "Pull request closed; in-flight work drained");

        let mut result = CommandResult::new(CommandName::Unlock, &repo.full_name, pull);
        match self.locker.unlock_all_for_pull_request(&repo.full_name, pull).await {
            Ok(locks) => result.unlocked = locks,
            Err(e) => {
                error!(error = %e, "Failed to release locks for closed pull request");
                result.error = Some(e.to_string());
            }
        }
        if let Err(e) = self.worker.working_dirs.clean(repo, pull).await {
            warn!(error = %e, "Failed to delete checkouts");
            if result.error.is_none() {
                result.error = Some(redact(&e.to_string()));
            }
        }
        result
    }
}
