//! Step runner.
//!
//! Runs one project's workflow stages in order inside its checkout. The first
//! step that does not succeed ends the project; later steps are skipped and
//! leave no result. Lock transitions driven by step outcomes happen here:
//! a successful plan takes the lock, a successful apply releases it.

pub mod process;
pub mod results;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::builder::ProjectContext;
use crate::errors::{LockError, StepError};
use crate::locking::{ProjectLocker, TryLockOutcome};
use crate::models::{CommandName, PlanRef, PolicyStatus};
use crate::repo_config::{Stage, Step};
use crate::workspace::redact;

use process::{Invocation, ProcessOutput, ProcessStatus};
pub use results::{CommandResult, ProjectOutcome, ProjectResult, StepResult, StepStatus};

/// Server-wide execution settings.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub terraform_bin: String,
    pub policy_bin: String,
    pub step_timeout: Duration,
    /// Added to every step's environment, under step-level env.
    pub env: BTreeMap<String, String>,
    /// Run the policy_check stage after a successful plan.
    pub policy_checks: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            terraform_bin: "terraform".to_string(),
            policy_bin: "conftest".to_string(),
            step_timeout: Duration::from_secs(3600),
            env: BTreeMap::new(),
            policy_checks: false,
        }
    }
}

/// Where a project runs and what it has produced so far in this pass.
struct Execution<'a> {
    ctx: &'a ProjectContext,
    project_dir: PathBuf,
    plan_file: PathBuf,
    head_commit: &'a str,
    cancel: &'a CancellationToken,
    applied: bool,
}

enum Flow {
    Continue,
    Stop(ProjectOutcome),
}

pub struct StepRunner {
    locker: ProjectLocker,
    settings: RunnerSettings,
}

impl StepRunner {
    pub fn new(locker: ProjectLocker, settings: RunnerSettings) -> Self {
        Self { locker, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Stages executed for a command.
    pub fn stages_for(&self, command: CommandName) -> Vec<Stage> {
        match command {
            CommandName::Plan if self.settings.policy_checks => {
                vec![Stage::Plan, Stage::PolicyCheck]
            }
            CommandName::Plan => vec![Stage::Plan],
            CommandName::Apply => vec![Stage::Apply],
            CommandName::Unlock | CommandName::ApprovePolicies => Vec::new(),
        }
    }

    /// Execute the context's stages in `checkout`, which the caller keeps
    /// pinned for the duration.
    pub async fn run(
        &self,
        ctx: &ProjectContext,
        checkout: &Path,
        head_commit: &str,
        cancel: &CancellationToken,
    ) -> ProjectResult {
        let span = info_span!(
            "project",
            lock_key = %ctx.identity,
            pull = ctx.pull.num,
            command = %ctx.command
        );
        self.run_inner(ctx, checkout, head_commit, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        ctx: &ProjectContext,
        checkout: &Path,
        head_commit: &str,
        cancel: &CancellationToken,
    ) -> ProjectResult {
        let started = Instant::now();
        let mut result = ProjectResult::new(ctx, ProjectOutcome::Success);
        let mut exec = Execution {
            ctx,
            project_dir: ctx.project_dir(checkout),
            plan_file: ctx.plan_file(checkout),
            head_commit,
            cancel,
            applied: false,
        };

        result.outcome = self.execute(&mut exec, &mut result.steps).await;

        if result.outcome == ProjectOutcome::Success && exec.applied {
            match self.locker.unlock(&ctx.identity).await {
                Ok(_) => remove_plan(&exec.plan_file),
                Err(e) => {
                    warn!(error = %e, "Apply succeeded but the lock could not be released");
                    result.outcome = ProjectOutcome::Error {
                        message: format!("apply succeeded but unlocking failed: {}", e),
                    };
                }
            }
        }

        if exec.plan_file.exists() {
            result.plan_file = Some(exec.plan_file.clone());
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(outcome = ?result.outcome, steps = result.steps.len(), "Project finished");
        result
    }

    async fn execute(&self, exec: &mut Execution<'_>, steps: &mut Vec<StepResult>) -> ProjectOutcome {
        let ctx = exec.ctx;
        if !exec.project_dir.is_dir() {
            return ProjectOutcome::Error {
                message: format!("dir '{}' does not exist in the pull request", ctx.identity.dir),
            };
        }

        if ctx.command == CommandName::Apply {
            if let Some(blocked) = self.apply_precondition(exec).await {
                return blocked;
            }
        }

        for stage in self.stages_for(ctx.command) {
            for step in ctx.steps(stage) {
                if exec.cancel.is_cancelled() {
                    return ProjectOutcome::Cancelled {
                        step: Some(step.name().to_string()),
                    };
                }
                debug!(step = step.name(), stage = stage.as_str(), "Running step");
                if let Flow::Stop(outcome) = self.run_step(exec, stage, step, steps).await {
                    return outcome;
                }
            }
        }
        ProjectOutcome::Success
    }

    /// Apply never runs unless this pull request holds the lock and any
    /// failed policy check has been approved. The plan applied is always the
    /// project's own file: named projects sharing a dir and workspace share
    /// one lock, so its plan ref only names the most recent plan among them.
    async fn apply_precondition(&self, exec: &Execution<'_>) -> Option<ProjectOutcome> {
        let ctx = exec.ctx;
        let lock = match self.locker.ensure_held(&ctx.identity, ctx.pull.num).await {
            Ok(lock) => lock,
            Err(LockError::HeldByOther { holder, .. }) => {
                return Some(ProjectOutcome::LockConflict {
                    message: format!(
                        "{} is locked by pull request #{}; apply is not allowed",
                        ctx.identity, holder.pull_num
                    ),
                    locked_by_pull: Some(holder.pull_num),
                });
            }
            Err(e @ LockError::NotHeld { .. }) => {
                return Some(ProjectOutcome::LockConflict {
                    message: e.to_string(),
                    locked_by_pull: None,
                });
            }
            Err(e) => {
                return Some(ProjectOutcome::Error {
                    message: e.to_string(),
                });
            }
        };

        if !lock.policy.permits_apply() {
            return Some(ProjectOutcome::PoliciesFailed {
                message: LockError::PoliciesFailed {
                    key: ctx.identity.lock_key(),
                }
                .to_string(),
            });
        }
        None
    }

    fn env_for(&self, exec: &Execution<'_>, step: &Step) -> BTreeMap<String, String> {
        let mut env = exec.ctx.base_env(&exec.plan_file);
        env.extend(self.settings.env.clone());
        env.extend(step.env().clone());
        env
    }

    async fn invoke(
        &self,
        exec: &Execution<'_>,
        stage: Stage,
        step: &Step,
        program: &str,
        args: Vec<String>,
        env: &BTreeMap<String, String>,
    ) -> (StepResult, Option<ProcessOutput>) {
        let invocation = Invocation {
            program,
            args,
            cwd: &exec.project_dir,
            env,
        };
        let command = redact(&invocation.display());
        match process::run(&invocation, self.settings.step_timeout, exec.cancel).await {
            Ok(output) => {
                let (status, exit_code) = match output.status {
                    ProcessStatus::Exited(0) => (StepStatus::Succeeded, Some(0)),
                    ProcessStatus::Exited(code) => (StepStatus::Failed, Some(code)),
                    ProcessStatus::TimedOut => (StepStatus::TimedOut, None),
                    ProcessStatus::Cancelled => (StepStatus::Cancelled, None),
                };
                let result = StepResult {
                    step: step.name().to_string(),
                    stage,
                    command,
                    status,
                    exit_code,
                    stdout: output.stdout.clone(),
                    stderr: output.stderr.clone(),
                    duration_ms: output.duration.as_millis() as u64,
                };
                (result, Some(output))
            }
            Err(e) => (error_result(step, stage, command, &e.to_string()), None),
        }
    }

    /// Map a finished step onto the project flow.
    fn flow_for(&self, result: &StepResult) -> Flow {
        match result.status {
            StepStatus::Succeeded => Flow::Continue,
            StepStatus::Failed => Flow::Stop(ProjectOutcome::StepFailed {
                step: result.step.clone(),
                exit_code: result.exit_code,
            }),
            StepStatus::TimedOut => {
                warn!(step = %result.step, timeout = ?self.settings.step_timeout, "Step timed out");
                Flow::Stop(ProjectOutcome::TimedOut {
                    step: result.step.clone(),
                    after_secs: self.settings.step_timeout.as_secs(),
                })
            }
            StepStatus::Cancelled => Flow::Stop(ProjectOutcome::Cancelled {
                step: Some(result.step.clone()),
            }),
            StepStatus::Error => Flow::Stop(ProjectOutcome::Error {
                message: result.stderr.clone(),
            }),
        }
    }

    async fn run_step(
        &self,
        exec: &mut Execution<'_>,
        stage: Stage,
        step: &Step,
        steps: &mut Vec<StepResult>,
    ) -> Flow {
        let env = self.env_for(exec, step);
        let tf = self.settings.terraform_bin.clone();
        let comment_args = exec.ctx.comment_args.clone();

        match step {
            Step::Init(args) => {
                let mut argv = vec!["init".to_string(), "-input=false".to_string()];
                argv.extend(args.extra_args.iter().cloned());
                let (result, _) = self.invoke(exec, stage, step, &tf, argv, &env).await;
                let flow = self.flow_for(&result);
                steps.push(result);
                flow
            }
            Step::Plan(args) => {
                remove_plan(&exec.plan_file);
                let mut argv = vec![
                    "plan".to_string(),
                    "-input=false".to_string(),
                    "-refresh=true".to_string(),
                    "-out".to_string(),
                    exec.plan_file.to_string_lossy().to_string(),
                ];
                argv.extend(args.extra_args.iter().cloned());
                argv.extend(comment_args);
                let (result, _) = self.invoke(exec, stage, step, &tf, argv, &env).await;
                let flow = self.flow_for(&result);
                steps.push(result);
                match flow {
                    Flow::Continue => self.lock_after_plan(exec).await,
                    stop => {
                        remove_plan(&exec.plan_file);
                        stop
                    }
                }
            }
            Step::Apply(args) => {
                if !exec.plan_file.exists() {
                    let err = StepError::MissingPlan {
                        path: exec.plan_file.clone(),
                    };
                    steps.push(error_result(step, stage, String::new(), &err.to_string()));
                    return Flow::Stop(ProjectOutcome::Error {
                        message: err.to_string(),
                    });
                }
                let mut argv = vec!["apply".to_string(), "-input=false".to_string()];
                argv.extend(args.extra_args.iter().cloned());
                argv.extend(comment_args);
                argv.push(exec.plan_file.to_string_lossy().to_string());
                let (result, _) = self.invoke(exec, stage, step, &tf, argv, &env).await;
                let flow = self.flow_for(&result);
                if result.succeeded() {
                    exec.applied = true;
                }
                steps.push(result);
                flow
            }
            Step::PolicyCheck(args) => self.policy_check(exec, stage, step, &args.extra_args, &env, steps).await,
            Step::Run(run) => {
                let argv = vec!["-c".to_string(), run.command.clone()];
                let (result, _) = self.invoke(exec, stage, step, "sh", argv, &env).await;
                let flow = self.flow_for(&result);
                steps.push(result);
                flow
            }
        }
    }

    /// Take the lock for a plan that just succeeded. If another pull request
    /// holds it, the plan is discarded.
    async fn lock_after_plan(&self, exec: &mut Execution<'_>) -> Flow {
        let ctx = exec.ctx;
        match self
            .locker
            .try_lock(&ctx.identity, ctx.pull.num, &ctx.user)
            .await
        {
            Ok(TryLockOutcome::Acquired(_)) => {
                let plan = PlanRef {
                    path: exec.plan_file.clone(),
                    head_commit: Some(exec.head_commit.to_string()),
                };
                match self.locker.record_plan(&ctx.identity, ctx.pull.num, plan).await {
                    Ok(_) => Flow::Continue,
                    Err(e) => Flow::Stop(ProjectOutcome::Error {
                        message: e.to_string(),
                    }),
                }
            }
            Ok(TryLockOutcome::HeldBy(holder)) => {
                info!(holder = holder.pull_num, "Plan discarded: project locked by another pull request");
                remove_plan(&exec.plan_file);
                Flow::Stop(ProjectOutcome::Discarded {
                    locked_by_pull: holder.pull_num,
                })
            }
            Err(e) => {
                remove_plan(&exec.plan_file);
                Flow::Stop(ProjectOutcome::Error {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Render the plan as JSON and evaluate it with the policy tool. The
    /// verdict is stored on the lock so apply can enforce it.
    async fn policy_check(
        &self,
        exec: &mut Execution<'_>,
        stage: Stage,
        step: &Step,
        extra_args: &[String],
        env: &BTreeMap<String, String>,
        steps: &mut Vec<StepResult>,
    ) -> Flow {
        if !exec.plan_file.exists() {
            let err = StepError::MissingPlan {
                path: exec.plan_file.clone(),
            };
            steps.push(error_result(step, stage, String::new(), &err.to_string()));
            return Flow::Stop(ProjectOutcome::Error {
                message: err.to_string(),
            });
        }

        let show_args = vec![
            "show".to_string(),
            "-json".to_string(),
            exec.plan_file.to_string_lossy().to_string(),
        ];
        let tf = self.settings.terraform_bin.clone();
        let (show, output) = self.invoke(exec, stage, step, &tf, show_args, env).await;
        let Some(output) = output.filter(|o| o.success()) else {
            let flow = self.flow_for(&show);
            steps.push(show);
            return flow;
        };

        let json_path = PathBuf::from(format!("{}.json", exec.plan_file.to_string_lossy()));
        if let Err(e) = std::fs::write(&json_path, output.stdout.as_bytes()) {
            let message = format!("writing {}: {}", json_path.display(), e);
            steps.push(error_result(step, stage, show.command, &message));
            return Flow::Stop(ProjectOutcome::Error { message });
        }

        let mut argv = vec!["test".to_string()];
        argv.extend(extra_args.iter().cloned());
        argv.push(json_path.to_string_lossy().to_string());
        let policy_bin = self.settings.policy_bin.clone();
        let (result, _) = self.invoke(exec, stage, step, &policy_bin, argv, env).await;

        let verdict = match result.status {
            StepStatus::Succeeded => Some(PolicyStatus::Passed),
            StepStatus::Failed => Some(PolicyStatus::Failed),
            _ => None,
        };
        let flow = self.flow_for(&result);
        steps.push(result);

        if let Some(status) = verdict {
            let ctx = exec.ctx;
            if let Err(e) = self
                .locker
                .record_policy(&ctx.identity, ctx.pull.num, status)
                .await
            {
                return Flow::Stop(ProjectOutcome::Error {
                    message: e.to_string(),
                });
            }
        }
        flow
    }
}

fn error_result(step: &Step, stage: Stage, command: String, message: &str) -> StepResult {
    StepResult {
        step: step.name().to_string(),
        stage,
        command,
        status: StepStatus::Error,
        exit_code: None,
        stdout: String::new(),
        stderr: redact(message),
        duration_ms: 0,
    }
}

pub(crate) fn remove_plan(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed plan file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove plan file"),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::process::fixtures::script;
    use std::path::{Path, PathBuf};

    /// A fake terraform that records its arguments to `calls.log`, writes the
    /// `-out` plan file, and fails when `FAIL_<subcommand>` is set.
    pub fn fake_terraform(dir: &Path) -> PathBuf {
        script(
            dir,
            "terraform",
            r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
cmd="$1"
fail_var="FAIL_$cmd"
eval "fail=\${$fail_var:-}"
if [ -n "$fail" ]; then
  echo "terraform $cmd failed" >&2
  exit 1
fi
if [ "$cmd" = "plan" ]; then
  out=""
  prev=""
  for a in "$@"; do
    if [ "$prev" = "-out" ]; then out="$a"; fi
    prev="$a"
  done
  [ -n "$out" ] && echo "plan for $WORKSPACE" > "$out"
  if [ -n "${SLOW_PLAN:-}" ]; then sleep "$SLOW_PLAN"; fi
  echo "Plan: 1 to add, 0 to change, 0 to destroy."
elif [ "$cmd" = "show" ]; then
  echo '{"resource_changes": []}'
else
  echo "terraform $cmd ok"
fi
"#,
        )
    }

    /// A fake policy tool that fails when `POLICY_FAIL` is set.
    pub fn fake_conftest(dir: &Path) -> PathBuf {
        script(
            dir,
            "conftest",
            r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
if [ -n "${POLICY_FAIL:-}" ]; then
  echo "FAIL - deny public buckets"
  exit 1
fi
echo "1 test, 1 passed"
"#,
        )
    }

    pub fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::builder::context::fixtures::context;
    use crate::locking::SqliteLockStore;
    use crate::repo_config::{RunStep, StepArgs, Workflow};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        bin: TempDir,
        checkout: TempDir,
        locker: ProjectLocker,
        runner: StepRunner,
    }

    fn harness(configure: impl FnOnce(&mut RunnerSettings)) -> Harness {
        let bin = tempdir().unwrap();
        let tf = fake_terraform(bin.path());
        let conftest = fake_conftest(bin.path());
        let checkout = tempdir().unwrap();
        std::fs::create_dir_all(checkout.path().join("prod")).unwrap();

        let locker = ProjectLocker::new(Arc::new(SqliteLockStore::open_in_memory().unwrap()));
        let mut settings = RunnerSettings {
            terraform_bin: tf.to_string_lossy().to_string(),
            policy_bin: conftest.to_string_lossy().to_string(),
            step_timeout: Duration::from_secs(30),
            ..RunnerSettings::default()
        };
        configure(&mut settings);
        let runner = StepRunner::new(locker.clone(), settings);
        Harness {
            bin,
            checkout,
            locker,
            runner,
        }
    }

    fn plan_ctx(pull: u64) -> ProjectContext {
        let mut ctx = context("prod", "default", None);
        ctx.pull.num = pull;
        ctx
    }

    fn apply_ctx(pull: u64) -> ProjectContext {
        let mut ctx = plan_ctx(pull);
        ctx.command = CommandName::Apply;
        ctx
    }

    async fn run(h: &Harness, ctx: &ProjectContext) -> ProjectResult {
        h.runner
            .run(ctx, h.checkout.path(), "abc123", &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_plan_acquires_lock_and_records_plan() {
        let h = harness(|_| {});
        let result = run(&h, &plan_ctx(1)).await;

        assert_eq!(result.outcome, ProjectOutcome::Success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].step, "init");
        assert!(result.steps[1].stdout.contains("Plan: 1 to add"));

        let plan_file = h.checkout.path().join("prod/default.tfplan");
        assert!(plan_file.exists());
        assert_eq!(result.plan_file.as_deref(), Some(plan_file.as_path()));

        let lock = h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().unwrap();
        assert_eq!(lock.pull_num, 1);
        let plan = lock.plan.unwrap();
        assert_eq!(plan.path, plan_file);
        assert_eq!(plan.head_commit.as_deref(), Some("abc123"));

        let plan_call = calls(h.bin.path())
            .into_iter()
            .find(|c| c.starts_with("plan"))
            .unwrap();
        assert!(plan_call.split(' ').any(|a| a == "-refresh=true"), "{plan_call}");
    }

    #[tokio::test]
    async fn test_plan_failure_short_circuits() {
        let h = harness(|s| {
            s.env.insert("FAIL_plan".to_string(), "1".to_string());
        });
        let mut ctx = plan_ctx(1);
        let mut wf = Workflow::builtin_default();
        wf.plan.push(Step::Apply(StepArgs::default()));
        ctx.workflow = Arc::new(wf);

        let result = run(&h, &ctx).await;
        assert_eq!(
            result.outcome,
            ProjectOutcome::StepFailed {
                step: "plan".to_string(),
                exit_code: Some(1)
            }
        );
        let names: Vec<&str> = result.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(names, vec!["init", "plan"]);
        assert!(result.steps[1].stderr.contains("terraform plan failed"));
        assert!(calls(h.bin.path()).iter().all(|c| !c.starts_with("apply")));
        assert!(h.locker.get_lock(&ctx.identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plan_held_by_other_pull_is_discarded() {
        let h = harness(|_| {});
        assert_eq!(run(&h, &plan_ctx(1)).await.outcome, ProjectOutcome::Success);

        let second = run(&h, &plan_ctx(2)).await;
        assert_eq!(second.outcome, ProjectOutcome::Discarded { locked_by_pull: 1 });
        assert!(second.step("plan").unwrap().succeeded());
        assert!(!second.outcome.is_failure());

        let lock = h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().unwrap();
        assert_eq!(lock.pull_num, 1);
    }

    #[tokio::test]
    async fn test_apply_without_lock_never_invokes_terraform() {
        let h = harness(|_| {});
        let result = run(&h, &apply_ctx(1)).await;
        assert!(matches!(
            result.outcome,
            ProjectOutcome::LockConflict {
                locked_by_pull: None,
                ..
            }
        ));
        assert!(result.steps.is_empty());
        assert!(calls(h.bin.path()).is_empty());
    }

    #[tokio::test]
    async fn test_apply_by_other_pull_is_rejected() {
        let h = harness(|_| {});
        run(&h, &plan_ctx(1)).await;
        let before = calls(h.bin.path()).len();

        let result = run(&h, &apply_ctx(2)).await;
        assert_eq!(
            result.outcome,
            ProjectOutcome::LockConflict {
                message: "acme/infra#prod#default is locked by pull request #1; apply is not allowed"
                    .to_string(),
                locked_by_pull: Some(1),
            }
        );
        assert_eq!(calls(h.bin.path()).len(), before);
    }

    #[tokio::test]
    async fn test_apply_after_plan_releases_lock() {
        let h = harness(|_| {});
        let mut planned = plan_ctx(1);
        planned.comment_args = vec!["-target=x".to_string()];
        run(&h, &planned).await;

        let mut apply = apply_ctx(1);
        apply.comment_args = vec!["-target=x".to_string()];
        let result = run(&h, &apply).await;
        assert_eq!(result.outcome, ProjectOutcome::Success);

        let apply_call = calls(h.bin.path())
            .into_iter()
            .find(|c| c.starts_with("apply"))
            .unwrap();
        assert!(apply_call.contains("-target=x"));
        assert!(apply_call.ends_with("default.tfplan"));

        assert!(h.locker.get_lock(&apply.identity).await.unwrap().is_none());
        assert!(!h.checkout.path().join("prod/default.tfplan").exists());
        assert!(result.plan_file.is_none());
    }

    #[tokio::test]
    async fn test_named_projects_sharing_a_lock_apply_their_own_plan() {
        let h = harness(|_| {});
        let named = |name: &str, command: CommandName| {
            let mut ctx = context("prod", "default", Some(name));
            ctx.command = command;
            ctx
        };
        let plan_a = h.checkout.path().join("prod/a-default.tfplan");
        let plan_b = h.checkout.path().join("prod/b-default.tfplan");

        assert_eq!(run(&h, &named("a", CommandName::Plan)).await.outcome, ProjectOutcome::Success);
        assert_eq!(run(&h, &named("b", CommandName::Plan)).await.outcome, ProjectOutcome::Success);
        let lock = h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().unwrap();
        assert_eq!(lock.plan.unwrap().path, plan_b);

        let applied = run(&h, &named("a", CommandName::Apply)).await;
        assert_eq!(applied.outcome, ProjectOutcome::Success);
        let apply_calls: Vec<String> = calls(h.bin.path())
            .into_iter()
            .filter(|c| c.starts_with("apply"))
            .collect();
        assert_eq!(apply_calls.len(), 1);
        assert!(apply_calls[0].ends_with(&*plan_a.to_string_lossy()));
        assert!(!plan_a.exists());
        assert!(plan_b.exists());
    }

    #[tokio::test]
    async fn test_apply_without_own_plan_ignores_lock_plan_ref() {
        let h = harness(|_| {});
        let named = |name: &str, command: CommandName| {
            let mut ctx = context("prod", "default", Some(name));
            ctx.command = command;
            ctx
        };
        run(&h, &named("b", CommandName::Plan)).await;

        let result = run(&h, &named("a", CommandName::Apply)).await;
        assert!(matches!(result.outcome, ProjectOutcome::Error { .. }), "{:?}", result.outcome);
        assert!(calls(h.bin.path()).iter().all(|c| !c.starts_with("apply")));
        assert!(h.checkout.path().join("prod/b-default.tfplan").exists());
        assert!(h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_lock() {
        let h = harness(|s| {
            s.env.insert("FAIL_apply".to_string(), "1".to_string());
        });
        run(&h, &plan_ctx(1)).await;
        let result = run(&h, &apply_ctx(1)).await;
        assert!(matches!(result.outcome, ProjectOutcome::StepFailed { .. }));
        assert!(h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_outcome() {
        let h = harness(|s| {
            s.step_timeout = Duration::from_millis(300);
        });
        let mut ctx = plan_ctx(1);
        let mut wf = Workflow::builtin_default();
        wf.plan = vec![
            Step::Run(RunStep {
                command: "exec sleep 30".to_string(),
                env: BTreeMap::new(),
            }),
            Step::Plan(StepArgs::default()),
        ];
        ctx.workflow = Arc::new(wf);

        let result = run(&h, &ctx).await;
        assert_eq!(
            result.outcome,
            ProjectOutcome::TimedOut {
                step: "run".to_string(),
                after_secs: 0
            }
        );
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_run_step_sees_project_env() {
        let h = harness(|s| {
            s.env.insert("SERVER_VAR".to_string(), "server".to_string());
        });
        let mut ctx = context("prod", "staging", Some("core"));
        let mut step_env = BTreeMap::new();
        step_env.insert("SERVER_VAR".to_string(), "step".to_string());
        let mut wf = Workflow::builtin_default();
        wf.plan = vec![Step::Run(RunStep {
            command: "echo $DIR $WORKSPACE $PROJECT_NAME $TF_WORKSPACE $SERVER_VAR $PULL_NUM; pwd".to_string(),
            env: step_env,
        })];
        ctx.workflow = Arc::new(wf);

        let result = run(&h, &ctx).await;
        assert_eq!(result.outcome, ProjectOutcome::Success);
        let out = &result.steps[0].stdout;
        assert!(out.starts_with("prod staging core staging step 1"));
        assert!(out.trim_end().ends_with("prod"));
    }

    #[tokio::test]
    async fn test_missing_project_dir_is_error() {
        let h = harness(|_| {});
        let ctx = context("does-not-exist", "default", None);
        let result = run(&h, &ctx).await;
        assert!(matches!(result.outcome, ProjectOutcome::Error { .. }));
        assert!(calls(h.bin.path()).is_empty());
    }

    #[tokio::test]
    async fn test_policy_failure_blocks_apply_until_approved() {
        let h = harness(|s| {
            s.policy_checks = true;
            s.env.insert("POLICY_FAIL".to_string(), "1".to_string());
        });
        let plan = run(&h, &plan_ctx(1)).await;
        assert_eq!(
            plan.outcome,
            ProjectOutcome::StepFailed {
                step: "policy_check".to_string(),
                exit_code: Some(1)
            }
        );
        assert!(h.checkout.path().join("prod/default.tfplan.json").exists());
        let lock = h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().unwrap();
        assert_eq!(lock.policy, PolicyStatus::Failed);

        let blocked = run(&h, &apply_ctx(1)).await;
        assert!(matches!(blocked.outcome, ProjectOutcome::PoliciesFailed { .. }));
        assert!(calls(h.bin.path()).iter().all(|c| !c.starts_with("apply")));

        h.locker
            .approve_policies(&plan_ctx(1).identity, 1)
            .await
            .unwrap();
        let applied = run(&h, &apply_ctx(1)).await;
        assert_eq!(applied.outcome, ProjectOutcome::Success);
    }

    #[tokio::test]
    async fn test_policy_pass_is_recorded() {
        let h = harness(|s| s.policy_checks = true);
        let plan = run(&h, &plan_ctx(1)).await;
        assert_eq!(plan.outcome, ProjectOutcome::Success);
        assert_eq!(plan.steps.len(), 3);
        let lock = h.locker.get_lock(&plan_ctx(1).identity).await.unwrap().unwrap();
        assert_eq!(lock.policy, PolicyStatus::Passed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(|_| {});
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = h
            .runner
            .run(&plan_ctx(1), h.checkout.path(), "abc", &cancel)
            .await;
        assert_eq!(
            result.outcome,
            ProjectOutcome::Cancelled {
                step: Some("init".to_string())
            }
        );
        assert!(result.steps.is_empty());
    }
}
