//! External process supervision.
//!
//! Every invocation gets an explicit working directory and environment map;
//! the server's own cwd and env are never touched. Output is drained
//! concurrently so a chatty process cannot deadlock on a full pipe.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::StepError;

/// How long to keep reading output after the process itself is gone.
/// Background children that inherited the pipes can otherwise hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Exited(0)
    }
}

/// One invocation: program, arguments, cwd and the full environment additions.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

impl Invocation<'_> {
    /// Shell-ish rendering for logs and results.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string()];
        parts.extend(self.args.iter().map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

fn drain<R>(reader: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read process output");
                    break;
                }
                Ok(n) => {
                    if let Ok(mut b) = buf.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    buf.lock()
        .map(|b| String::from_utf8_lossy(&b).to_string())
        .unwrap_or_default()
}

async fn finish_drain(handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
        abort.abort();
    }
}

/// Kill the child's whole process group, then the child itself. Each
/// invocation leads its own group, so shells and their descendants go too.
async fn kill_tree(child: &mut Child, program: &str) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let group = Pid::from_raw(pid as i32);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(program, pid, error = %e, "Failed to kill process group"),
        }
    }
    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "Failed to kill process");
    }
}

/// Run the invocation to completion, killing it and everything it spawned
/// on timeout or cancellation.
pub async fn run(
    invocation: &Invocation<'_>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, StepError> {
    let started = Instant::now();
    let mut child = Command::new(invocation.program)
        .args(&invocation.args)
        .current_dir(invocation.cwd)
        .envs(invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
        .map_err(|source| StepError::Spawn {
            program: invocation.program.to_string(),
            source,
        })?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = drain(child.stdout.take(), stdout_buf.clone());
    let stderr_task = drain(child.stderr.take(), stderr_buf.clone());

    let status = tokio::select! {
        res = child.wait() => {
            let status = res.map_err(|source| StepError::Wait {
                program: invocation.program.to_string(),
                source,
            })?;
            ProcessStatus::Exited(status.code().unwrap_or(-1))
        }
        _ = tokio::time::sleep(timeout) => ProcessStatus::TimedOut,
        _ = cancel.cancelled() => ProcessStatus::Cancelled,
    };

    if !matches!(status, ProcessStatus::Exited(_)) {
        kill_tree(&mut child, invocation.program).await;
    }

    finish_drain(stdout_task).await;
    finish_drain(stderr_task).await;

    let output = ProcessOutput {
        status,
        stdout: take(&stdout_buf),
        stderr: take(&stderr_buf),
        duration: started.elapsed(),
    };
    debug!(
        program = invocation.program,
        status = ?output.status,
        elapsed_ms = output.duration.as_millis() as u64,
        "Process finished"
    );
    Ok(output)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable shell script.
    pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::script;
    use super::*;
    use tempfile::tempdir;

    fn invocation<'a>(
        program: &'a str,
        args: &[&str],
        cwd: &'a Path,
        env: &'a BTreeMap<String, String>,
    ) -> Invocation<'a> {
        Invocation {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd,
            env,
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let env = BTreeMap::new();
        let out = run(
            &invocation("sh", &["-c", "echo out; echo err >&2; exit 3"], dir.path(), &env),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.status, ProcessStatus::Exited(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_explicit_cwd_and_env() {
        let dir = tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("TERRAPIN_TEST_VAR".to_string(), "hello".to_string());
        let out = run(
            &invocation("sh", &["-c", "pwd; echo $TERRAPIN_TEST_VAR"], dir.path(), &env),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.success());
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.contains(&*canonical.to_string_lossy()));
        assert!(out.stdout.contains("hello"));
        assert!(std::env::var("TERRAPIN_TEST_VAR").is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempdir().unwrap();
        let slow = script(dir.path(), "slow.sh", "#!/bin/sh\necho started\nexec sleep 30\n");
        let env = BTreeMap::new();
        let started = Instant::now();
        let out = run(
            &Invocation {
                program: &slow.to_string_lossy(),
                args: Vec::new(),
                cwd: dir.path(),
                env: &env,
            },
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.status, ProcessStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(out.stdout.contains("started"));
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let env = BTreeMap::new();
        let body = format!(
            "sh -c 'sleep 1; touch {}'; echo after",
            marker.to_string_lossy()
        );
        let out = run(
            &invocation("sh", &["-c", &body], dir.path(), &env),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.status, ProcessStatus::TimedOut);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "grandchild outlived the timeout");
        assert!(!out.stdout.contains("after"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_background_children() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let env = BTreeMap::new();
        let body = format!(
            "(sleep 1; touch {}) & wait",
            marker.to_string_lossy()
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let out = run(
            &invocation("sh", &["-c", &body], dir.path(), &env),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.status, ProcessStatus::Cancelled);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "background child outlived cancellation");
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempdir().unwrap();
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let out = run(
            &invocation("sh", &["-c", "exec sleep 30"], dir.path(), &env),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.status, ProcessStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let env = BTreeMap::new();
        let err = run(
            &invocation("/definitely/not/here", &[], dir.path(), &env),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StepError::Spawn { .. }));
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("pipe broke")))
        }
    }

    #[tokio::test]
    async fn test_read_error_ends_drain_keeping_partial_output() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = (&b"partial output"[..]).chain(BrokenPipe);
        drain(Some(reader), buf.clone()).await.unwrap();
        assert_eq!(take(&buf), "partial output");
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let env = BTreeMap::new();
        let inv = invocation("sh", &["-c", "echo hi"], Path::new("/"), &env);
        assert_eq!(inv.display(), "sh -c 'echo hi'");
    }
}
