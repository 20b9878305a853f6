//! Agent worker subprocesses.
//!
//! Contract with a worker: the task text arrives on stdin, the declared
//! output paths arrive in `CONDUCTOR_OUTPUTS` (newline separated), and exit
//! code 0 means the outputs were written. Stdout and stderr go to per-attempt
//! log files under the run's `logs/` directory.

use crate::errors::StepError;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One worker launch.
pub struct WorkerRequest<'a> {
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub attempt: u32,
    pub agent: &'a str,
    pub task: &'a str,
    pub outputs: &'a [PathBuf],
    pub run_dir: &'a Path,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

impl WorkerRequest<'_> {
    fn log_path(&self, suffix: &str) -> PathBuf {
        self.run_dir.join("logs").join(format!(
            "step-{}-attempt-{}-{}",
            self.step_id, self.attempt, suffix
        ))
    }
}

enum Finished {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    command: String,
    args: Vec<String>,
    grace: Duration,
}

impl WorkerLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>, grace: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            grace,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run a worker to completion, timeout or cancellation.
    pub async fn launch(&self, request: WorkerRequest<'_>) -> Result<(), StepError> {
        let task_path = request.log_path("task.md");
        crate::util::write_atomic(&task_path, request.task.as_bytes())
            .with_context(|| format!("Failed to write task file {}", task_path.display()))?;
        for output in request.outputs {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let stdout_path = request.log_path("stdout.log");
        let stderr_path = request.log_path("stderr.log");
        let stdout = std::fs::File::create(&stdout_path)
            .with_context(|| format!("Failed to create {}", stdout_path.display()))?;
        let stderr = std::fs::File::create(&stderr_path)
            .with_context(|| format!("Failed to create {}", stderr_path.display()))?;

        let outputs = request
            .outputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>();

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(request.run_dir)
            .env("CONDUCTOR_RUN_ID", request.run_id)
            .env("CONDUCTOR_STEP_ID", request.step_id)
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string())
            .env("CONDUCTOR_AGENT", request.agent)
            .env("CONDUCTOR_TASK_FILE", &task_path)
            .env("CONDUCTOR_OUTPUT", outputs.first().cloned().unwrap_or_default())
            .env("CONDUCTOR_OUTPUTS", outputs.join("\n"))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::Process {
                exit_code: None,
                stderr: format!("failed to spawn '{}': {}", self.command, e),
            })?;

        info!(
            run_id = request.run_id,
            step_id = request.step_id,
            attempt = request.attempt,
            pid = child.id(),
            "Worker started"
        );

        // The write runs beside the wait: a worker that never reads stdin
        // must not hold off the timeout or cancellation.
        if let Some(mut stdin) = child.stdin.take() {
            let task = request.task.to_owned();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(task.as_bytes()).await {
                    debug!(error = %e, "Worker closed stdin early");
                }
            });
        }

        let finished = tokio::select! {
            status = child.wait() => Finished::Exited(
                status.context("Failed to wait for worker")?,
            ),
            _ = tokio::time::sleep(request.timeout) => Finished::TimedOut,
            _ = request.cancel.cancelled() => Finished::Cancelled,
        };

        match finished {
            Finished::Exited(status) if status.success() => {
                debug!(step_id = request.step_id, "Worker exited cleanly");
                Ok(())
            }
            Finished::Exited(status) => {
                let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
                Err(StepError::Process {
                    exit_code: status.code(),
                    stderr: crate::util::tail(stderr.trim(), 2000),
                })
            }
            Finished::TimedOut => {
                warn!(
                    step_id = request.step_id,
                    timeout_secs = request.timeout.as_secs(),
                    "Worker timed out"
                );
                self.terminate(&mut child).await;
                Err(StepError::Timeout {
                    after: request.timeout,
                })
            }
            Finished::Cancelled => {
                info!(step_id = request.step_id, "Worker cancelled");
                self.terminate(&mut child).await;
                Err(StepError::Cancelled)
            }
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: signalling a child we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            debug!(pid, "Worker ignored SIGTERM; killing");
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Failed to kill worker");
        }
    }
}
