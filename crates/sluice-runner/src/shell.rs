//! Shell-based task execution on the host.

use crate::handler::{TaskContext, TaskError, TaskHandler, TaskOutput};
use async_trait::async_trait;
use sluice_core::pipeline::TaskKind;
use sluice_core::run::LogLevel;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shell handler for executing commands on the host.
///
/// The last line written to stdout becomes the task output, parsed as JSON
/// when possible.
pub struct ShellHandler {
    workspace: PathBuf,
}

impl ShellHandler {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl Default for ShellHandler {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

enum Stream {
    Stdout,
    Stderr,
}

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let (command, env, working_dir) = match &ctx.task.run {
            TaskKind::Shell {
                command,
                env,
                working_dir,
            } => (command, env, working_dir),
            other => {
                return Err(TaskError::failed(format!(
                    "shell handler cannot run {} tasks",
                    other.handler_name()
                )));
            }
        };
        ctx.checkpoint()?;

        let cwd = working_dir
            .as_ref()
            .map(|dir| self.workspace.join(dir))
            .unwrap_or_else(|| self.workspace.clone());
        let params = serde_json::to_string(&ctx.params)
            .map_err(|e| TaskError::failed(e.to_string()))?;
        let upstream = serde_json::to_string(&ctx.upstream)
            .map_err(|e| TaskError::failed(e.to_string()))?;

        info!(run_id = %ctx.run_id, task = %ctx.task.name, command = %command, "Executing shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(env)
            .env("SLUICE_RUN_ID", ctx.run_id.to_string())
            .env("SLUICE_PIPELINE_ID", ctx.pipeline_id.as_str())
            .env("SLUICE_TASK", &ctx.task.name)
            .env("SLUICE_ATTEMPT", ctx.attempt.to_string())
            .env("SLUICE_PARAMS", params)
            .env("SLUICE_UPSTREAM", upstream)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::failed(format!("Failed to spawn process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::failed("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::failed("stderr not captured"))?;

        let (line_tx, mut line_rx) = mpsc::channel::<(Stream, String)>(256);

        let stdout_tx = line_tx.clone();
        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send((Stream::Stdout, line)).await.is_err() {
                    break;
                }
            }
        });

        let stderr_tx = line_tx;
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send((Stream::Stderr, line)).await.is_err() {
                    break;
                }
            }
        });

        let mut last_stdout: Option<String> = None;
        let forward = async {
            while let Some((stream, line)) = line_rx.recv().await {
                match stream {
                    Stream::Stdout => {
                        ctx.info(line.clone()).await;
                        last_stdout = Some(line);
                    }
                    Stream::Stderr => ctx.log(LogLevel::Warn, line).await,
                }
            }
        };

        let wait = async {
            let (status, _) = tokio::join!(child.wait(), forward);
            status
        };

        let status = tokio::select! {
            status = wait => status,
            _ = ctx.cancellation().cancelled() => {
                warn!(run_id = %ctx.run_id, task = %ctx.task.name, "Cancellation requested, killing process");
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(TaskError::Cancelled);
            }
        };

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let status =
            status.map_err(|e| TaskError::failed(format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);
        debug!(run_id = %ctx.run_id, task = %ctx.task.name, exit_code, "Command completed");

        if !status.success() {
            return Err(TaskError::failed(format!(
                "command exited with code {}",
                exit_code
            )));
        }

        Ok(match last_stdout {
            Some(line) => TaskOutput::value(
                serde_json::from_str(&line).unwrap_or(serde_json::Value::String(line)),
            ),
            None => TaskOutput::empty(),
        })
    }
}
