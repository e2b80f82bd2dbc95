//! Core handler trait and types.

use async_trait::async_trait;
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::ids::{PipelineId, RunId};
use sluice_core::pipeline::{Params, TaskDefinition};
use sluice_core::run::{LogLevel, LogLine};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why a task attempt did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("task timed out after {0}s")]
    TimedOut(u64),

    #[error("no handler registered for task kind: {0}")]
    UnknownKind(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Result of a successful task attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub value: Option<serde_json::Value>,
}

impl TaskOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

/// Everything a handler can see while executing one task attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub task: TaskDefinition,
    pub attempt: u32,
    /// Merged run parameters.
    pub params: Params,
    /// Outputs of the task's direct upstream dependencies, by task name.
    pub upstream: BTreeMap<String, serde_json::Value>,
    cancel: CancellationToken,
    logs: mpsc::Sender<LogLine>,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        pipeline_id: PipelineId,
        task: TaskDefinition,
        attempt: u32,
        params: Params,
        upstream: BTreeMap<String, serde_json::Value>,
        cancel: CancellationToken,
        logs: mpsc::Sender<LogLine>,
    ) -> Self {
        Self {
            run_id,
            pipeline_id,
            task,
            attempt,
            params,
            upstream,
            cancel,
            logs,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp log lines from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token signalled when the run is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a log line for this task. Dropped silently once the run stops listening.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine {
            timestamp: self.clock.now(),
            level,
            message: message.into(),
        };
        let _ = self.logs.send(line).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }
}

/// Executes one kind of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;
}
