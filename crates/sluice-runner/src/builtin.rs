//! Built-in handlers that need no host access.

use crate::handler::{TaskContext, TaskError, TaskHandler, TaskOutput};
use async_trait::async_trait;
use sluice_core::pipeline::TaskKind;
use std::time::Duration;

/// Succeeds immediately, passing through the upstream outputs.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;
        if ctx.upstream.is_empty() {
            return Ok(TaskOutput::empty());
        }
        let upstream = serde_json::to_value(&ctx.upstream)
            .map_err(|e| TaskError::failed(e.to_string()))?;
        Ok(TaskOutput::value(upstream))
    }
}

/// Sleeps for the configured duration, waking early on cancellation.
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let millis = match &ctx.task.run {
            TaskKind::Sleep { millis } => *millis,
            other => {
                return Err(TaskError::failed(format!(
                    "sleep handler cannot run {} tasks",
                    other.handler_name()
                )));
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(TaskOutput::empty()),
            _ = ctx.cancellation().cancelled() => Err(TaskError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::ids::{PipelineId, RunId};
    use sluice_core::pipeline::{Params, TaskDefinition};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn ctx(run: TaskKind, cancel: CancellationToken) -> TaskContext {
        let (tx, _rx) = mpsc::channel(8);
        TaskContext::new(
            RunId::new(),
            PipelineId::new("p"),
            TaskDefinition {
                name: "t".to_string(),
                description: None,
                run,
                depends_on: vec![],
                retry: None,
                timeout_secs: None,
            },
            1,
            Params::new(),
            BTreeMap::new(),
            cancel,
            tx,
        )
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        let ctx = ctx(TaskKind::Sleep { millis: 60_000 }, cancel.clone());

        let handle = tokio::spawn(async move { SleepHandler.execute(&ctx).await });
        cancel.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn test_noop_passes_upstream() {
        let mut ctx = ctx(TaskKind::Noop, CancellationToken::new());
        ctx.upstream.insert("extract".to_string(), serde_json::json!(42));

        let output = NoopHandler.execute(&ctx).await.unwrap();
        assert_eq!(output.value, Some(serde_json::json!({ "extract": 42 })));
    }
}
