//! State transition events streamed to observers.

use crate::error::Error;
use crate::ids::*;
use crate::run::{LogLine, RunStatus, RunTrigger, TaskStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in the Sluice system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),

    // Task lifecycle
    TaskStarted(TaskStartedPayload),
    TaskCompleted(TaskCompletedPayload),
    TaskLog(TaskLogPayload),

    // Scheduling
    TriggerFired(TriggerFiredPayload),
}

impl Event {
    /// Dotted subject for routing and display.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.{}.{}.queued", p.pipeline_id, p.run_id),
            Event::RunStarted(p) => format!("run.{}.{}.started", p.pipeline_id, p.run_id),
            Event::RunCompleted(p) => format!("run.{}.{}.completed", p.pipeline_id, p.run_id),
            Event::TaskStarted(p) => format!("run.{}.{}.task.{}.started", p.pipeline_id, p.run_id, p.task),
            Event::TaskCompleted(p) => {
                format!("run.{}.{}.task.{}.completed", p.pipeline_id, p.run_id, p.task)
            }
            Event::TaskLog(p) => format!("run.{}.{}.task.{}.log", p.pipeline_id, p.run_id, p.task),
            Event::TriggerFired(p) => format!("trigger.{}.fired", p.trigger_id),
        }
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        match self {
            Event::RunQueued(p) => &p.pipeline_id,
            Event::RunStarted(p) => &p.pipeline_id,
            Event::RunCompleted(p) => &p.pipeline_id,
            Event::TaskStarted(p) => &p.pipeline_id,
            Event::TaskCompleted(p) => &p.pipeline_id,
            Event::TaskLog(p) => &p.pipeline_id,
            Event::TriggerFired(p) => &p.pipeline_id,
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Event::RunQueued(p) => Some(p.run_id),
            Event::RunStarted(p) => Some(p.run_id),
            Event::RunCompleted(p) => Some(p.run_id),
            Event::TaskStarted(p) => Some(p.run_id),
            Event::TaskCompleted(p) => Some(p.run_id),
            Event::TaskLog(p) => Some(p.run_id),
            Event::TriggerFired(_) => None,
        }
    }
}

// === Run Payloads ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub pipeline_version: u32,
    pub trigger: RunTrigger,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub task_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub tasks_succeeded: u32,
    pub tasks_failed: u32,
    pub tasks_skipped: u32,
    pub reason: Option<String>,
    pub completed_at: DateTime<Utc>,
}

// === Task Payloads ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskStartedPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub task: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskCompletedPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub task: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskLogPayload {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub task: String,
    pub line: LogLine,
}

// === Trigger Payloads ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerFiredPayload {
    pub trigger_id: TriggerId,
    pub pipeline_id: PipelineId,
    pub scheduled_for: DateTime<Utc>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub fired_at: DateTime<Utc>,
}

/// Which events a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionScope {
    #[default]
    All,
    Pipeline(PipelineId),
    Run(RunId),
}

impl SubscriptionScope {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            SubscriptionScope::All => true,
            SubscriptionScope::Pipeline(id) => event.pipeline_id() == id,
            SubscriptionScope::Run(id) => event.run_id() == Some(*id),
        }
    }
}

impl std::str::FromStr for SubscriptionScope {
    type Err = Error;

    /// Parses `all`, `pipeline:<id>` or `run:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "all" {
            return Ok(SubscriptionScope::All);
        }
        if let Some(id) = s.strip_prefix("pipeline:") {
            return Ok(SubscriptionScope::Pipeline(PipelineId::new(id)));
        }
        if let Some(id) = s.strip_prefix("run:") {
            let run_id = id
                .parse()
                .map_err(|_| Error::Serialization(format!("invalid run id: {}", id)))?;
            return Ok(SubscriptionScope::Run(run_id));
        }
        Err(Error::Serialization(format!("invalid subscription scope: {}", s)))
    }
}

impl std::fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionScope::All => write!(f, "all"),
            SubscriptionScope::Pipeline(id) => write!(f, "pipeline:{}", id),
            SubscriptionScope::Run(id) => write!(f, "run:{}", id),
        }
    }
}
