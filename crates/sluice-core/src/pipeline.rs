//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline configuration, usually
//! loaded from YAML or posted as JSON to the API.

use crate::ids::{PipelineId, TriggerId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Free-form parameters passed to runs and tasks.
pub type Params = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub id: PipelineId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Default run parameters, overridden by trigger and request params.
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Per-pipeline cap on simultaneously executing tasks.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

impl PipelineDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn trigger(&self, name: &str) -> Option<&TriggerDefinition> {
        self.triggers.iter().find(|t| t.name == name)
    }

    pub fn trigger_id(&self, trigger: &TriggerDefinition) -> TriggerId {
        TriggerId::for_trigger(&self.id, &trigger.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub run: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// What a task executes, dispatched to a handler by [`TaskKind::handler_name`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Shell {
        command: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    Sleep {
        millis: u64,
    },
    Noop,
    /// A handler registered by the embedding application.
    Custom {
        handler: String,
        #[serde(default)]
        params: Params,
    },
}

impl TaskKind {
    pub fn handler_name(&self) -> &str {
        match self {
            TaskKind::Shell { .. } => "shell",
            TaskKind::Sleep { .. } => "sleep",
            TaskKind::Noop => "noop",
            TaskKind::Custom { handler, .. } => handler,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay")]
    pub delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_delay() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// Delay before the given attempt (attempts are 1-based; attempt 1 has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = if self.exponential_backoff {
            2u64.saturating_pow(attempt - 2)
        } else {
            1
        };
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule: Schedule,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression, five fields (minute precision) or six/seven with seconds. UTC.
    Cron { expression: String },
    Interval {
        every_secs: u64,
        #[serde(default)]
        catch_up: CatchUp,
        /// First fire time; defaults to one interval after registration.
        #[serde(default)]
        start_at: Option<DateTime<Utc>>,
    },
    Manual,
}

/// What an interval trigger does after missing one or more slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CatchUp {
    /// Fire once and realign to the interval grid after now.
    #[default]
    Skip,
    /// Fire once and restart the interval from now.
    FireOnce,
}

/// Admission policy when a run is requested while another run of the same
/// pipeline is still active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverlapPolicy {
    #[default]
    Reject,
    Queue {
        #[serde(default = "default_queue_depth")]
        max_depth: usize,
    },
    Allow,
}

fn default_queue_depth() -> usize {
    10
}

/// A registered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub definition: PipelineDefinition,
    pub version: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn id(&self) -> &PipelineId {
        &self.definition.id
    }
}

/// Persisted scheduling state of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerState {
    pub trigger_id: TriggerId,
    pub pipeline_id: PipelineId,
    /// `None` for manual-only or paused triggers.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
}
