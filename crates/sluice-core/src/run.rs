//! Run and execution types.

use crate::error::{Error, Result};
use crate::ids::{PipelineId, RunId, TriggerId};
use crate::pipeline::{Params, Pipeline};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    /// Registry version of the pipeline this run was created from.
    pub pipeline_version: u32,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub params: Params,
    pub tasks: Vec<TaskRun>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Why the run ended the way it did, when not obvious from task outcomes.
    pub reason: Option<String>,
}

impl Run {
    /// Create a pending run whose task set is a snapshot of the pipeline's tasks.
    pub fn new(pipeline: &Pipeline, trigger: RunTrigger, params: Params, now: DateTime<Utc>) -> Self {
        let tasks = pipeline
            .definition
            .tasks
            .iter()
            .map(|task| TaskRun::new(&task.name, task.depends_on.clone()))
            .collect();

        Self {
            id: RunId::new(),
            pipeline_id: pipeline.id().clone(),
            pipeline_version: pipeline.version,
            trigger,
            status: RunStatus::Pending,
            params,
            tasks,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            reason: None,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskRun> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut TaskRun> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Move the run to a new status, stamping timestamps.
    ///
    /// Terminal runs are immutable: any transition out of one is rejected.
    pub fn transition(&mut self, to: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            if self.status.is_terminal() {
                return Err(Error::RunAlreadyCompleted(self.id.to_string()));
            }
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        self.status = to;
        if to == RunStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            let start = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
        Ok(())
    }

    /// Timestamp runs are ordered and windowed by.
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        match (self, to) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed | RunStatus::Cancelled) => true,
            (RunStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::Serialization(format!("unknown run status: {}", other))),
        }
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual {
        #[serde(default)]
        requested_by: Option<String>,
    },
    Schedule {
        trigger_id: TriggerId,
        scheduled_for: DateTime<Utc>,
    },
}

impl RunTrigger {
    pub fn trigger_id(&self) -> Option<&TriggerId> {
        match self {
            RunTrigger::Schedule { trigger_id, .. } => Some(trigger_id),
            RunTrigger::Manual { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskRun {
    pub name: String,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl TaskRun {
    pub fn new(name: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            name: name.into(),
            depends_on,
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            logs: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        if let Some(start) = self.started_at {
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::Serialization(format!("unknown task status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Filter for run history queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub pipeline_id: Option<PipelineId>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

impl RunFilter {
    pub fn for_pipeline(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id: Some(pipeline_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        if let Some(pipeline_id) = &self.pipeline_id
            && &run.pipeline_id != pipeline_id
        {
            return false;
        }
        if let Some(status) = self.status
            && run.status != status
        {
            return false;
        }
        let key = run.sort_key();
        if let Some(since) = self.since
            && key < since
        {
            return false;
        }
        if let Some(until) = self.until
            && key > until
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OverlapPolicy, PipelineDefinition, TaskDefinition, TaskKind};
    use chrono::Duration;

    fn pipeline() -> Pipeline {
        let task = |name: &str, deps: &[&str]| TaskDefinition {
            name: name.to_string(),
            description: None,
            run: TaskKind::Noop,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            retry: None,
            timeout_secs: None,
        };
        Pipeline {
            definition: PipelineDefinition {
                id: PipelineId::new("etl"),
                name: None,
                description: None,
                tasks: vec![task("extract", &[]), task("load", &["extract"])],
                triggers: vec![],
                params: Params::new(),
                overlap: OverlapPolicy::Reject,
                max_concurrent_tasks: None,
            },
            version: 3,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_run_snapshots_tasks() {
        let run = Run::new(
            &pipeline(),
            RunTrigger::Manual { requested_by: None },
            Params::new(),
            Utc::now(),
        );
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.pipeline_version, 3);
        let names: Vec<_> = run.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["extract", "load"]);
        assert_eq!(run.task("load").unwrap().depends_on, vec!["extract"]);
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let now = Utc::now();
        let mut run = Run::new(
            &pipeline(),
            RunTrigger::Manual { requested_by: None },
            Params::new(),
            now,
        );
        run.transition(RunStatus::Running, now).unwrap();
        run.transition(RunStatus::Cancelled, now + Duration::seconds(2))
            .unwrap();
        assert_eq!(run.duration_ms, Some(2000));

        let err = run.transition(RunStatus::Running, now).unwrap_err();
        assert!(matches!(err, Error::RunAlreadyCompleted(_)));
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_pending_cannot_succeed_directly() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn test_filter_window() {
        let now = Utc::now();
        let run = Run::new(
            &pipeline(),
            RunTrigger::Manual { requested_by: None },
            Params::new(),
            now,
        );
        let mut filter = RunFilter::for_pipeline(PipelineId::new("etl"));
        assert!(filter.matches(&run));

        filter.since = Some(now + Duration::seconds(1));
        assert!(!filter.matches(&run));

        let other = RunFilter::for_pipeline(PipelineId::new("other"));
        assert!(!other.matches(&run));

        let failed = RunFilter::default().with_status(RunStatus::Failed);
        assert!(!failed.matches(&run));
    }
}
