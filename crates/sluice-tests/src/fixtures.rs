//! Test fixtures for creating sample data.

use chrono::{DateTime, Utc};
use sluice_core::ids::PipelineId;
use sluice_core::pipeline::{
    CatchUp, OverlapPolicy, Params, Pipeline, PipelineDefinition, Schedule, TaskDefinition,
    TaskKind, TriggerDefinition,
};
use sluice_core::run::{Run, RunStatus, RunTrigger, TaskStatus};

/// Factory for pipeline definitions.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One no-op task and a manual trigger.
    pub fn simple(id: &str) -> PipelineDefinition {
        PipelineDefinition {
            id: PipelineId::new(id),
            name: Some(format!("{id} pipeline")),
            description: Some("A simple test pipeline".to_string()),
            tasks: vec![Self::task("only", TaskKind::Noop, &[])],
            triggers: vec![Self::manual_trigger()],
            params: Params::new(),
            overlap: OverlapPolicy::default(),
            max_concurrent_tasks: None,
        }
    }

    /// extract -> transform -> load.
    pub fn chain(id: &str) -> PipelineDefinition {
        let mut definition = Self::simple(id);
        definition.tasks = vec![
            Self::task("extract", TaskKind::Noop, &[]),
            Self::task("transform", TaskKind::Sleep { millis: 20 }, &["extract"]),
            Self::task("load", TaskKind::Noop, &["transform"]),
        ];
        definition
    }

    /// A single task sleeping for `millis`.
    pub fn slow(id: &str, millis: u64) -> PipelineDefinition {
        let mut definition = Self::simple(id);
        definition.tasks = vec![Self::task("wait", TaskKind::Sleep { millis }, &[])];
        definition
    }

    /// A shell task that exits non-zero, with one dependent.
    pub fn failing(id: &str) -> PipelineDefinition {
        let mut definition = Self::simple(id);
        definition.tasks = vec![
            Self::task(
                "check",
                TaskKind::Shell {
                    command: "echo checking; exit 3".to_string(),
                    env: Default::default(),
                    working_dir: None,
                },
                &[],
            ),
            Self::task("publish", TaskKind::Noop, &["check"]),
        ];
        definition
    }

    /// Adds an interval trigger firing every `every_secs`, starting at `start_at`.
    pub fn with_interval(
        mut definition: PipelineDefinition,
        every_secs: u64,
        start_at: Option<DateTime<Utc>>,
    ) -> PipelineDefinition {
        definition.triggers.push(TriggerDefinition {
            name: "every".to_string(),
            description: None,
            schedule: Schedule::Interval {
                every_secs,
                catch_up: CatchUp::Skip,
                start_at,
            },
            params: Params::new(),
            paused: false,
        });
        definition
    }

    /// A cyclic definition the registry must refuse.
    pub fn cyclic(id: &str) -> PipelineDefinition {
        let mut definition = Self::simple(id);
        definition.tasks = vec![
            Self::task("a", TaskKind::Noop, &["b"]),
            Self::task("b", TaskKind::Noop, &["a"]),
        ];
        definition
    }

    /// Wrap a definition as a freshly registered pipeline.
    pub fn registered(definition: PipelineDefinition) -> Pipeline {
        let now = Utc::now();
        Pipeline {
            definition,
            version: 1,
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn task(name: &str, run: TaskKind, depends_on: &[&str]) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            description: None,
            run,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            retry: None,
            timeout_secs: None,
        }
    }

    fn manual_trigger() -> TriggerDefinition {
        TriggerDefinition {
            name: "on-demand".to_string(),
            description: None,
            schedule: Schedule::Manual,
            params: Params::new(),
            paused: false,
        }
    }
}

/// Factory for run records written straight to a store.
pub struct RunFixture;

impl RunFixture {
    pub fn pending(pipeline: &Pipeline) -> Run {
        Run::new(
            pipeline,
            RunTrigger::Manual {
                requested_by: Some("fixture".to_string()),
            },
            Params::new(),
            Utc::now(),
        )
    }

    /// A run with its first task mid-flight.
    pub fn running(pipeline: &Pipeline) -> Run {
        let mut run = Self::pending(pipeline);
        let now = Utc::now();
        run.transition(RunStatus::Running, now)
            .expect("pending run can start");
        if let Some(task) = run.tasks.first_mut() {
            task.start(now);
        }
        run
    }

    /// A run where every task succeeded.
    pub fn succeeded(pipeline: &Pipeline) -> Run {
        let mut run = Self::pending(pipeline);
        let now = Utc::now();
        run.transition(RunStatus::Running, now)
            .expect("pending run can start");
        for task in &mut run.tasks {
            task.start(now);
            task.finish(TaskStatus::Succeeded, now);
        }
        run.transition(RunStatus::Succeeded, now)
            .expect("running run can finish");
        run
    }
}
