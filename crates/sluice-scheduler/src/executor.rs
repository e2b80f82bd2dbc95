//! Run executor: admits runs and drives each one through its task graph.
//!
//! Every change to a run is written to the run store before the matching
//! event is published. If a write fails the run halts where it is; the
//! durable record is never behind what observers were told.

use crate::dag::PipelineDag;
use crate::queue::{Admission, OverlapGate};
use crate::registry::{PipelineRegistry, RegisteredPipeline};
use sluice_core::clock::Clock;
use sluice_core::events::*;
use sluice_core::ids::{PipelineId, RunId};
use sluice_core::pipeline::{Params, TaskDefinition};
use sluice_core::ports::{EventBus, RunStore};
use sluice_core::run::{LogLevel, LogLine, Run, RunFilter, RunStatus, RunTrigger, TaskStatus};
use sluice_core::{Error, Result};
use sluice_runner::{HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskOutput};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const LOG_BUFFER: usize = 256;
const DEFAULT_CANCEL_REASON: &str = "cancelled by request";

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Tasks allowed to run at once across all runs in this process.
    pub max_concurrent_tasks: usize,
    /// How long running tasks get to observe cancellation before being aborted.
    pub cancel_grace_period: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            cancel_grace_period: Duration::from_secs(5),
        }
    }
}

/// A run waiting behind the overlap gate, with the pipeline version it was
/// created from.
#[derive(Debug)]
struct QueuedRun {
    run: Run,
    snapshot: Arc<RegisteredPipeline>,
}

/// Handle on a run that is currently executing.
struct ActiveRun {
    cancel: CancellationToken,
    reason: Arc<StdMutex<Option<String>>>,
    done: watch::Receiver<bool>,
}

struct Permits {
    _global: OwnedSemaphorePermit,
    _pipeline: Option<OwnedSemaphorePermit>,
}

pub struct RunExecutor {
    registry: Arc<PipelineRegistry>,
    runs: Arc<dyn RunStore>,
    bus: Arc<dyn EventBus>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    pipeline_permits: StdMutex<HashMap<PipelineId, (usize, Arc<Semaphore>)>>,
    gate: Mutex<OverlapGate<QueuedRun>>,
    active: StdMutex<HashMap<RunId, ActiveRun>>,
}

impl RunExecutor {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        runs: Arc<dyn RunStore>,
        bus: Arc<dyn EventBus>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            registry,
            runs,
            bus,
            handlers,
            clock,
            config,
            permits,
            pipeline_permits: StdMutex::new(HashMap::new()),
            gate: Mutex::new(OverlapGate::new()),
            active: StdMutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs currently executing in this process.
    pub fn active_runs(&self) -> usize {
        self.active().len()
    }

    /// Create a run for a pipeline and start or queue it according to the
    /// pipeline's overlap policy.
    ///
    /// `params` override the pipeline's default params. Returns the run as
    /// persisted, still `pending`.
    pub async fn submit(
        self: &Arc<Self>,
        pipeline_id: &PipelineId,
        trigger: RunTrigger,
        params: Params,
    ) -> Result<Run> {
        let snapshot = self.registry.get(pipeline_id).await?;
        let mut merged = snapshot.definition().params.clone();
        merged.extend(params);
        let run = Run::new(&snapshot.pipeline, trigger, merged, self.clock.now());

        let mut gate = self.gate.lock().await;
        let admission = gate.admit(
            pipeline_id,
            run.id,
            &snapshot.definition().overlap,
            QueuedRun {
                run: run.clone(),
                snapshot: snapshot.clone(),
            },
        );

        match &admission {
            Admission::Rejected { reason } => {
                info!(pipeline_id = %pipeline_id, reason = %reason, "Run rejected");
                return Err(Error::RunRejected {
                    pipeline_id: pipeline_id.to_string(),
                    reason: reason.clone(),
                });
            }
            Admission::Queued { position } => {
                info!(run_id = %run.id, pipeline_id = %pipeline_id, position, "Run queued behind active run");
            }
            Admission::Start => {}
        }

        if let Err(e) = self.persist(&run).await {
            match admission {
                Admission::Queued { .. } => {
                    gate.withdraw(pipeline_id, run.id);
                }
                _ => {
                    gate.release(pipeline_id, run.id);
                }
            }
            return Err(e);
        }

        self.publish(Event::RunQueued(RunQueuedPayload {
            run_id: run.id,
            pipeline_id: run.pipeline_id.clone(),
            pipeline_version: run.pipeline_version,
            trigger: run.trigger.clone(),
            queued_at: run.created_at,
        }))
        .await;

        if admission == Admission::Start {
            self.launch(run.clone(), snapshot);
        }
        Ok(run)
    }

    /// Request cancellation of a run.
    ///
    /// Waiting runs are cancelled immediately. Executing runs are signalled
    /// and given the grace period to wind down; the returned run reflects
    /// whatever state it reached by then.
    pub async fn cancel(self: &Arc<Self>, run_id: RunId, reason: Option<String>) -> Result<Run> {
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        let mut gate = self.gate.lock().await;

        let executing = self
            .active()
            .get(&run_id)
            .map(|a| (a.cancel.clone(), a.reason.clone(), a.done.clone()));
        if let Some((cancel, slot, mut done)) = executing {
            drop(gate);
            slot.lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_or_insert(reason);
            cancel.cancel();
            info!(run_id = %run_id, "Cancellation requested");

            let wait = self.config.cancel_grace_period + Duration::from_secs(1);
            if tokio::time::timeout(wait, done.wait_for(|d| *d)).await.is_err() {
                warn!(run_id = %run_id, "Run still winding down after cancellation");
            }
            return self
                .runs
                .get(run_id)
                .await?
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()));
        }

        let stored = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        if stored.status.is_terminal() {
            return Err(Error::RunAlreadyCompleted(run_id.to_string()));
        }

        // Either waiting behind the gate or orphaned by an earlier process.
        let mut run = gate
            .withdraw(&stored.pipeline_id, run_id)
            .map(|queued| queued.run)
            .unwrap_or(stored);
        drop(gate);

        let now = self.clock.now();
        for task in run.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.finish(TaskStatus::Cancelled, now);
        }
        run.reason = Some(reason);
        run.transition(RunStatus::Cancelled, now)?;
        self.persist(&run).await?;
        self.publish(completed_event(&run)).await;
        info!(run_id = %run_id, "Cancelled waiting run");
        Ok(run)
    }

    /// Mark runs left pending or running by a previous process as failed.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [RunStatus::Pending, RunStatus::Running] {
            let stale = self
                .runs
                .query(&RunFilter::default().with_status(status))
                .await?;
            for mut run in stale {
                if self.active().contains_key(&run.id) {
                    continue;
                }
                let now = self.clock.now();
                for task in run.tasks.iter_mut() {
                    match task.status {
                        TaskStatus::Running => {
                            task.error = Some("interrupted".to_string());
                            task.finish(TaskStatus::Failed, now);
                        }
                        TaskStatus::Pending => task.finish(TaskStatus::Skipped, now),
                        _ => {}
                    }
                }
                run.reason = Some("interrupted".to_string());
                run.transition(RunStatus::Failed, now)?;
                self.persist(&run).await?;
                self.publish(completed_event(&run)).await;
                warn!(run_id = %run.id, pipeline_id = %run.pipeline_id, "Marked interrupted run as failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn launch(self: &Arc<Self>, run: Run, snapshot: Arc<RegisteredPipeline>) {
        let cancel = CancellationToken::new();
        let reason = Arc::new(StdMutex::new(None));
        let (done_tx, done_rx) = watch::channel(false);
        self.active().insert(
            run.id,
            ActiveRun {
                cancel: cancel.clone(),
                reason: reason.clone(),
                done: done_rx,
            },
        );

        let executor = self.clone();
        tokio::spawn(async move {
            let run_id = run.id;
            let pipeline_id = run.pipeline_id.clone();

            if let Err(e) = executor.execute(run, snapshot, cancel, reason).await {
                error!(run_id = %run_id, pipeline_id = %pipeline_id, error = %e, "Run halted");
            }

            executor.active().remove(&run_id);
            let _ = done_tx.send(true);
            executor.finish(&pipeline_id, run_id).await;
        });
    }

    /// Free the run's overlap slot and start the next waiting run, if any.
    async fn finish(self: &Arc<Self>, pipeline_id: &PipelineId, run_id: RunId) {
        let mut gate = self.gate.lock().await;
        if let Some((next_id, queued)) = gate.release(pipeline_id, run_id) {
            debug!(run_id = %next_id, pipeline_id = %pipeline_id, "Starting queued run");
            self.launch(queued.run, queued.snapshot);
        }
    }

    async fn execute(
        &self,
        mut run: Run,
        snapshot: Arc<RegisteredPipeline>,
        cancel: CancellationToken,
        reason: Arc<StdMutex<Option<String>>>,
    ) -> Result<()> {
        let dag = &snapshot.dag;
        let pipeline_permits = self.pipeline_semaphore(&snapshot);

        run.transition(RunStatus::Running, self.clock.now())?;
        self.persist(&run).await?;
        self.publish(Event::RunStarted(RunStartedPayload {
            run_id: run.id,
            pipeline_id: run.pipeline_id.clone(),
            task_count: run.tasks.len() as u32,
            started_at: run.started_at.unwrap_or(run.created_at),
        }))
        .await;
        info!(run_id = %run.id, pipeline_id = %run.pipeline_id, tasks = run.tasks.len(), "Run started");

        let mut workers: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut cancelling = false;
        let mut deadline: Option<Instant> = None;

        loop {
            if !cancelling && cancel.is_cancelled() {
                cancelling = true;
                deadline = Some(Instant::now() + self.config.cancel_grace_period);
                info!(run_id = %run.id, running = running.len(), "Cancelling run");
                self.settle_pending(&mut run, TaskStatus::Cancelled).await?;
            }

            if !cancelling {
                while let Some(task) = next_ready(&run, dag) {
                    let Some(permits) = self.try_permits(pipeline_permits.as_ref()) else {
                        break;
                    };
                    let (id, name) = self
                        .start_task(&mut run, task, permits, &cancel, &mut workers)
                        .await?;
                    running.insert(id, name);
                }
            }

            let ready = if cancelling {
                None
            } else {
                next_ready(&run, dag)
            };
            if running.is_empty() && ready.is_none() {
                break;
            }

            let grace_deadline = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                joined = workers.join_next_with_id(), if !running.is_empty() => {
                    match joined {
                        Some(Ok((id, outcome))) => {
                            running.remove(&id);
                            self.complete_task(&mut run, dag, outcome).await?;
                        }
                        Some(Err(e)) => {
                            let Some(name) = running.remove(&e.id()) else { continue };
                            let (status, message) = if e.is_cancelled() {
                                (TaskStatus::Cancelled, "aborted after cancellation grace period".to_string())
                            } else {
                                (TaskStatus::Failed, format!("task panicked: {}", e))
                            };
                            let outcome = TaskOutcome {
                                name,
                                result: Err(match status {
                                    TaskStatus::Cancelled => TaskError::Cancelled,
                                    _ => TaskError::failed(message.clone()),
                                }),
                                attempts: 0,
                                logs: vec![LogLine {
                                    timestamp: self.clock.now(),
                                    level: LogLevel::Error,
                                    message,
                                }],
                            };
                            self.complete_task(&mut run, dag, outcome).await?;
                        }
                        None => {}
                    }
                }
                acquired = acquire_permits(self.permits.clone(), pipeline_permits.clone()), if ready.is_some() => {
                    if let (Some(permits), Some(task)) = (acquired, ready) {
                        let (id, name) = self
                            .start_task(&mut run, task, permits, &cancel, &mut workers)
                            .await?;
                        running.insert(id, name);
                    }
                }
                _ = cancel.cancelled(), if !cancelling => {}
                _ = tokio::time::sleep_until(grace_deadline), if deadline.is_some() => {
                    warn!(run_id = %run.id, running = running.len(), "Grace period expired, aborting tasks");
                    workers.abort_all();
                    deadline = None;
                }
            }
        }

        // Anything still pending could never become ready.
        self.settle_pending(&mut run, TaskStatus::Skipped).await?;

        let status = if cancelling {
            run.reason = reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .or_else(|| Some(DEFAULT_CANCEL_REASON.to_string()));
            RunStatus::Cancelled
        } else if run.tasks.iter().all(|t| t.status == TaskStatus::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        run.transition(status, self.clock.now())?;
        self.persist(&run).await?;
        self.publish(completed_event(&run)).await;
        info!(
            run_id = %run.id,
            pipeline_id = %run.pipeline_id,
            status = %run.status,
            duration_ms = run.duration_ms.unwrap_or(0),
            "Run completed"
        );
        Ok(())
    }

    async fn start_task(
        &self,
        run: &mut Run,
        task: TaskDefinition,
        permits: Permits,
        cancel: &CancellationToken,
        workers: &mut JoinSet<TaskOutcome>,
    ) -> Result<(tokio::task::Id, String)> {
        let now = self.clock.now();
        let upstream: BTreeMap<String, serde_json::Value> = task
            .depends_on
            .iter()
            .filter_map(|dep| {
                run.task(dep)
                    .and_then(|t| t.output.clone())
                    .map(|output| (dep.clone(), output))
            })
            .collect();

        let task_run = run
            .task_mut(&task.name)
            .ok_or_else(|| Error::Internal(format!("run has no task {}", task.name)))?;
        task_run.start(now);
        let attempt = task_run.attempts;
        self.persist(run).await?;

        self.publish(Event::TaskStarted(TaskStartedPayload {
            run_id: run.id,
            pipeline_id: run.pipeline_id.clone(),
            task: task.name.clone(),
            attempt,
            started_at: now,
        }))
        .await;
        debug!(run_id = %run.id, task = %task.name, "Task started");

        let name = task.name.clone();
        let worker = TaskWorker {
            run_id: run.id,
            pipeline_id: run.pipeline_id.clone(),
            handler: self.handlers.resolve(&task.run),
            task,
            params: run.params.clone(),
            upstream,
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            cancel: cancel.child_token(),
        };
        let handle = workers.spawn(async move {
            let _permits = permits;
            worker.run().await
        });
        Ok((handle.id(), name))
    }

    async fn complete_task(
        &self,
        run: &mut Run,
        dag: &PipelineDag,
        outcome: TaskOutcome,
    ) -> Result<()> {
        let now = self.clock.now();
        let run_id = run.id;
        let pipeline_id = run.pipeline_id.clone();
        let task_run = run
            .task_mut(&outcome.name)
            .ok_or_else(|| Error::Internal(format!("run has no task {}", outcome.name)))?;

        let status = match &outcome.result {
            Ok(_) => TaskStatus::Succeeded,
            Err(TaskError::Cancelled) => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        task_run.attempts = task_run.attempts.max(outcome.attempts);
        task_run.logs.extend(outcome.logs);
        match outcome.result {
            Ok(TaskOutput { value }) => task_run.output = value,
            Err(e) => task_run.error = Some(e.to_string()),
        }
        task_run.finish(status, now);

        let completed = TaskCompletedPayload {
            run_id,
            pipeline_id,
            task: task_run.name.clone(),
            status,
            attempt: task_run.attempts,
            error: task_run.error.clone(),
            duration_ms: task_run.duration_ms,
            completed_at: now,
        };

        // Dependents of a cancelled task are settled with the rest of the run.
        let skipped = if status == TaskStatus::Failed {
            skip_downstream(run, dag, &outcome.name, now)
        } else {
            Vec::new()
        };

        self.persist(run).await?;
        match status {
            TaskStatus::Succeeded => {
                debug!(run_id = %run.id, task = %outcome.name, "Task succeeded")
            }
            _ => warn!(
                run_id = %run.id,
                task = %outcome.name,
                status = %status,
                error = completed.error.as_deref().unwrap_or(""),
                skipped = skipped.len(),
                "Task did not succeed"
            ),
        }

        self.publish(Event::TaskCompleted(completed)).await;
        for name in skipped {
            self.publish(skipped_event(run, &name, TaskStatus::Skipped, now))
                .await;
        }
        Ok(())
    }

    /// Give every pending task a terminal status.
    async fn settle_pending(&self, run: &mut Run, status: TaskStatus) -> Result<()> {
        let now = self.clock.now();
        let mut settled = Vec::new();
        for task in run.tasks.iter_mut() {
            if task.status == TaskStatus::Pending {
                task.finish(status, now);
                settled.push(task.name.clone());
            }
        }
        if settled.is_empty() {
            return Ok(());
        }

        self.persist(run).await?;
        for name in settled {
            self.publish(skipped_event(run, &name, status, now)).await;
        }
        Ok(())
    }

    fn pipeline_semaphore(&self, snapshot: &RegisteredPipeline) -> Option<Arc<Semaphore>> {
        let limit = snapshot.definition().max_concurrent_tasks?.max(1);
        let mut map = self
            .pipeline_permits
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let entry = map
            .entry(snapshot.id().clone())
            .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit))));
        if entry.0 != limit {
            *entry = (limit, Arc::new(Semaphore::new(limit)));
        }
        Some(entry.1.clone())
    }

    fn try_permits(&self, pipeline: Option<&Arc<Semaphore>>) -> Option<Permits> {
        let pipeline = match pipeline {
            Some(sem) => Some(sem.clone().try_acquire_owned().ok()?),
            None => None,
        };
        let global = self.permits.clone().try_acquire_owned().ok()?;
        Some(Permits {
            _global: global,
            _pipeline: pipeline,
        })
    }

    async fn persist(&self, run: &Run) -> Result<()> {
        self.runs.upsert(run).await.map_err(|e| match e {
            Error::Persistence(_) => e,
            other => Error::Persistence(other.to_string()),
        })
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

async fn acquire_permits(
    global: Arc<Semaphore>,
    pipeline: Option<Arc<Semaphore>>,
) -> Option<Permits> {
    let pipeline = match pipeline {
        Some(sem) => Some(sem.acquire_owned().await.ok()?),
        None => None,
    };
    let global = global.acquire_owned().await.ok()?;
    Some(Permits {
        _global: global,
        _pipeline: pipeline,
    })
}

/// First pending task, in topological order, whose dependencies all succeeded.
fn next_ready(run: &Run, dag: &PipelineDag) -> Option<TaskDefinition> {
    dag.topological_order()
        .into_iter()
        .find(|node| {
            run.task(&node.name)
                .is_some_and(|t| t.status == TaskStatus::Pending)
                && node.definition.depends_on.iter().all(|dep| {
                    run.task(dep)
                        .is_some_and(|t| t.status == TaskStatus::Succeeded)
                })
        })
        .map(|node| node.definition.clone())
}

/// Mark every pending transitive dependent of `failed` as skipped.
fn skip_downstream(
    run: &mut Run,
    dag: &PipelineDag,
    failed: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<String> {
    let downstream = dag.downstream(failed);
    let mut skipped = Vec::new();
    for node in dag.topological_order() {
        if !downstream.contains(&node.name) {
            continue;
        }
        if let Some(task) = run.task_mut(&node.name)
            && task.status == TaskStatus::Pending
        {
            task.finish(TaskStatus::Skipped, now);
            skipped.push(node.name.clone());
        }
    }
    skipped
}

fn skipped_event(
    run: &Run,
    task: &str,
    status: TaskStatus,
    now: chrono::DateTime<chrono::Utc>,
) -> Event {
    Event::TaskCompleted(TaskCompletedPayload {
        run_id: run.id,
        pipeline_id: run.pipeline_id.clone(),
        task: task.to_string(),
        status,
        attempt: 0,
        error: None,
        duration_ms: None,
        completed_at: now,
    })
}

fn completed_event(run: &Run) -> Event {
    let count = |status: TaskStatus| run.tasks.iter().filter(|t| t.status == status).count() as u32;
    Event::RunCompleted(RunCompletedPayload {
        run_id: run.id,
        pipeline_id: run.pipeline_id.clone(),
        status: run.status,
        duration_ms: run.duration_ms.unwrap_or(0),
        tasks_succeeded: count(TaskStatus::Succeeded),
        tasks_failed: count(TaskStatus::Failed),
        tasks_skipped: count(TaskStatus::Skipped),
        reason: run.reason.clone(),
        completed_at: run.completed_at.unwrap_or(run.created_at),
    })
}

/// What a task worker reports back to its run.
struct TaskOutcome {
    name: String,
    result: std::result::Result<TaskOutput, TaskError>,
    attempts: u32,
    logs: Vec<LogLine>,
}

/// Executes one task, including retries, off the run's coordinator.
struct TaskWorker {
    run_id: RunId,
    pipeline_id: PipelineId,
    task: TaskDefinition,
    handler: Option<Arc<dyn TaskHandler>>,
    params: Params,
    upstream: BTreeMap<String, serde_json::Value>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl TaskWorker {
    async fn run(self) -> TaskOutcome {
        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(LOG_BUFFER);

        let collect = async {
            let mut logs = Vec::new();
            while let Some(line) = log_rx.recv().await {
                let event = Event::TaskLog(TaskLogPayload {
                    run_id: self.run_id,
                    pipeline_id: self.pipeline_id.clone(),
                    task: self.task.name.clone(),
                    line: line.clone(),
                });
                if let Err(e) = self.bus.publish(event).await {
                    debug!(error = %e, "Dropped task log event");
                }
                logs.push(line);
            }
            logs
        };

        let ((result, attempts), logs) = tokio::join!(self.attempts(log_tx), collect);
        TaskOutcome {
            name: self.task.name.clone(),
            result,
            attempts,
            logs,
        }
    }

    async fn attempts(
        &self,
        logs: mpsc::Sender<LogLine>,
    ) -> (std::result::Result<TaskOutput, TaskError>, u32) {
        let Some(handler) = &self.handler else {
            let kind = self.task.run.handler_name().to_string();
            return (Err(TaskError::UnknownKind(kind)), 1);
        };
        let max_attempts = self
            .task
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);

        let mut attempt = 1;
        loop {
            let ctx = TaskContext::new(
                self.run_id,
                self.pipeline_id.clone(),
                self.task.clone(),
                attempt,
                self.params.clone(),
                self.upstream.clone(),
                self.cancel.clone(),
                logs.clone(),
            )
            .with_clock(self.clock.clone());

            let result = match self.task.timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), handler.execute(&ctx))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TaskError::TimedOut(secs)),
                    }
                }
                None => handler.execute(&ctx).await,
            };

            let retryable = matches!(result, Err(TaskError::Failed(_) | TaskError::TimedOut(_)));
            if !retryable || attempt >= max_attempts || self.cancel.is_cancelled() {
                return (result, attempt);
            }

            let delay = self
                .task
                .retry
                .as_ref()
                .map(|r| r.delay_before(attempt + 1))
                .unwrap_or_default();
            if let Err(e) = &result {
                ctx.log(
                    LogLevel::Warn,
                    format!("attempt {} failed: {}; retrying in {:?}", attempt, e, delay),
                )
                .await;
                warn!(run_id = %self.run_id, task = %self.task.name, attempt, error = %e, "Task attempt failed, retrying");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return (Err(TaskError::Cancelled), attempt),
            }
            attempt += 1;
        }
    }
}
