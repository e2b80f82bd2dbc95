//! Main scheduler orchestration.

use crate::engine::{PendingFire, TriggerEngine};
use crate::executor::{ExecutorConfig, RunExecutor};
use crate::registry::PipelineRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_core::clock::Clock;
use sluice_core::events::SubscriptionScope;
use sluice_core::ids::{PipelineId, RunId, TriggerId};
use sluice_core::pipeline::{Params, Pipeline, PipelineDefinition, Schedule};
use sluice_core::ports::{EventBus, EventStream, PipelineStore, RunStore, TriggerStore};
use sluice_core::run::{Run, RunFilter, RunTrigger};
use sluice_core::{Error, Result};
use sluice_runner::HandlerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Scheduler tuning, usually filled from the server config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub executor: ExecutorConfig,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Durable stores the scheduler runs against.
#[derive(Clone)]
pub struct Stores {
    pub pipelines: Arc<dyn PipelineStore>,
    pub runs: Arc<dyn RunStore>,
    pub triggers: Arc<dyn TriggerStore>,
}

/// A trigger together with its scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerInfo {
    pub id: TriggerId,
    pub name: String,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub paused: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// The main scheduler service.
pub struct Scheduler {
    registry: Arc<PipelineRegistry>,
    executor: Arc<RunExecutor>,
    engine: Arc<TriggerEngine>,
    runs: Arc<dyn RunStore>,
    bus: Arc<dyn EventBus>,
    loaded: OnceCell<()>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        bus: Arc<dyn EventBus>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let registry = Arc::new(
            PipelineRegistry::new(clock.clone()).with_store(stores.pipelines.clone()),
        );
        let executor = Arc::new(RunExecutor::new(
            registry.clone(),
            stores.runs.clone(),
            bus.clone(),
            Arc::new(handlers),
            clock.clone(),
            config.executor.clone(),
        ));
        let engine = Arc::new(
            TriggerEngine::new(registry.clone(), stores.triggers, bus.clone(), clock)
                .with_tick_interval(config.tick_interval),
        );

        Self {
            registry,
            executor,
            engine,
            runs: stores.runs,
            bus,
            loaded: OnceCell::new(),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Reload state from the stores. Only the first call does any work.
    ///
    /// Call before registering pipelines on startup so re-registration
    /// continues from the stored versions. Runs left unfinished by a previous
    /// process are failed before any new run is admitted.
    pub async fn load(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                self.registry.load_from_store().await?;
                let recovered = self.executor.recover_interrupted().await?;
                if recovered > 0 {
                    warn!(count = recovered, "Recovered interrupted runs");
                }
                self.engine.load().await?;
                Ok::<_, Error>(())
            })
            .await?;
        Ok(())
    }

    /// Load state if not done yet and start the trigger engine.
    pub async fn start(&self) -> Result<()> {
        self.load().await?;

        // One fire in flight at a time; the engine waits for each ack.
        let (tx, rx) = mpsc::channel(1);
        let mut background = self.background.lock().await;
        background.push(tokio::spawn(
            self.engine.clone().run(tx, self.shutdown.clone()),
        ));
        background.push(tokio::spawn(dispatch(self.executor.clone(), rx)));

        info!("Scheduler started");
        Ok(())
    }

    /// Stop firing triggers. Runs already executing are left to finish.
    ///
    /// The engine finishes its current tick first and dispatch handles every
    /// fire it was sent before stopping.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(active_runs = self.executor.active_runs(), "Scheduler stopped");
    }

    pub async fn register_pipeline(&self, definition: PipelineDefinition) -> Result<Pipeline> {
        let registered = self.registry.register(definition).await?;
        Ok(registered.pipeline.clone())
    }

    /// Check a definition without registering it.
    pub fn validate_pipeline(definition: &PipelineDefinition) -> Result<()> {
        PipelineRegistry::validate(definition).map(|_| ())
    }

    pub async fn get_pipeline(&self, id: &PipelineId) -> Result<Pipeline> {
        Ok(self.registry.get(id).await?.pipeline.clone())
    }

    pub async fn list_pipelines(&self) -> Vec<Pipeline> {
        self.registry
            .list()
            .await
            .iter()
            .map(|p| p.pipeline.clone())
            .collect()
    }

    /// Triggers of a pipeline with their next fire times.
    pub async fn list_triggers(&self, pipeline_id: &PipelineId) -> Result<Vec<TriggerInfo>> {
        let registered = self.registry.get(pipeline_id).await?;
        let definition = registered.definition();

        let mut triggers = Vec::with_capacity(definition.triggers.len());
        for trigger in &definition.triggers {
            let id = definition.trigger_id(trigger);
            let state = self.engine.state(&id).await;
            triggers.push(TriggerInfo {
                name: trigger.name.clone(),
                description: trigger.description.clone(),
                schedule: trigger.schedule.clone(),
                paused: trigger.paused,
                next_fire_at: state
                    .as_ref()
                    .and_then(|s| s.next_fire_at)
                    .filter(|_| !trigger.paused),
                last_fired_at: state.and_then(|s| s.last_fired_at),
                id,
            });
        }
        Ok(triggers)
    }

    /// Start a run on demand.
    pub async fn trigger_run(
        &self,
        pipeline_id: &PipelineId,
        params: Params,
        requested_by: Option<String>,
    ) -> Result<Run> {
        self.executor
            .submit(pipeline_id, RunTrigger::Manual { requested_by }, params)
            .await
    }

    pub async fn cancel_run(&self, run_id: RunId, reason: Option<String>) -> Result<Run> {
        self.executor.cancel(run_id, reason).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.runs.query(filter).await
    }

    pub async fn subscribe(&self, scope: SubscriptionScope) -> Result<EventStream> {
        self.bus.subscribe(scope).await
    }

    /// Probe the run store.
    pub async fn health(&self) -> Result<()> {
        self.runs.health_check().await
    }
}

/// Turn fire events into runs until the engine drops its sender.
///
/// A fire counts as handled once its run is persisted or the overlap policy
/// rejected it. Any other failure leaves the trigger due.
async fn dispatch(executor: Arc<RunExecutor>, mut fires: mpsc::Receiver<PendingFire>) {
    while let Some(pending) = fires.recv().await {
        let fire = &pending.event;
        let trigger = RunTrigger::Schedule {
            trigger_id: fire.trigger_id.clone(),
            scheduled_for: fire.scheduled_for,
        };
        let handled = match executor
            .submit(&fire.pipeline_id, trigger, fire.params.clone())
            .await
        {
            Ok(run) => {
                info!(
                    run_id = %run.id,
                    trigger_id = %fire.trigger_id,
                    "Scheduled run submitted"
                );
                true
            }
            Err(Error::RunRejected { reason, .. }) => {
                info!(
                    trigger_id = %fire.trigger_id,
                    reason = %reason,
                    "Scheduled run rejected"
                );
                true
            }
            Err(e) => {
                warn!(
                    trigger_id = %fire.trigger_id,
                    error = %e,
                    "Failed to submit scheduled run"
                );
                false
            }
        };
        pending.ack(handled);
    }
}
