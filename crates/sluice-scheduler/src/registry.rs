//! Pipeline registry: validated, versioned pipeline definitions.

use crate::dag::PipelineDag;
use crate::triggers;
use sluice_core::clock::Clock;
use sluice_core::ids::PipelineId;
use sluice_core::pipeline::{Pipeline, PipelineDefinition};
use sluice_core::ports::PipelineStore;
use sluice_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A pipeline together with its validated task graph.
///
/// Runs hold on to the `Arc` they were created from, so replacing a pipeline
/// never changes the task set of a run already in flight.
#[derive(Debug)]
pub struct RegisteredPipeline {
    pub pipeline: Pipeline,
    pub dag: PipelineDag,
}

impl RegisteredPipeline {
    pub fn id(&self) -> &PipelineId {
        self.pipeline.id()
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.pipeline.definition
    }
}

pub struct PipelineRegistry {
    pipelines: RwLock<BTreeMap<PipelineId, Arc<RegisteredPipeline>>>,
    store: Option<Arc<dyn PipelineStore>>,
    clock: Arc<dyn Clock>,
}

impl PipelineRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pipelines: RwLock::new(BTreeMap::new()),
            store: None,
            clock,
        }
    }

    /// Persist definitions through `store` on every registration.
    pub fn with_store(mut self, store: Arc<dyn PipelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Check a definition without registering it.
    pub fn validate(definition: &PipelineDefinition) -> Result<PipelineDag> {
        let id = definition.id.as_str();
        if id.is_empty() {
            return Err(Error::InvalidGraph("pipeline id must not be empty".to_string()));
        }
        if id.contains('/') {
            return Err(Error::InvalidGraph(format!(
                "pipeline id must not contain '/': {}",
                id
            )));
        }

        let dag = PipelineDag::build(definition)?;

        let mut seen = HashSet::new();
        for trigger in &definition.triggers {
            if trigger.name.is_empty() {
                return Err(Error::InvalidTrigger {
                    trigger: String::new(),
                    message: "trigger name must not be empty".to_string(),
                });
            }
            if !seen.insert(trigger.name.as_str()) {
                return Err(Error::InvalidTrigger {
                    trigger: trigger.name.clone(),
                    message: "duplicate trigger name".to_string(),
                });
            }
            triggers::validate(&trigger.schedule).map_err(|message| Error::InvalidTrigger {
                trigger: trigger.name.clone(),
                message,
            })?;
        }

        Ok(dag)
    }

    /// Register or replace a pipeline.
    ///
    /// Re-registering an identical definition is a no-op; a changed
    /// definition bumps the version. Nothing is applied if validation or
    /// persistence fails.
    pub async fn register(&self, definition: PipelineDefinition) -> Result<Arc<RegisteredPipeline>> {
        let dag = Self::validate(&definition)?;
        let mut pipelines = self.pipelines.write().await;

        let existing = pipelines.get(&definition.id).cloned();
        if let Some(existing) = &existing
            && existing.pipeline.definition == definition
        {
            return Ok(existing.clone());
        }

        let now = self.clock.now();
        let pipeline = match &existing {
            Some(prev) => Pipeline {
                definition,
                version: prev.pipeline.version + 1,
                registered_at: prev.pipeline.registered_at,
                updated_at: now,
            },
            None => Pipeline {
                definition,
                version: 1,
                registered_at: now,
                updated_at: now,
            },
        };

        if let Some(store) = &self.store {
            store
                .save(&pipeline)
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }

        info!(
            pipeline_id = %pipeline.id(),
            version = pipeline.version,
            tasks = dag.task_count(),
            "Registered pipeline"
        );

        let registered = Arc::new(RegisteredPipeline { pipeline, dag });
        pipelines.insert(registered.id().clone(), registered.clone());
        Ok(registered)
    }

    pub async fn get(&self, id: &PipelineId) -> Result<Arc<RegisteredPipeline>> {
        self.pipelines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    /// All pipelines ordered by id.
    pub async fn list(&self) -> Vec<Arc<RegisteredPipeline>> {
        self.pipelines.read().await.values().cloned().collect()
    }

    /// Load previously persisted pipelines, keeping their versions.
    pub async fn load_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let stored = store.list().await?;
        let mut pipelines = self.pipelines.write().await;
        let mut loaded = 0;
        for pipeline in stored {
            match Self::validate(&pipeline.definition) {
                Ok(dag) => {
                    pipelines.insert(
                        pipeline.id().clone(),
                        Arc::new(RegisteredPipeline { pipeline, dag }),
                    );
                    loaded += 1;
                }
                Err(e) => {
                    warn!(pipeline_id = %pipeline.id(), error = %e, "Skipping invalid stored pipeline");
                }
            }
        }

        info!(count = loaded, "Loaded pipelines from store");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::clock::SystemClock;
    use sluice_core::pipeline::{
        OverlapPolicy, Params, Schedule, TaskDefinition, TaskKind, TriggerDefinition,
    };
    use sluice_store::InMemoryPipelineStore;

    fn task(name: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            description: None,
            run: TaskKind::Noop,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            retry: None,
            timeout_secs: None,
        }
    }

    fn definition(id: &str, tasks: Vec<TaskDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            id: PipelineId::new(id),
            name: None,
            description: None,
            tasks,
            triggers: vec![],
            params: Params::new(),
            overlap: OverlapPolicy::default(),
            max_concurrent_tasks: None,
        }
    }

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_register_and_get_unchanged() {
        let registry = registry();
        let def = definition("etl", vec![task("a", &[]), task("b", &["a"])]);

        registry.register(def.clone()).await.unwrap();
        let got = registry.get(&PipelineId::new("etl")).await.unwrap();
        assert_eq!(got.definition(), &def);
        assert_eq!(got.pipeline.version, 1);
    }

    #[tokio::test]
    async fn test_invalid_graph_is_not_applied() {
        let registry = registry();
        let err = registry
            .register(definition("etl", vec![task("a", &["b"]), task("b", &["a"])]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));

        let err = registry.get(&PipelineId::new("etl")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reregistration_bumps_version_only_on_change() {
        let registry = registry();
        let def = definition("etl", vec![task("a", &[])]);
        registry.register(def.clone()).await.unwrap();
        let same = registry.register(def).await.unwrap();
        assert_eq!(same.pipeline.version, 1);

        let changed = registry
            .register(definition("etl", vec![task("a", &[]), task("b", &[])]))
            .await
            .unwrap();
        assert_eq!(changed.pipeline.version, 2);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_ids_and_triggers() {
        let registry = registry();
        let err = registry
            .register(definition("a/b", vec![task("a", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));

        let mut def = definition("etl", vec![task("a", &[])]);
        def.triggers.push(TriggerDefinition {
            name: "nightly".to_string(),
            description: None,
            schedule: Schedule::Cron {
                expression: "every night".to_string(),
            },
            params: Params::new(),
            paused: false,
        });
        let err = registry.register(def).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTrigger { trigger, .. } if trigger == "nightly"));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_interval() {
        let registry = registry();
        let mut def = definition("etl", vec![task("a", &[])]);
        def.triggers.push(TriggerDefinition {
            name: "forever".to_string(),
            description: None,
            schedule: Schedule::Interval {
                every_secs: 10_000_000_000_000,
                catch_up: Default::default(),
                start_at: None,
            },
            params: Params::new(),
            paused: false,
        });

        let err = registry.register(def).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTrigger { trigger, .. } if trigger == "forever"));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let store = Arc::new(InMemoryPipelineStore::new());
        let first = registry().with_store(store.clone());
        first
            .register(definition("etl", vec![task("a", &[])]))
            .await
            .unwrap();
        first
            .register(definition("etl", vec![task("a", &[]), task("b", &["a"])]))
            .await
            .unwrap();

        let second = registry().with_store(store);
        assert_eq!(second.load_from_store().await.unwrap(), 1);
        let reloaded = second.get(&PipelineId::new("etl")).await.unwrap();
        assert_eq!(reloaded.pipeline.version, 2);
        assert_eq!(reloaded.dag.task_count(), 2);
    }
}
