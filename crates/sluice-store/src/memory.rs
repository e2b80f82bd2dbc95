//! In-memory store implementations.
//!
//! Each write replaces the whole record under a write lock, so readers see
//! either the old or the new record and never a mix.

use async_trait::async_trait;
use sluice_core::Result;
use sluice_core::ids::{PipelineId, RunId, TriggerId};
use sluice_core::pipeline::{Pipeline, TriggerState};
use sluice_core::ports::{PipelineStore, RunStore, TriggerStore};
use sluice_core::run::{Run, RunFilter};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn upsert(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<&Run> = runs.values().filter(|r| filter.matches(r)).collect();
        // Newest first; run ids are time-ordered so they break ties stably.
        matching.sort_by(|a, b| {
            b.sort_key()
                .cmp(&a.sort_key())
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });

        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    pipelines: RwLock<BTreeMap<PipelineId, Pipeline>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn save(&self, pipeline: &Pipeline) -> Result<()> {
        self.pipelines
            .write()
            .await
            .insert(pipeline.id().clone(), pipeline.clone());
        Ok(())
    }

    async fn get(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        Ok(self.pipelines.read().await.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTriggerStore {
    states: RwLock<HashMap<TriggerId, TriggerState>>,
}

impl InMemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
    async fn load_all(&self) -> Result<Vec<TriggerState>> {
        Ok(self.states.read().await.values().cloned().collect())
    }

    async fn save(&self, state: &TriggerState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.trigger_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, trigger_id: &TriggerId) -> Result<()> {
        self.states.write().await.remove(trigger_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use sluice_core::pipeline::{OverlapPolicy, Params, PipelineDefinition};
    use sluice_core::run::{RunStatus, RunTrigger};

    fn pipeline(id: &str) -> Pipeline {
        Pipeline {
            definition: PipelineDefinition {
                id: PipelineId::new(id),
                name: None,
                description: None,
                tasks: vec![],
                triggers: vec![],
                params: Params::new(),
                overlap: OverlapPolicy::Reject,
                max_concurrent_tasks: None,
            },
            version: 1,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run_at(pipeline: &Pipeline, minute: i64) -> Run {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Run::new(
            pipeline,
            RunTrigger::Manual { requested_by: None },
            Params::new(),
            base + Duration::minutes(minute),
        )
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_record() {
        let store = InMemoryRunStore::new();
        let mut run = run_at(&pipeline("etl"), 0);
        store.upsert(&run).await.unwrap();

        run.transition(RunStatus::Running, run.created_at).unwrap();
        store.upsert(&run).await.unwrap();

        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_and_pages() {
        let store = InMemoryRunStore::new();
        let etl = pipeline("etl");
        let other = pipeline("other");
        for minute in 0..5 {
            store.upsert(&run_at(&etl, minute)).await.unwrap();
        }
        store.upsert(&run_at(&other, 10)).await.unwrap();

        let filter = RunFilter {
            limit: Some(2),
            offset: 1,
            ..RunFilter::for_pipeline(PipelineId::new("etl"))
        };
        let page = store.query(&filter).await.unwrap();
        let minutes: Vec<_> = page
            .iter()
            .map(|r| r.created_at.format("%M").to_string())
            .collect();
        assert_eq!(minutes, vec!["03", "02"]);
    }

    #[tokio::test]
    async fn test_query_by_status() {
        let store = InMemoryRunStore::new();
        let etl = pipeline("etl");
        let mut failed = run_at(&etl, 1);
        failed.transition(RunStatus::Failed, failed.created_at).unwrap();
        store.upsert(&failed).await.unwrap();
        store.upsert(&run_at(&etl, 2)).await.unwrap();

        let runs = store
            .query(&RunFilter::default().with_status(RunStatus::Failed))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, failed.id);
    }

    #[tokio::test]
    async fn test_pipeline_store_lists_by_id() {
        let store = InMemoryPipelineStore::new();
        store.save(&pipeline("zeta")).await.unwrap();
        store.save(&pipeline("alpha")).await.unwrap();

        let ids: Vec<_> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert!(store.get(&PipelineId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_store_round_trip() {
        let store = InMemoryTriggerStore::new();
        let state = TriggerState {
            trigger_id: TriggerId::new("etl/hourly"),
            pipeline_id: PipelineId::new("etl"),
            next_fire_at: Some(Utc::now()),
            last_fired_at: None,
        };
        store.save(&state).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![state.clone()]);

        store.delete(&state.trigger_id).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
