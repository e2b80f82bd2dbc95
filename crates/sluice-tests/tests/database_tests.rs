//! PostgreSQL store integration tests.
//!
//! Run with: `cargo test -p sluice-tests --test database_tests --features integration`

#![cfg(feature = "integration")]

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use sluice_core::ids::{PipelineId, TriggerId};
use sluice_core::pipeline::TriggerState;
use sluice_core::ports::{PipelineStore, RunStore, TriggerStore};
use sluice_core::run::{RunFilter, RunStatus, TaskStatus};
use sluice_scheduler::Stores;
use sluice_tests::containers::PostgresContainer;
use sluice_tests::{PipelineFixture, RunFixture, init_test_logging, start_test_server_with};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_pipeline_save_and_replace() {
    init_test_logging();
    let pg = PostgresContainer::start().await.expect("Failed to start postgres");
    let db = pg.database().await.expect("Failed to connect");
    let store = db.pipeline_store();

    let mut pipeline = PipelineFixture::registered(PipelineFixture::chain("etl"));
    store.save(&pipeline).await.expect("Failed to save pipeline");
    store
        .save(&PipelineFixture::registered(PipelineFixture::simple("alpha")))
        .await
        .unwrap();

    let found = store
        .get(&PipelineId::new("etl"))
        .await
        .unwrap()
        .expect("Pipeline not found");
    assert_eq!(found.definition, pipeline.definition);
    assert_eq!(found.version, 1);

    pipeline.version = 2;
    pipeline.definition.description = Some("changed".to_string());
    store.save(&pipeline).await.unwrap();

    let all = store.list().await.unwrap();
    let ids: Vec<&str> = all.iter().map(|p| p.id().as_str()).collect();
    assert_eq!(ids, vec!["alpha", "etl"]);
    assert_eq!(all[1].version, 2);
    assert_eq!(all[1].definition.description.as_deref(), Some("changed"));

    assert!(store.get(&PipelineId::new("missing")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_upsert_replaces_tasks() {
    let pg = PostgresContainer::start().await.unwrap();
    let db = pg.database().await.unwrap();
    let store = db.run_store();

    let pipeline = PipelineFixture::registered(PipelineFixture::chain("etl"));
    let mut run = RunFixture::running(&pipeline);
    store.upsert(&run).await.expect("Failed to insert run");

    let found = store.get(run.id).await.unwrap().expect("Run not found");
    assert_eq!(found.status, RunStatus::Running);
    assert_eq!(found.tasks.len(), 3);
    assert_eq!(found.tasks[0].name, "extract");
    assert_eq!(found.tasks[0].status, TaskStatus::Running);
    assert_eq!(found.tasks[1].depends_on, vec!["extract".to_string()]);

    let now = Utc::now();
    for task in &mut run.tasks {
        if task.status == TaskStatus::Pending {
            task.start(now);
        }
        task.output = Some(serde_json::json!({ "rows": 10 }));
        task.finish(TaskStatus::Succeeded, now);
    }
    run.transition(RunStatus::Succeeded, now).unwrap();
    store.upsert(&run).await.expect("Failed to update run");

    let found = store.get(run.id).await.unwrap().unwrap();
    assert_eq!(found.status, RunStatus::Succeeded);
    assert!(found.completed_at.is_some());
    assert!(found.tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
    assert_eq!(found.tasks[2].output, Some(serde_json::json!({ "rows": 10 })));
}

#[tokio::test]
async fn test_run_query_filters_and_orders() {
    let pg = PostgresContainer::start().await.unwrap();
    let db = pg.database().await.unwrap();
    let store = db.run_store();

    let etl = PipelineFixture::registered(PipelineFixture::simple("etl"));
    let other = PipelineFixture::registered(PipelineFixture::simple("other"));

    let base = Utc::now() - ChronoDuration::hours(1);
    let mut ids = Vec::new();
    for i in 0..4 {
        let mut run = RunFixture::succeeded(&etl);
        run.created_at = base + ChronoDuration::minutes(i);
        run.started_at = Some(base + ChronoDuration::minutes(i));
        store.upsert(&run).await.unwrap();
        ids.push(run.id);
    }
    store.upsert(&RunFixture::pending(&other)).await.unwrap();

    let newest_first = store
        .query(&RunFilter::for_pipeline(PipelineId::new("etl")))
        .await
        .unwrap();
    let got: Vec<_> = newest_first.iter().map(|r| r.id).collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(got, expected);

    let page = store
        .query(&RunFilter {
            pipeline_id: Some(PipelineId::new("etl")),
            limit: Some(2),
            offset: 1,
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), expected[1..3].to_vec());

    let windowed = store
        .query(&RunFilter {
            since: Some(base + ChronoDuration::minutes(1)),
            until: Some(base + ChronoDuration::minutes(2)),
            ..RunFilter::for_pipeline(PipelineId::new("etl"))
        })
        .await
        .unwrap();
    assert_eq!(windowed.len(), 2);

    let pending = store
        .query(&RunFilter::default().with_status(RunStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].pipeline_id.as_str(), "other");

    store.health_check().await.unwrap();
}

#[tokio::test]
async fn test_trigger_state_roundtrip() {
    let pg = PostgresContainer::start().await.unwrap();
    let db = pg.database().await.unwrap();
    let store = db.trigger_store();

    let pipeline_id = PipelineId::new("etl");
    let trigger_id = TriggerId::for_trigger(&pipeline_id, "hourly");
    let mut state = TriggerState {
        trigger_id: trigger_id.clone(),
        pipeline_id: pipeline_id.clone(),
        next_fire_at: Some(Utc::now() + ChronoDuration::hours(1)),
        last_fired_at: None,
    };
    store.save(&state).await.unwrap();

    state.last_fired_at = Some(Utc::now());
    state.next_fire_at = None;
    store.save(&state).await.unwrap();

    let all = store.load_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].trigger_id, trigger_id);
    assert!(all[0].next_fire_at.is_none());
    assert!(all[0].last_fired_at.is_some());

    store.delete(&trigger_id).await.unwrap();
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_recovers_interrupted_runs() {
    let pg = PostgresContainer::start().await.unwrap();
    let db = pg.database().await.unwrap();
    let stores = Stores {
        pipelines: Arc::new(db.pipeline_store()),
        runs: Arc::new(db.run_store()),
        triggers: Arc::new(db.trigger_store()),
    };

    // State a crashed process would leave behind.
    let pipeline = PipelineFixture::registered(PipelineFixture::chain("etl"));
    stores.pipelines.save(&pipeline).await.unwrap();
    let orphan = RunFixture::running(&pipeline);
    stores.runs.upsert(&orphan).await.unwrap();

    let server = start_test_server_with(stores.clone())
        .await
        .expect("Failed to start server");

    let recovered = server.scheduler.get_run(orphan.id).await.unwrap();
    assert_eq!(recovered.status, RunStatus::Failed);
    assert_eq!(recovered.reason.as_deref(), Some("interrupted"));
    assert_eq!(recovered.tasks[0].status, TaskStatus::Failed);
    assert_eq!(recovered.tasks[1].status, TaskStatus::Skipped);

    // The reloaded pipeline is runnable end to end.
    let client = server.client();
    let run_id = client.trigger("etl").await.unwrap();
    let run = client
        .wait_for_terminal(&run_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["pipeline_version"], 1);
}
