//! Behavioural tests for the in-process event bus.

use chrono::Utc;
use futures::StreamExt;
use sluice_bus::{BusConfig, InMemoryEventBus};
use sluice_core::events::{Event, RunStartedPayload, SubscriptionScope};
use sluice_core::ids::{PipelineId, RunId};
use sluice_core::ports::EventBus;
use std::time::Duration;

fn run_started(pipeline: &str, run_id: RunId) -> Event {
    Event::RunStarted(RunStartedPayload {
        run_id,
        pipeline_id: PipelineId::new(pipeline),
        task_count: 1,
        started_at: Utc::now(),
    })
}

#[tokio::test]
async fn test_subscriber_receives_events_in_order() {
    let bus = InMemoryEventBus::new();
    let mut stream = bus.subscribe(SubscriptionScope::All).await.unwrap();

    let first = run_started("etl", RunId::new());
    let second = run_started("etl", RunId::new());
    bus.publish(first.clone()).await.unwrap();
    bus.publish(second.clone()).await.unwrap();

    assert_eq!(stream.next().await, Some(first));
    assert_eq!(stream.next().await, Some(second));
}

#[tokio::test]
async fn test_scope_filters_events() {
    let bus = InMemoryEventBus::new();
    let run_id = RunId::new();
    let mut by_run = bus.subscribe(SubscriptionScope::Run(run_id)).await.unwrap();
    let mut by_pipeline = bus
        .subscribe(SubscriptionScope::Pipeline(PipelineId::new("other")))
        .await
        .unwrap();

    bus.publish(run_started("etl", RunId::new())).await.unwrap();
    bus.publish(run_started("etl", run_id)).await.unwrap();
    bus.publish(run_started("other", RunId::new())).await.unwrap();

    let event = by_run.next().await.unwrap();
    assert_eq!(event.run_id(), Some(run_id));
    let event = by_pipeline.next().await.unwrap();
    assert_eq!(event.pipeline_id(), &PipelineId::new("other"));

    let nothing = tokio::time::timeout(Duration::from_millis(50), by_run.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_without_blocking() {
    let bus = InMemoryEventBus::with_config(BusConfig::new(2));
    let mut slow = bus.subscribe(SubscriptionScope::All).await.unwrap();
    let mut fast = bus.subscribe(SubscriptionScope::All).await.unwrap();

    for _ in 0..2 {
        bus.publish(run_started("etl", RunId::new())).await.unwrap();
        fast.next().await.unwrap();
    }
    // Third event overflows the slow subscriber's buffer.
    bus.publish(run_started("etl", RunId::new())).await.unwrap();
    fast.next().await.unwrap();

    assert_eq!(bus.subscriber_count().await, 1);
    assert!(!bus.health_check().status.is_healthy());
    assert_eq!(bus.metrics().snapshot().subscribers_dropped, 1);

    // Buffered events drain, then the stream ends.
    assert!(slow.next().await.is_some());
    assert!(slow.next().await.is_some());
    assert_eq!(slow.next().await, None);
}

#[tokio::test]
async fn test_dropped_stream_is_pruned() {
    let bus = InMemoryEventBus::new();
    let stream = bus.subscribe(SubscriptionScope::All).await.unwrap();
    drop(stream);

    bus.publish(run_started("etl", RunId::new())).await.unwrap();
    assert_eq!(bus.subscriber_count().await, 0);
    assert!(bus.health_check().status.is_healthy());
}
