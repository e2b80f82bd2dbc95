//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters: the durable record store, the event transport, and observers.

use crate::Result;
use crate::events::{Event, SubscriptionScope};
use crate::ids::*;
use crate::pipeline::{Pipeline, TriggerState};
use crate::run::{Run, RunFilter};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events. Ends when the subscriber is dropped by the bus.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Event bus for publishing and subscribing to state transitions.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Must never block on slow subscribers.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a scope.
    async fn subscribe(&self, scope: SubscriptionScope) -> Result<EventStream>;
}

/// Durable store of pipeline definitions.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert or replace a pipeline by id.
    async fn save(&self, pipeline: &Pipeline) -> Result<()>;

    /// Get a pipeline by ID.
    async fn get(&self, id: &PipelineId) -> Result<Option<Pipeline>>;

    /// List all pipelines ordered by id.
    async fn list(&self) -> Result<Vec<Pipeline>>;
}

/// Durable store of runs and their task runs.
///
/// Writes replace the whole run record, so readers never observe a
/// half-written run.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or update a run keyed by its id.
    async fn upsert(&self, run: &Run) -> Result<()>;

    /// Get a run by ID.
    async fn get(&self, id: RunId) -> Result<Option<Run>>;

    /// Runs matching the filter, newest first.
    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;
}

/// Durable store of trigger next-fire state.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<TriggerState>>;

    /// Atomically replace the state of one trigger.
    async fn save(&self, state: &TriggerState) -> Result<()>;

    async fn delete(&self, trigger_id: &TriggerId) -> Result<()>;
}
