//! Trigger engine: turns schedules into fire events.
//!
//! The engine keeps a cache of trigger state that mirrors the trigger store.
//! Each tick reconciles the cache with the registry, then fires every trigger
//! that is due. A trigger's new state is saved only after the receiving side
//! acknowledges the fire, so a fire that was never handled is replayed on
//! restart instead of lost.

use crate::registry::PipelineRegistry;
use crate::triggers;
use chrono::{DateTime, Utc};
use sluice_core::clock::Clock;
use sluice_core::events::{Event, TriggerFiredPayload};
use sluice_core::ids::{PipelineId, TriggerId};
use sluice_core::pipeline::{Params, Schedule, TriggerState};
use sluice_core::ports::{EventBus, TriggerStore};
use sluice_core::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A trigger became due.
#[derive(Debug, Clone, PartialEq)]
pub struct FireEvent {
    pub trigger_id: TriggerId,
    pub pipeline_id: PipelineId,
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub params: Params,
}

/// A fire waiting to be handled by the receiver of the engine's channel.
#[derive(Debug)]
pub struct PendingFire {
    pub event: FireEvent,
    ack: oneshot::Sender<bool>,
}

impl PendingFire {
    /// Report the fire as handled (`true`) or to be retried on a later tick.
    ///
    /// Dropping a `PendingFire` without acknowledging it counts as not handled.
    pub fn ack(self, handled: bool) {
        // The engine may have stopped waiting; nothing left to tell it.
        let _ = self.ack.send(handled);
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    state: TriggerState,
    /// Schedule the state was computed from; `None` until reconciled.
    schedule: Option<Schedule>,
}

pub struct TriggerEngine {
    registry: Arc<PipelineRegistry>,
    store: Arc<dyn TriggerStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    cache: Mutex<BTreeMap<TriggerId, Tracked>>,
}

impl TriggerEngine {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn TriggerStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            clock,
            tick_interval: Duration::from_secs(1),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Load persisted trigger state. Call once before the first tick.
    pub async fn load(&self) -> Result<usize> {
        let states = self.store.load_all().await?;
        let mut cache = self.cache.lock().await;
        for state in states {
            cache.insert(
                state.trigger_id.clone(),
                Tracked {
                    state,
                    schedule: None,
                },
            );
        }
        info!(count = cache.len(), "Loaded trigger state");
        Ok(cache.len())
    }

    /// Current state of one trigger, if the engine tracks it.
    pub async fn state(&self, trigger_id: &TriggerId) -> Option<TriggerState> {
        self.cache
            .lock()
            .await
            .get(trigger_id)
            .map(|t| t.state.clone())
    }

    /// Fire every trigger due at `now`, sending one event per trigger to `sink`.
    ///
    /// Each fire is awaited until acknowledged; only then is the trigger's
    /// next fire time committed. Returns the number of triggers fired.
    pub async fn tick(&self, now: DateTime<Utc>, sink: &mpsc::Sender<PendingFire>) -> Result<usize> {
        let mut cache = self.cache.lock().await;
        let due = self.reconcile(&mut cache, now).await;

        let mut fired = 0;
        for (trigger_id, scheduled_for, params) in due {
            let Some(tracked) = cache.get(&trigger_id) else {
                continue;
            };
            let Some(schedule) = tracked.schedule.clone() else {
                continue;
            };

            let event = FireEvent {
                trigger_id: trigger_id.clone(),
                pipeline_id: tracked.state.pipeline_id.clone(),
                scheduled_for,
                fired_at: now,
                params,
            };
            let (ack, acked) = oneshot::channel();
            if sink.send(PendingFire { event, ack }).await.is_err() {
                warn!("Fire sink closed, stopping tick");
                break;
            }
            match acked.await {
                Ok(true) => {}
                Ok(false) => {
                    // Not handled; the trigger stays due and fires again.
                    warn!(trigger_id = %trigger_id, "Fire not handled, will retry");
                    continue;
                }
                Err(_) => {
                    warn!(trigger_id = %trigger_id, "Fire dropped before it was handled, stopping tick");
                    break;
                }
            }

            let next = state_after_fire(&tracked.state, &schedule, scheduled_for, now);
            if let Err(e) = self.store.save(&next).await {
                // Keep the old state; the trigger fires again next tick.
                error!(trigger_id = %trigger_id, error = %e, "Failed to save trigger state");
                continue;
            }

            debug!(
                trigger_id = %trigger_id,
                scheduled_for = %scheduled_for,
                next_fire_at = ?next.next_fire_at,
                "Trigger fired"
            );
            let payload = TriggerFiredPayload {
                trigger_id: trigger_id.clone(),
                pipeline_id: next.pipeline_id.clone(),
                scheduled_for,
                next_fire_at: next.next_fire_at,
                fired_at: now,
            };
            if let Some(tracked) = cache.get_mut(&trigger_id) {
                tracked.state = next;
            }
            if let Err(e) = self.bus.publish(Event::TriggerFired(payload)).await {
                warn!(error = %e, "Failed to publish trigger event");
            }
            fired += 1;
        }

        Ok(fired)
    }

    /// Tick until `shutdown` is cancelled.
    ///
    /// The sink is dropped on return, which lets the receiver drain and stop.
    pub async fn run(self: Arc<Self>, sink: mpsc::Sender<PendingFire>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Trigger engine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(self.clock.now(), &sink).await {
                        error!(error = %e, "Trigger tick failed");
                    }
                }
            }
        }
        info!("Trigger engine stopped");
    }

    /// Bring the cache in line with the registry and collect due triggers.
    async fn reconcile(
        &self,
        cache: &mut BTreeMap<TriggerId, Tracked>,
        now: DateTime<Utc>,
    ) -> Vec<(TriggerId, DateTime<Utc>, Params)> {
        let mut seen = HashSet::new();
        let mut due = Vec::new();

        for registered in self.registry.list().await {
            let definition = registered.definition();
            for trigger in &definition.triggers {
                let trigger_id = definition.trigger_id(trigger);
                seen.insert(trigger_id.clone());

                let tracked = cache.get(&trigger_id);
                let stale = tracked.is_none_or(|t| t.schedule.as_ref() != Some(&trigger.schedule));
                if stale {
                    let state = match tracked {
                        // Loaded from the store: trust the persisted next fire.
                        Some(t) if t.schedule.is_none() && t.state.next_fire_at.is_some() => {
                            t.state.clone()
                        }
                        Some(t) => TriggerState {
                            next_fire_at: triggers::first_fire(&trigger.schedule, now),
                            ..t.state.clone()
                        },
                        None => TriggerState {
                            trigger_id: trigger_id.clone(),
                            pipeline_id: definition.id.clone(),
                            next_fire_at: triggers::first_fire(&trigger.schedule, now),
                            last_fired_at: None,
                        },
                    };
                    if tracked.is_none_or(|t| t.state != state) {
                        if let Err(e) = self.store.save(&state).await {
                            error!(trigger_id = %trigger_id, error = %e, "Failed to save trigger state");
                            continue;
                        }
                    }
                    debug!(trigger_id = %trigger_id, next_fire_at = ?state.next_fire_at, "Tracking trigger");
                    cache.insert(
                        trigger_id.clone(),
                        Tracked {
                            state,
                            schedule: Some(trigger.schedule.clone()),
                        },
                    );
                }

                if trigger.paused || matches!(trigger.schedule, Schedule::Manual) {
                    continue;
                }
                if let Some(next) = cache.get(&trigger_id).and_then(|t| t.state.next_fire_at)
                    && next <= now
                {
                    due.push((trigger_id, next, trigger.params.clone()));
                }
            }
        }

        let removed: Vec<TriggerId> = cache
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for trigger_id in removed {
            match self.store.delete(&trigger_id).await {
                Ok(()) => {
                    info!(trigger_id = %trigger_id, "Dropped trigger no longer registered");
                    cache.remove(&trigger_id);
                }
                Err(e) => error!(trigger_id = %trigger_id, error = %e, "Failed to delete trigger state"),
            }
        }

        due
    }
}

fn state_after_fire(
    state: &TriggerState,
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TriggerState {
    TriggerState {
        next_fire_at: triggers::next_fire(schedule, scheduled_for, now),
        last_fired_at: Some(now),
        ..state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::StreamExt;
    use sluice_bus::InMemoryEventBus;
    use sluice_core::clock::ManualClock;
    use sluice_core::events::SubscriptionScope;
    use sluice_core::pipeline::{
        CatchUp, OverlapPolicy, PipelineDefinition, TaskDefinition, TaskKind, TriggerDefinition,
    };
    use sluice_store::InMemoryTriggerStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trigger(name: &str, schedule: Schedule) -> TriggerDefinition {
        TriggerDefinition {
            name: name.to_string(),
            description: None,
            schedule,
            params: Params::new(),
            paused: false,
        }
    }

    fn pipeline(triggers: Vec<TriggerDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            id: PipelineId::new("etl"),
            name: None,
            description: None,
            tasks: vec![TaskDefinition {
                name: "a".to_string(),
                description: None,
                run: TaskKind::Noop,
                depends_on: vec![],
                retry: None,
                timeout_secs: None,
            }],
            triggers,
            params: Params::new(),
            overlap: OverlapPolicy::default(),
            max_concurrent_tasks: None,
        }
    }

    fn every(secs: u64) -> Schedule {
        Schedule::Interval {
            every_secs: secs,
            catch_up: CatchUp::Skip,
            start_at: None,
        }
    }

    struct Harness {
        engine: TriggerEngine,
        registry: Arc<PipelineRegistry>,
        store: Arc<InMemoryTriggerStore>,
        bus: Arc<InMemoryEventBus>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(t(0)));
        let registry = Arc::new(PipelineRegistry::new(clock.clone()));
        let store = Arc::new(InMemoryTriggerStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = TriggerEngine::new(registry.clone(), store.clone(), bus.clone(), clock);
        Harness {
            engine,
            registry,
            store,
            bus,
        }
    }

    type Fired = Arc<std::sync::Mutex<Vec<FireEvent>>>;

    /// Receives fires, records them and answers each one with `handled`.
    fn recording_sink(handled: bool) -> (mpsc::Sender<PendingFire>, Fired) {
        let (tx, mut rx) = mpsc::channel::<PendingFire>(16);
        let fired: Fired = Arc::default();
        let recorded = fired.clone();
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                recorded.lock().unwrap().push(pending.event.clone());
                pending.ack(handled);
            }
        });
        (tx, fired)
    }

    fn etl_trigger(name: &str) -> TriggerId {
        TriggerId::for_trigger(&PipelineId::new("etl"), name)
    }

    #[tokio::test]
    async fn test_interval_fires_once_after_missed_ticks() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("every-minute", every(60))]))
            .await
            .unwrap();
        let (tx, fired) = recording_sink(true);

        assert_eq!(h.engine.tick(t(0), &tx).await.unwrap(), 0);
        assert_eq!(
            h.engine.state(&etl_trigger("every-minute")).await.unwrap().next_fire_at,
            Some(t(60))
        );

        // Engine was asleep through 60 and 120.
        assert_eq!(h.engine.tick(t(125), &tx).await.unwrap(), 1);
        {
            let fired = fired.lock().unwrap();
            assert_eq!(fired.len(), 1);
            assert_eq!(fired[0].scheduled_for, t(60));
            assert_eq!(fired[0].fired_at, t(125));
        }

        let state = h.engine.state(&etl_trigger("every-minute")).await.unwrap();
        assert_eq!(state.next_fire_at, Some(t(180)));
        assert_eq!(state.last_fired_at, Some(t(125)));

        // Durable state matches what the engine holds.
        let stored = h.store.load_all().await.unwrap();
        assert_eq!(stored, vec![state]);
    }

    #[tokio::test]
    async fn test_manual_and_paused_triggers_never_fire() {
        let h = harness();
        let mut paused = trigger("paused", every(10));
        paused.paused = true;
        h.registry
            .register(pipeline(vec![trigger("on-demand", Schedule::Manual), paused]))
            .await
            .unwrap();
        let (tx, fired) = recording_sink(true);

        h.engine.tick(t(0), &tx).await.unwrap();
        assert_eq!(h.engine.tick(t(10_000), &tx).await.unwrap(), 0);
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(
            h.engine.state(&etl_trigger("on-demand")).await.unwrap().next_fire_at,
            None
        );
    }

    #[tokio::test]
    async fn test_publishes_trigger_fired() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("fast", every(5))]))
            .await
            .unwrap();
        let mut events = h.bus.subscribe(SubscriptionScope::All).await.unwrap();
        let (tx, _fired) = recording_sink(true);

        h.engine.tick(t(0), &tx).await.unwrap();
        h.engine.tick(t(5), &tx).await.unwrap();

        match events.next().await.unwrap() {
            Event::TriggerFired(p) => {
                assert_eq!(p.trigger_id, etl_trigger("fast"));
                assert_eq!(p.scheduled_for, t(5));
                assert_eq!(p.next_fire_at, Some(t(10)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_state() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("hourly", every(3600))]))
            .await
            .unwrap();
        h.store
            .save(&TriggerState {
                trigger_id: etl_trigger("hourly"),
                pipeline_id: PipelineId::new("etl"),
                next_fire_at: Some(t(30)),
                last_fired_at: Some(t(-3570)),
            })
            .await
            .unwrap();
        h.engine.load().await.unwrap();

        let (tx, fired) = recording_sink(true);
        assert_eq!(h.engine.tick(t(31), &tx).await.unwrap(), 1);
        assert_eq!(fired.lock().unwrap()[0].scheduled_for, t(30));
    }

    #[tokio::test]
    async fn test_schedule_change_and_removal() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("tick", every(60))]))
            .await
            .unwrap();
        let (tx, _fired) = recording_sink(true);
        h.engine.tick(t(0), &tx).await.unwrap();

        h.registry
            .register(pipeline(vec![trigger("tick", every(10))]))
            .await
            .unwrap();
        h.engine.tick(t(1), &tx).await.unwrap();
        assert_eq!(
            h.engine.state(&etl_trigger("tick")).await.unwrap().next_fire_at,
            Some(t(11))
        );

        h.registry.register(pipeline(vec![])).await.unwrap();
        h.engine.tick(t(2), &tx).await.unwrap();
        assert!(h.engine.state(&etl_trigger("tick")).await.is_none());
        assert!(h.store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_sink_keeps_trigger_due() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("fast", every(5))]))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        h.engine.tick(t(0), &tx).await.unwrap();
        drop(rx);

        assert_eq!(h.engine.tick(t(5), &tx).await.unwrap(), 0);
        assert_eq!(
            h.engine.state(&etl_trigger("fast")).await.unwrap().next_fire_at,
            Some(t(5))
        );
    }

    #[tokio::test]
    async fn test_unhandled_fire_is_not_committed() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("fast", every(5))]))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel::<PendingFire>(4);
        // Takes the fire off the channel, then goes away without handling it.
        let receiver = tokio::spawn(async move {
            let pending = rx.recv().await;
            drop(pending);
            drop(rx);
        });

        h.engine.tick(t(0), &tx).await.unwrap();
        assert_eq!(h.engine.tick(t(5), &tx).await.unwrap(), 0);
        receiver.await.unwrap();

        let stored = h.store.load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].next_fire_at, Some(t(5)));
        assert_eq!(stored[0].last_fired_at, None);

        // A fresh engine over the same store replays the fire.
        let clock = Arc::new(ManualClock::new(t(6)));
        let restarted = TriggerEngine::new(h.registry.clone(), h.store.clone(), h.bus.clone(), clock);
        restarted.load().await.unwrap();
        let (tx, fired) = recording_sink(true);
        assert_eq!(restarted.tick(t(6), &tx).await.unwrap(), 1);
        assert_eq!(fired.lock().unwrap()[0].scheduled_for, t(5));
    }

    #[tokio::test]
    async fn test_rejected_fire_retries_next_tick() {
        let h = harness();
        h.registry
            .register(pipeline(vec![trigger("fast", every(5))]))
            .await
            .unwrap();
        let (refusing, refused) = recording_sink(false);
        h.engine.tick(t(0), &refusing).await.unwrap();
        assert_eq!(h.engine.tick(t(5), &refusing).await.unwrap(), 0);
        assert_eq!(refused.lock().unwrap().len(), 1);
        assert_eq!(
            h.engine.state(&etl_trigger("fast")).await.unwrap().next_fire_at,
            Some(t(5))
        );

        let (tx, fired) = recording_sink(true);
        assert_eq!(h.engine.tick(t(6), &tx).await.unwrap(), 1);
        assert_eq!(fired.lock().unwrap()[0].scheduled_for, t(5));
        assert_eq!(
            h.engine.state(&etl_trigger("fast")).await.unwrap().next_fire_at,
            Some(t(10))
        );
    }
}
