//! In-process event bus with per-subscriber buffers.

use async_trait::async_trait;
use sluice_core::Result;
use sluice_core::events::{Event, SubscriptionScope};
use sluice_core::ports::{EventBus, EventStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::health::HealthCheck;
use crate::metrics::BusMetrics;

struct Subscriber {
    id: u64,
    scope: SubscriptionScope,
    tx: mpsc::Sender<Event>,
}

/// Event bus that fans events out to in-process subscribers.
///
/// Publishing never waits on a subscriber. A subscriber whose buffer is full
/// is disconnected; its stream ends and it must resubscribe and re-read state
/// from the run store.
#[derive(Clone)]
pub struct InMemoryEventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    config: BusConfig,
    metrics: Arc<BusMetrics>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            config,
            metrics: BusMetrics::new(),
        }
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    /// Get health check status.
    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(self.metrics.snapshot())
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;
        let mut delivered = 0u64;

        subscribers.retain(|sub| {
            if !sub.scope.matches(&event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, scope = %sub.scope, "Subscriber buffer full, disconnecting");
                    self.metrics.record_dropped();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "Subscriber went away");
                    false
                }
            }
        });

        self.metrics.record_publish(delivered);
        self.metrics.set_active_subscribers(subscribers.len());
        debug!(subject = %event.subject(), delivered, "Published event");
        Ok(())
    }

    async fn subscribe(&self, scope: SubscriptionScope) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, scope = %scope, "New subscriber");

        let mut subscribers = self.subscribers.write().await;
        subscribers.push(Subscriber { id, scope, tx });
        self.metrics.set_active_subscribers(subscribers.len());

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
