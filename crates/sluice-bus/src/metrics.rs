//! Metrics for event bus observability.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the event bus.
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Total events published.
    pub events_published: AtomicU64,
    /// Total deliveries into subscriber buffers.
    pub events_delivered: AtomicU64,
    /// Subscribers dropped because their buffer was full.
    pub subscribers_dropped: AtomicU64,
    /// Subscribers currently attached.
    pub active_subscribers: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, deliveries: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.events_delivered.fetch_add(deliveries, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_subscribers(&self, count: usize) {
        self.active_subscribers.store(count as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_delivered: u64,
    pub subscribers_dropped: u64,
    pub active_subscribers: u64,
}
