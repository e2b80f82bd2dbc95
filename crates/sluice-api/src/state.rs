//! Application state shared across handlers.

use sluice_bus::InMemoryEventBus;
use sluice_scheduler::Scheduler;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Broadcaster metrics for the readiness report, when the bus is local.
    pub bus: Option<Arc<InMemoryEventBus>>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<InMemoryEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}
