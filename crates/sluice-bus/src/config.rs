//! Configuration for the event bus.

/// Configuration for the in-process event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events buffered per subscriber before it is considered too slow and dropped.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

impl BusConfig {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self { subscriber_buffer }
    }

    /// Set the per-subscriber buffer. Clamped to at least one event.
    pub fn with_subscriber_buffer(mut self, size: usize) -> Self {
        self.subscriber_buffer = size.max(1);
        self
    }
}
