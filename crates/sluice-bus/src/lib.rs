//! Status broadcaster for Sluice.
//!
//! Fans run and task events out to live subscribers. Delivery is
//! best-effort: the durable record lives in the run store.

mod bus;
pub mod config;
pub mod health;
pub mod metrics;

pub use bus::InMemoryEventBus;
pub use config::BusConfig;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{BusMetrics, MetricsSnapshot};
