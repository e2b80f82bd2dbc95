//! Pipeline scheduling and orchestration for Sluice.
//!
//! The [`Scheduler`] ties together the pipeline registry, the trigger engine
//! and the run executor. Each piece can also be driven on its own, which is
//! how the tests exercise them.

pub mod dag;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagError, PipelineDag};
pub use engine::{FireEvent, PendingFire, TriggerEngine};
pub use executor::{ExecutorConfig, RunExecutor};
pub use registry::{PipelineRegistry, RegisteredPipeline};
pub use scheduler::{Scheduler, SchedulerConfig, Stores, TriggerInfo};
