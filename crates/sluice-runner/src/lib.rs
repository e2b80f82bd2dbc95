//! Task execution sandbox for Sluice.
//!
//! Tasks are dispatched by kind to a [`TaskHandler`]. The built-in handlers
//! cover shell commands, sleeping and no-ops; embedding applications register
//! their own handlers for `custom` tasks.

pub mod builtin;
pub mod handler;
pub mod registry;
pub mod shell;

pub use builtin::{NoopHandler, SleepHandler};
pub use handler::{TaskContext, TaskError, TaskHandler, TaskOutput};
pub use registry::HandlerRegistry;
pub use shell::ShellHandler;
