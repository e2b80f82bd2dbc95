//! Handler lookup by task kind.

use crate::builtin::{NoopHandler, SleepHandler};
use crate::handler::TaskHandler;
use crate::shell::ShellHandler;
use sluice_core::pipeline::TaskKind;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps handler names to task handlers.
///
/// Built-in kinds resolve by their kind name (`shell`, `sleep`, `noop`);
/// `custom` tasks resolve by their `handler` field.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the shell, sleep and noop handlers installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("shell", Arc::new(ShellHandler::default()));
        registry.register("sleep", Arc::new(SleepHandler));
        registry.register("noop", Arc::new(NoopHandler));
        registry
    }

    /// Install or replace a handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        debug!(handler = %name, "Registering task handler");
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn resolve(&self, kind: &TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind.handler_name()).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
