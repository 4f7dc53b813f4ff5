//! Handler registry: `(action_name, action_function)` to callable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::handlers::console::ConsoleHandler;

/// What a handler invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Exit 0 / normal completion, with captured stdout where available.
    Success { stdout: Option<String> },
    /// The handler ran and failed. `retryable` decides requeue vs drop.
    Failure { message: String, retryable: bool },
    /// The wall-clock budget elapsed and the handler was cancelled.
    Timeout,
}

/// A registered action implementation.
///
/// Handlers are invoked from any worker slot and must not assume thread
/// affinity.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the action with the task's opaque configuration, finishing
    /// within `timeout`.
    async fn invoke(&self, configuration: &[u8], timeout: Duration) -> HandlerOutcome;
}

/// Process-local handler table, populated once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock registry: the `Console` family with its shell and
    /// PowerShell interpreters.
    #[must_use]
    pub fn with_console_handlers() -> Self {
        let mut registry = Self::new();
        registry.register("Console", "run_console", Arc::new(ConsoleHandler::shell()));
        registry.register(
            "Console",
            "run_powershell",
            Arc::new(ConsoleHandler::powershell()),
        );
        registry
    }

    pub fn register(
        &mut self,
        action_name: impl Into<String>,
        action_function: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.handlers
            .insert((action_name.into(), action_function.into()), handler);
    }

    pub fn resolve(&self, action_name: &str, action_function: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(action_name.to_string(), action_function.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn invoke(&self, _configuration: &[u8], _timeout: Duration) -> HandlerOutcome {
            HandlerOutcome::Success { stdout: None }
        }
    }

    #[test]
    fn console_family_is_registered() {
        let registry = HandlerRegistry::with_console_handlers();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("Console", "run_console").is_some());
        assert!(registry.resolve("Console", "run_powershell").is_some());
        assert!(registry.resolve("Console", "run_python").is_none());
        assert!(registry.resolve("Sql", "run_console").is_none());
    }

    #[tokio::test]
    async fn custom_registrations_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register("Custom", "noop", Arc::new(NoopHandler));

        let handler = registry.resolve("Custom", "noop").unwrap();
        let outcome = handler.invoke(b"", Duration::from_secs(1)).await;
        assert_eq!(outcome, HandlerOutcome::Success { stdout: None });
    }
}
