//! Handler registry -- a named collection of available handlers.
//!
//! The orchestrator resolves the route key produced by the
//! [`crate::route::TaskRouter`] through this registry at dispatch time.

use std::collections::HashMap;

use super::trait_def::Handler;

/// A collection of registered [`Handler`] implementations, keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the name it reports.
    ///
    /// An existing handler with the same name is replaced and returned.
    pub fn register(&mut self, handler: impl Handler + 'static) -> Option<Box<dyn Handler>> {
        let name = handler.name().to_string();
        self.handlers.insert(name, Box::new(handler))
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.handlers.get(name).map(|b| b.as_ref())
    }

    /// Names of all registered handlers, in no particular order.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::types::ExecutionResult;
    use async_trait::async_trait;
    use scaffold_backlog::TaskSpec;
    use std::path::Path;
    use std::time::Duration;

    struct FakeHandler {
        handler_name: String,
    }

    impl FakeHandler {
        fn new(name: &str) -> Self {
            Self {
                handler_name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Handler for FakeHandler {
        fn name(&self) -> &str {
            &self.handler_name
        }

        async fn execute(
            &self,
            _task: &TaskSpec,
            _worktree_path: &Path,
            _timeout: Duration,
        ) -> ExecutionResult {
            ExecutionResult::failure("fake", 0, 0.0)
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register(FakeHandler::new("alpha")).is_none());
        assert_eq!(registry.get("alpha").unwrap().name(), "alpha");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register(FakeHandler::new("alpha"));
        let old = registry.register(FakeHandler::new("alpha"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = HandlerRegistry::new();
        registry.register(FakeHandler::new("alpha"));
        registry.register(FakeHandler::new("beta"));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }
}
