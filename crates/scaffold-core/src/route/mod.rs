//! Label-based routing of tasks to handler registry keys.
//!
//! The router returns a key, not a handler: callers resolve the key
//! through the [`crate::handler::HandlerRegistry`], falling back to the
//! default route with a warning when the key is unknown there.

use std::collections::HashMap;

use scaffold_backlog::TaskSpec;

/// Registry key of the default coding-agent handler.
pub const CLAUDE_CODE: &str = "claude_code";
/// Registry key of the manual-action handler.
pub const MANUAL: &str = "manual";

/// Deterministic label -> handler-key routing.
#[derive(Debug, Clone)]
pub struct TaskRouter {
    routes: HashMap<String, String>,
}

impl Default for TaskRouter {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert("user-action".to_string(), MANUAL.to_string());
        Self { routes }
    }
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom route: tasks carrying `label` go to the handler
    /// registered under `route`. Replaces any existing route for the
    /// label.
    pub fn register(&mut self, label: impl Into<String>, route: impl Into<String>) {
        self.routes.insert(label.into(), route.into());
    }

    /// Pick the route for a task. The first matching label in the task's
    /// own label order wins; unlabeled (or unrouted) tasks go to the
    /// default coding-agent handler.
    pub fn route(&self, task: &TaskSpec) -> &str {
        for label in &task.labels {
            if let Some(route) = self.routes.get(label) {
                return route;
            }
        }
        CLAUDE_CODE
    }
}
