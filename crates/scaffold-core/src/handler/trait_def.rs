//! The `Handler` trait -- the adapter interface for task executors.
//!
//! Each concrete handler wraps one way of getting a task done (the
//! coding-agent CLI, a manual-action marker, custom integrations). The
//! trait is object-safe so handlers can live in the
//! [`super::HandlerRegistry`] as `Box<dyn Handler>`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use scaffold_backlog::TaskSpec;

use super::types::ExecutionResult;

/// Executes a single task inside a worktree.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registry key and display name (e.g. "claude_code").
    fn name(&self) -> &str;

    /// Run the task to completion, honoring the wall-clock timeout.
    ///
    /// Implementations never return a Rust error: failures of any kind
    /// (including spawn errors and timeouts) are reported through
    /// [`ExecutionResult::success`] and [`ExecutionResult::error`].
    async fn execute(
        &self,
        task: &TaskSpec,
        worktree_path: &Path,
        timeout: Duration,
    ) -> ExecutionResult;
}

// Compile-time assertion: Handler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    /// Trivial handler proving the trait is implementable and usable as
    /// `dyn Handler`.
    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(
            &self,
            _task: &TaskSpec,
            _worktree_path: &Path,
            _timeout: Duration,
        ) -> ExecutionResult {
            ExecutionResult::failure("noop", 0, 0.0)
        }
    }

    #[tokio::test]
    async fn handler_is_object_safe_and_callable() {
        let handler: Box<dyn Handler> = Box::new(NoopHandler);
        assert_eq!(handler.name(), "noop");

        let task = TaskSpec::new("task-1", "t");
        let result = handler
            .execute(&task, Path::new("/tmp"), Duration::from_secs(1))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("noop"));
    }
}
