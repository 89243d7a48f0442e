//! Handler for tasks that need a human.
//!
//! Tasks labeled `user-action` route here. The handler invokes nothing:
//! it reports a non-success result whose error marks the task as out of
//! scope for autonomous execution, and the result processor transitions
//! the task to `Blocked` rather than counting it as a failure.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use scaffold_backlog::TaskSpec;
use tracing::info;

use super::trait_def::Handler;
use super::types::ExecutionResult;

pub const MANUAL_ACTION_ERROR: &str = "requires manual action";

#[derive(Debug, Default, Clone)]
pub struct ManualHandler;

impl ManualHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ManualHandler {
    fn name(&self) -> &str {
        crate::route::MANUAL
    }

    async fn execute(
        &self,
        task: &TaskSpec,
        _worktree_path: &Path,
        _timeout: Duration,
    ) -> ExecutionResult {
        info!(task_id = %task.id, "task requires manual action, not executing");
        ExecutionResult::failure(MANUAL_ACTION_ERROR, 0, 0.0)
    }
}
