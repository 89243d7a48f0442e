//! The `BacklogAdapter` trait: the narrow seam between the orchestrator
//! core and whatever store holds the task backlog.
//!
//! The core guarantees it never mutates a task it did not observe via
//! [`BacklogAdapter::get_task`], and never issues status transitions
//! outside the orchestrator's transition matrix. Adapters only have to be
//! faithful about reads, status writes, and note appends.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{TaskSpec, TaskStatus};

/// Errors surfaced by backlog adapters.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// No task with the given id exists in the backlog.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The stored task record did not parse cleanly.
    #[error("invalid task record for {task_id}: {message}")]
    Parse { task_id: String, message: String },

    /// An underlying I/O failure while reading or writing the store.
    #[error("backlog I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other adapter-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Filter for [`BacklogAdapter::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Restrict to tasks with this status.
    pub status: Option<TaskStatus>,
    /// Restrict to tasks carrying at least one of these labels.
    pub labels: Option<Vec<String>>,
    /// Drop tasks with any dependency that is missing or not `Done`.
    pub dependencies_satisfied: bool,
    /// Cap on the number of returned tasks (applied after filtering).
    pub limit: Option<usize>,
}

impl TaskQuery {
    /// The query the orchestrator issues every fetch cycle.
    pub fn eligible() -> Self {
        Self {
            status: Some(TaskStatus::ToDo),
            labels: None,
            dependencies_satisfied: true,
            limit: None,
        }
    }
}

/// Read/write access to the external task backlog.
#[async_trait]
pub trait BacklogAdapter: Send + Sync {
    /// List tasks matching the query.
    ///
    /// When `query.dependencies_satisfied` is set, tasks whose any
    /// dependency is missing or not `Done` are dropped. Malformed records
    /// are skipped and logged, never surfaced to the caller.
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskSpec>, BacklogError>;

    /// Fetch a single task by id.
    async fn get_task(&self, task_id: &str) -> Result<TaskSpec, BacklogError>;

    /// Transition a task's status. Writing the current status is a no-op.
    async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
    ) -> Result<(), BacklogError>;

    /// Append a line of text to the task's implementation notes.
    ///
    /// Append is non-idempotent by design: appending the same text twice
    /// leaves two copies. Prior content is always preserved.
    async fn append_notes(&self, task_id: &str, text: &str) -> Result<(), BacklogError>;
}

// Compile-time assertion: the adapter must stay object-safe so it can be
// injected as `Arc<dyn BacklogAdapter>`.
const _: () = {
    fn _assert_object_safe(_: &dyn BacklogAdapter) {}
};

/// Shared dependency filter used by adapters and the fetcher's post-filter.
///
/// A dependency is satisfied only when it resolves and is `Done`; a missing
/// referenced task counts as unsatisfied.
pub fn dependencies_satisfied(
    task: &TaskSpec,
    lookup: impl Fn(&str) -> Option<TaskStatus>,
) -> bool {
    task.dependencies.iter().all(|dep_id| {
        matches!(lookup(dep_id), Some(TaskStatus::Done))
    })
}
