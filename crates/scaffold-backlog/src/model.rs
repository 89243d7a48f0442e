//! Task records as stored in the backlog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a backlog task.
///
/// The serialized form matches the backlog's literal strings ("To Do",
/// "In Progress") rather than the Rust identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "To Do")]
    ToDo,
    #[serde(rename = "In Progress")]
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::ToDo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Done => "Done",
            TaskStatus::Blocked => "Blocked",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "To Do" | "ToDo" | "todo" => Ok(TaskStatus::ToDo),
            "In Progress" | "InProgress" | "in-progress" => Ok(TaskStatus::InProgress),
            "Done" | "done" => Ok(TaskStatus::Done),
            "Blocked" | "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Task priority. Feeds both the fetch scoring and cost estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// One unit of work as described by the backlog.
///
/// The orchestrator treats the record as immutable apart from `status`
/// and `implementation_notes`, both mutated only through a
/// [`crate::BacklogAdapter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque identifier, unique within the backlog (e.g. "task-42").
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Task ids that must be `Done` before this task is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    /// Free text appended across runs; never rewritten.
    #[serde(default)]
    pub implementation_notes: String,
}

impl TaskSpec {
    /// Minimal task used as a building block by tests and fixtures.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::ToDo,
            priority: Priority::default(),
            labels: Vec::new(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            created_date: None,
            implementation_notes: String::new(),
        }
    }

    /// Whether the task carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}
