//! File-based backlog: one Markdown file per task with YAML frontmatter.
//!
//! Layout, matching the Backlog.md convention the orchestrator grew up
//! next to:
//!
//! ```text
//! backlog/tasks/task-42.md
//! ---
//! id: task-42
//! title: "BUILD: Add widget"
//! status: To Do
//! priority: high
//! labels: [build]
//! dependencies: []
//! created_date: 2026-07-01T00:00:00Z
//! ---
//!
//! ## Description
//! ...
//!
//! ## Acceptance Criteria
//! - [ ] Widget renders
//!
//! ## Implementation Notes
//! ...
//! ```
//!
//! Mutations re-render the whole file and replace it atomically (temp file
//! plus rename), so a crash mid-write leaves the previous version intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::{BacklogAdapter, BacklogError, TaskQuery, dependencies_satisfied};
use crate::model::{Priority, TaskSpec, TaskStatus};

/// YAML frontmatter schema of a task file.
#[derive(Debug, Serialize, Deserialize)]
struct Frontmatter {
    id: String,
    title: String,
    status: TaskStatus,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_date: Option<DateTime<Utc>>,
}

/// Backlog stored as `<tasks_dir>/<task_id>.md` files.
#[derive(Debug)]
pub struct MarkdownBacklog {
    tasks_dir: PathBuf,
    /// Serializes read-modify-write cycles on task files.
    write_lock: Mutex<()>,
}

impl MarkdownBacklog {
    /// Open a backlog rooted at an explicit tasks directory.
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Conventional location under a repository root: `backlog/tasks/`.
    pub fn discover(repo_root: &Path) -> Self {
        Self::new(repo_root.join("backlog").join("tasks"))
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{task_id}.md"))
    }

    fn read_task(&self, task_id: &str) -> Result<TaskSpec, BacklogError> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Err(BacklogError::NotFound(task_id.to_string()));
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| BacklogError::Io {
            message: format!("failed to read {}", path.display()),
            source: e,
        })?;
        parse_task_file(task_id, &contents)
    }

    fn write_task(&self, task: &TaskSpec) -> Result<(), BacklogError> {
        let path = self.task_path(&task.id);
        let rendered = render_task_file(task).map_err(|e| BacklogError::Parse {
            task_id: task.id.clone(),
            message: e,
        })?;

        let tmp = self.tasks_dir.join(format!(".{}.md.tmp", task.id));
        std::fs::write(&tmp, rendered).map_err(|e| BacklogError::Io {
            message: format!("failed to write {}", tmp.display()),
            source: e,
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| BacklogError::Io {
            message: format!("failed to replace {}", path.display()),
            source: e,
        })
    }

    /// Create a task file. Used by fixtures and operators, not by the core.
    pub fn put_task(&self, task: &TaskSpec) -> Result<(), BacklogError> {
        std::fs::create_dir_all(&self.tasks_dir).map_err(|e| BacklogError::Io {
            message: format!("failed to create {}", self.tasks_dir.display()),
            source: e,
        })?;
        self.write_task(task)
    }

    /// Parse every task file in the directory, skipping malformed ones.
    fn load_all(&self) -> Result<Vec<TaskSpec>, BacklogError> {
        let entries = std::fs::read_dir(&self.tasks_dir).map_err(|e| BacklogError::Io {
            message: format!("failed to read {}", self.tasks_dir.display()),
            source: e,
        })?;

        let mut tasks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BacklogError::Io {
                message: "failed to read directory entry".to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_task(stem) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(task_id = stem, error = %e, "skipping malformed task file");
                }
            }
        }
        // Directory order is unspecified; give callers something stable.
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

#[async_trait]
impl BacklogAdapter for MarkdownBacklog {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskSpec>, BacklogError> {
        let all = self.load_all()?;
        let by_id: HashMap<&str, TaskStatus> =
            all.iter().map(|t| (t.id.as_str(), t.status)).collect();

        let mut out: Vec<TaskSpec> = all
            .iter()
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                !query.dependencies_satisfied
                    || dependencies_satisfied(t, |id| by_id.get(id).copied())
            })
            .filter(|t| {
                query
                    .labels
                    .as_ref()
                    .is_none_or(|labels| labels.iter().any(|l| t.has_label(l)))
            })
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskSpec, BacklogError> {
        self.read_task(task_id)
    }

    async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
    ) -> Result<(), BacklogError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut task = self.read_task(task_id)?;
        if task.status == new_status {
            return Ok(());
        }
        task.status = new_status;
        self.write_task(&task)
    }

    async fn append_notes(&self, task_id: &str, text: &str) -> Result<(), BacklogError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut task = self.read_task(task_id)?;
        if task.implementation_notes.is_empty() {
            task.implementation_notes = text.to_string();
        } else {
            task.implementation_notes.push('\n');
            task.implementation_notes.push_str(text);
        }
        self.write_task(&task)
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Parse a task file: frontmatter plus the three known body sections.
fn parse_task_file(task_id: &str, contents: &str) -> Result<TaskSpec, BacklogError> {
    let (front, body) = split_frontmatter(contents).ok_or_else(|| BacklogError::Parse {
        task_id: task_id.to_string(),
        message: "missing YAML frontmatter delimiters".to_string(),
    })?;

    let fm: Frontmatter = serde_yaml::from_str(front).map_err(|e| BacklogError::Parse {
        task_id: task_id.to_string(),
        message: e.to_string(),
    })?;

    if fm.id != task_id {
        return Err(BacklogError::Parse {
            task_id: task_id.to_string(),
            message: format!("frontmatter id '{}' does not match file name", fm.id),
        });
    }

    let sections = split_sections(body);
    let description = sections.get("Description").cloned().unwrap_or_default();
    let acceptance_criteria = sections
        .get("Acceptance Criteria")
        .map(|s| parse_checklist(s))
        .unwrap_or_default();
    let implementation_notes = sections
        .get("Implementation Notes")
        .cloned()
        .unwrap_or_default();

    Ok(TaskSpec {
        id: fm.id,
        title: fm.title,
        description,
        status: fm.status,
        priority: fm.priority,
        labels: fm.labels,
        dependencies: fm.dependencies,
        acceptance_criteria,
        created_date: fm.created_date,
        implementation_notes,
    })
}

/// Split `---\n<yaml>\n---\n<body>`; returns `(yaml, body)`.
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let rest = contents.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    Some((front, body))
}

/// Split the Markdown body into `## `-headed sections.
fn split_sections(body: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = String::new();

    let mut flush = |name: &Option<String>, buf: &mut String, out: &mut HashMap<String, String>| {
        if let Some(name) = name {
            out.insert(name.clone(), buf.trim().to_string());
        }
        buf.clear();
    };

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            flush(&current, &mut buf, &mut sections);
            current = Some(heading.trim().to_string());
        } else if current.is_some() {
            buf.push_str(line);
            buf.push('\n');
        }
    }
    flush(&current, &mut buf, &mut sections);
    sections
}

/// Pull the item text out of `- [ ]` / `- [x]` / `- ` checklist lines.
fn parse_checklist(section: &str) -> Vec<String> {
    section
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- [ ] ")
                .or_else(|| line.strip_prefix("- [x] "))
                .or_else(|| line.strip_prefix("- "))
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Render a task back into the canonical file layout.
fn render_task_file(task: &TaskSpec) -> Result<String, String> {
    let fm = Frontmatter {
        id: task.id.clone(),
        title: task.title.clone(),
        status: task.status,
        priority: task.priority,
        labels: task.labels.clone(),
        dependencies: task.dependencies.clone(),
        created_date: task.created_date,
    };
    let yaml = serde_yaml::to_string(&fm).map_err(|e| e.to_string())?;

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&yaml);
    out.push_str("---\n\n");

    out.push_str("## Description\n\n");
    if !task.description.is_empty() {
        out.push_str(task.description.trim_end());
        out.push('\n');
    }
    out.push('\n');

    out.push_str("## Acceptance Criteria\n\n");
    for criterion in &task.acceptance_criteria {
        out.push_str("- [ ] ");
        out.push_str(criterion);
        out.push('\n');
    }
    out.push('\n');

    out.push_str("## Implementation Notes\n\n");
    if !task.implementation_notes.is_empty() {
        out.push_str(task.implementation_notes.trim_end());
        out.push('\n');
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> &'static str {
        "---\n\
         id: task-1\n\
         title: \"BUILD: Add parser\"\n\
         status: To Do\n\
         priority: high\n\
         labels:\n\
         - build\n\
         dependencies:\n\
         - task-0\n\
         ---\n\
         \n\
         ## Description\n\
         \n\
         Build the parser.\n\
         \n\
         ## Acceptance Criteria\n\
         \n\
         - [ ] Parses valid input\n\
         - [x] Rejects garbage\n\
         \n\
         ## Implementation Notes\n\
         \n\
         First attempt used nom.\n"
    }

    #[test]
    fn parse_full_task_file() {
        let task = parse_task_file("task-1", sample_file()).unwrap();
        assert_eq!(task.id, "task-1");
        assert_eq!(task.title, "BUILD: Add parser");
        assert_eq!(task.status, TaskStatus::ToDo);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.labels, vec!["build"]);
        assert_eq!(task.dependencies, vec!["task-0"]);
        assert_eq!(task.description, "Build the parser.");
        assert_eq!(
            task.acceptance_criteria,
            vec!["Parses valid input", "Rejects garbage"]
        );
        assert_eq!(task.implementation_notes, "First attempt used nom.");
    }

    #[test]
    fn parse_rejects_missing_frontmatter() {
        let err = parse_task_file("task-1", "## Description\nno frontmatter\n").unwrap_err();
        assert!(matches!(err, BacklogError::Parse { .. }));
    }

    #[test]
    fn parse_rejects_invalid_yaml() {
        let contents = "---\nid: task-1\ntitle: [unclosed\n---\nbody\n";
        let err = parse_task_file("task-1", contents).unwrap_err();
        let BacklogError::Parse { task_id, .. } = err else {
            panic!("expected Parse error");
        };
        assert_eq!(task_id, "task-1");
    }

    #[test]
    fn parse_rejects_id_mismatch() {
        let contents = "---\nid: task-2\ntitle: t\nstatus: Done\n---\n";
        let err = parse_task_file("task-1", contents).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn render_then_parse_round_trips() {
        let task = parse_task_file("task-1", sample_file()).unwrap();
        let rendered = render_task_file(&task).unwrap();
        let back = parse_task_file("task-1", &rendered).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn checklist_parses_plain_bullets_too() {
        let items = parse_checklist("- first\n- [ ] second\nnot a bullet\n");
        assert_eq!(items, vec!["first", "second"]);
    }

    // -- Adapter behavior over a real directory -----------------------------

    fn temp_backlog() -> (tempfile::TempDir, MarkdownBacklog) {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MarkdownBacklog::new(dir.path().join("tasks"));
        (dir, backlog)
    }

    fn seed(backlog: &MarkdownBacklog, id: &str, status: TaskStatus, deps: &[&str]) {
        let mut task = TaskSpec::new(id, format!("Task {id}"));
        task.status = status;
        task.dependencies = deps.iter().map(|s| s.to_string()).collect();
        backlog.put_task(&task).unwrap();
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let (_dir, backlog) = temp_backlog();
        std::fs::create_dir_all(backlog.tasks_dir()).unwrap();
        let err = backlog.get_task("task-missing").await.unwrap_err();
        assert!(matches!(err, BacklogError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_status_and_dependencies() {
        let (_dir, backlog) = temp_backlog();
        seed(&backlog, "task-1", TaskStatus::Done, &[]);
        seed(&backlog, "task-2", TaskStatus::ToDo, &["task-1"]);
        seed(&backlog, "task-3", TaskStatus::ToDo, &["task-9"]);
        seed(&backlog, "task-4", TaskStatus::InProgress, &[]);

        let eligible = backlog.list_tasks(&TaskQuery::eligible()).await.unwrap();
        let ids: Vec<&str> = eligible.iter().map(|t| t.id.as_str()).collect();
        // task-3's dependency is unresolvable, task-4 is not To Do.
        assert_eq!(ids, vec!["task-2"]);
    }

    #[tokio::test]
    async fn list_label_filter_matches_any() {
        let (_dir, backlog) = temp_backlog();
        let mut a = TaskSpec::new("task-a", "a");
        a.labels = vec!["build".to_string()];
        let mut b = TaskSpec::new("task-b", "b");
        b.labels = vec!["fix".to_string()];
        backlog.put_task(&a).unwrap();
        backlog.put_task(&b).unwrap();

        let query = TaskQuery {
            status: Some(TaskStatus::ToDo),
            labels: Some(vec!["build".to_string(), "docs".to_string()]),
            dependencies_satisfied: false,
            limit: None,
        };
        let tasks = backlog.list_tasks(&query).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "task-a");
    }

    #[tokio::test]
    async fn malformed_file_is_skipped_not_fatal() {
        let (_dir, backlog) = temp_backlog();
        seed(&backlog, "task-1", TaskStatus::ToDo, &[]);
        std::fs::write(backlog.tasks_dir().join("task-bad.md"), "not a task").unwrap();

        let tasks = backlog.list_tasks(&TaskQuery::eligible()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "task-1");
    }

    #[tokio::test]
    async fn update_status_persists_and_is_noop_when_unchanged() {
        let (_dir, backlog) = temp_backlog();
        seed(&backlog, "task-1", TaskStatus::ToDo, &[]);

        backlog
            .update_status("task-1", TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(
            backlog.get_task("task-1").await.unwrap().status,
            TaskStatus::InProgress
        );

        // Writing the same status again must not error or change anything.
        backlog
            .update_status("task-1", TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(
            backlog.get_task("task-1").await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn append_notes_preserves_and_duplicates() {
        let (_dir, backlog) = temp_backlog();
        seed(&backlog, "task-1", TaskStatus::ToDo, &[]);

        backlog.append_notes("task-1", "tried X").await.unwrap();
        backlog.append_notes("task-1", "tried X").await.unwrap();

        let notes = backlog.get_task("task-1").await.unwrap().implementation_notes;
        assert_eq!(notes, "tried X\ntried X");
    }
}
