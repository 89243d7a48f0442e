//! Post-execution processing of handler results.
//!
//! On success: make sure everything is committed, push the task branch,
//! open a draft PR, record the PR on the worktree metadata, and transition
//! the task to Done. On failure: append a diagnostic note and release the
//! worktree. Manual-action results transition the task to Blocked without
//! touching the VCS.
//!
//! Backlog writes that fail are not lost: they come back to the caller as
//! deferred intents, re-attempted on later orchestrator iterations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scaffold_backlog::{BacklogAdapter, TaskSpec, TaskStatus};
use tracing::{error, info, warn};

use crate::handler::ExecutionResult;
use crate::handler::manual::MANUAL_ACTION_ERROR;
use crate::vcs::VcsAdapter;
use crate::worktree::{WorktreeManager, WorktreeStatus};

/// A backlog write that could not be performed and must be retried.
#[derive(Debug, Clone, PartialEq)]
pub enum BacklogIntent {
    SetStatus(TaskStatus),
    AppendNotes(String),
}

/// What the processor did with a handler result.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// Whether post-processing succeeded. For failed handler results this
    /// is always `false` so the caller records the failure.
    pub success: bool,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    /// Backlog writes that failed and should be re-attempted, paired with
    /// the task id they belong to.
    pub deferred: Vec<(String, BacklogIntent)>,
}

#[derive(Debug, Clone)]
pub struct ResultProcessorConfig {
    pub remote: String,
    pub base_branch: String,
    /// Backoff before the single push/PR retry.
    pub retry_backoff: Duration,
}

impl Default for ResultProcessorConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

pub struct ResultProcessor {
    backlog: Arc<dyn BacklogAdapter>,
    vcs: Arc<dyn VcsAdapter>,
    worktrees: WorktreeManager,
    config: ResultProcessorConfig,
}

impl ResultProcessor {
    pub fn new(
        backlog: Arc<dyn BacklogAdapter>,
        vcs: Arc<dyn VcsAdapter>,
        worktrees: WorktreeManager,
        config: ResultProcessorConfig,
    ) -> Self {
        Self {
            backlog,
            vcs,
            worktrees,
            config,
        }
    }

    /// Process one handler result. `route` is the handler registry key the
    /// task was dispatched to.
    pub async fn process(
        &self,
        task: &TaskSpec,
        worktree_path: &Path,
        result: &ExecutionResult,
        route: &str,
    ) -> ProcessOutcome {
        if !result.success && route == crate::route::MANUAL {
            return self.process_manual(task).await;
        }
        if !result.success {
            return self.process_failure(task, result).await;
        }
        self.process_success(task, worktree_path, result).await
    }

    /// Manual-action outcome: the task needs a human, not a retry.
    async fn process_manual(&self, task: &TaskSpec) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        self.write_status(task, TaskStatus::Blocked, &mut outcome).await;
        self.write_notes(
            task,
            &format!("Blocked: {MANUAL_ACTION_ERROR}"),
            &mut outcome,
        )
        .await;

        // The worktree is released but the branch is kept; only the
        // failure path deletes branches.
        if let Err(e) = self.worktrees.cleanup_worktree(&task.id, true, false) {
            warn!(task_id = %task.id, error = %e, "failed to clean up manual task worktree");
        }

        outcome.success = false;
        outcome.error = Some(MANUAL_ACTION_ERROR.to_string());
        outcome
    }

    /// Handler failure: note what happened and release the worktree. The
    /// task status is untouched so retry or escalation can proceed.
    async fn process_failure(&self, task: &TaskSpec, result: &ExecutionResult) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        let error = result.error.as_deref().unwrap_or("unknown error");

        let excerpt = output_excerpt(&result.output);
        let note = if excerpt.is_empty() {
            format!("Attempt failed: {error}")
        } else {
            format!("Attempt failed: {error}\nOutput: {excerpt}")
        };
        self.write_notes(task, &note, &mut outcome).await;

        if let Err(e) = self.worktrees.cleanup_worktree(&task.id, true, true) {
            warn!(task_id = %task.id, error = %e, "failed to clean up failed task worktree");
        }

        outcome.success = false;
        outcome.error = Some(error.to_string());
        outcome
    }

    /// Handler success: commit, push, open a draft PR, transition to Done.
    ///
    /// A failure at the commit/push/PR steps yields an overall failure
    /// with the worktree preserved for inspection and the task status
    /// unchanged.
    async fn process_success(
        &self,
        task: &TaskSpec,
        worktree_path: &Path,
        result: &ExecutionResult,
    ) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        // 1. Make sure everything the handler left behind is committed.
        //    The handler usually commits itself, so a clean tree is fine.
        let message = build_commit_message(task);
        if let Err(e) = self.vcs.stage_and_commit(worktree_path, &message).await {
            error!(task_id = %task.id, error = %e, "commit failed");
            outcome.error = Some(format!("commit failed: {e}"));
            return outcome;
        }

        // 2. Push the task branch, setting the upstream on first push.
        let branch = match self.branch_for(task, worktree_path).await {
            Ok(branch) => branch,
            Err(e) => {
                outcome.error = Some(format!("could not determine branch: {e}"));
                return outcome;
            }
        };
        if let Err(e) = self
            .with_single_retry(|| self.vcs.push(worktree_path, &self.config.remote, &branch, true))
            .await
        {
            error!(task_id = %task.id, error = %e, "push failed after retry");
            outcome.error = Some(format!("push failed: {e}"));
            return outcome;
        }

        // 3. Open the draft PR.
        let title = task.title.clone();
        let body = build_pr_body(task);
        let pr_url = match self
            .with_single_retry(|| {
                self.vcs.create_draft_pr(
                    worktree_path,
                    &title,
                    &body,
                    &branch,
                    &self.config.base_branch,
                )
            })
            .await
        {
            Ok(url) => url,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "PR creation failed after retry");
                outcome.error = Some(format!("PR creation failed: {e}"));
                return outcome;
            }
        };

        // 4. Record the hand-off on the worktree metadata.
        if let Err(e) = self.worktrees.update_worktree_status(
            &task.id,
            WorktreeStatus::Merged,
            Some(pr_url.clone()),
        ) {
            warn!(task_id = %task.id, error = %e, "could not record PR on worktree metadata");
        }

        // 5. Transition the task and leave a trail.
        self.write_status(task, TaskStatus::Done, &mut outcome).await;
        self.write_notes(
            task,
            &format!(
                "Completed: {pr_url} ({:.1}s elapsed, ${:.2})",
                result.duration_sec, result.cost_usd
            ),
            &mut outcome,
        )
        .await;

        info!(task_id = %task.id, pr_url = %pr_url, "task handed off for review");
        outcome.success = true;
        outcome.pr_url = Some(pr_url);
        outcome
    }

    /// Branch from the worktree metadata, falling back to asking git.
    async fn branch_for(
        &self,
        task: &TaskSpec,
        worktree_path: &Path,
    ) -> Result<String, crate::vcs::VcsError> {
        if let Some(meta) = self.worktrees.get(&task.id) {
            return Ok(meta.branch_name);
        }
        self.vcs.current_branch(worktree_path).await
    }

    async fn with_single_retry<T, F, Fut>(&self, op: F) -> Result<T, crate::vcs::VcsError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::vcs::VcsError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(error = %first, "VCS operation failed, retrying once");
                tokio::time::sleep(self.config.retry_backoff).await;
                op().await
            }
        }
    }

    async fn write_status(
        &self,
        task: &TaskSpec,
        status: TaskStatus,
        outcome: &mut ProcessOutcome,
    ) {
        if let Err(e) = self.backlog.update_status(&task.id, status).await {
            warn!(task_id = %task.id, error = %e, "status update failed, deferring");
            outcome
                .deferred
                .push((task.id.clone(), BacklogIntent::SetStatus(status)));
        }
    }

    async fn write_notes(&self, task: &TaskSpec, note: &str, outcome: &mut ProcessOutcome) {
        if let Err(e) = self.backlog.append_notes(&task.id, note).await {
            warn!(task_id = %task.id, error = %e, "notes append failed, deferring");
            outcome
                .deferred
                .push((task.id.clone(), BacklogIntent::AppendNotes(note.to_string())));
        }
    }
}

/// Short excerpt of captured output for notes (the tail, where failures
/// live).
fn output_excerpt(output: &str) -> String {
    const EXCERPT_CHARS: usize = 300;
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .skip(count - EXCERPT_CHARS)
        .collect();
    format!("...{tail}")
}

/// Commit type from the task's title prefix, falling back to its labels.
fn commit_type(task: &TaskSpec) -> &'static str {
    const PREFIXES: &[(&str, &str)] = &[
        ("BUILD", "feat"),
        ("FIX", "fix"),
        ("TEST", "test"),
        ("CLEANUP", "chore"),
        ("AUDIT", "docs"),
        ("DOCS", "docs"),
        ("REFACTOR", "refactor"),
    ];
    for (prefix, ty) in PREFIXES {
        if task.title.starts_with(&format!("{prefix}:")) {
            return ty;
        }
    }
    for (label, ty) in [
        ("build", "feat"),
        ("fix", "fix"),
        ("test", "test"),
        ("cleanup", "chore"),
        ("docs", "docs"),
        ("refactor", "refactor"),
    ] {
        if task.has_label(label) {
            return ty;
        }
    }
    "feat"
}

/// Title with any recognized `TYPE:` prefix stripped.
fn clean_title(title: &str) -> &str {
    for prefix in ["BUILD:", "FIX:", "TEST:", "CLEANUP:", "AUDIT:", "DOCS:", "REFACTOR:"] {
        if let Some(rest) = title.strip_prefix(prefix) {
            return rest.trim_start();
        }
    }
    title
}

/// Structured commit message for the core's own commit.
pub fn build_commit_message(task: &TaskSpec) -> String {
    let description = if task.description.is_empty() {
        "No description provided"
    } else {
        task.description.as_str()
    };
    format!(
        "{}: {}\n\n{}\n\nCompletes: {}",
        commit_type(task),
        clean_title(&task.title),
        description,
        task.id
    )
}

/// Draft-PR body: summary, acceptance-criteria checklist, task link.
pub fn build_pr_body(task: &TaskSpec) -> String {
    let criteria = if task.acceptance_criteria.is_empty() {
        "None specified".to_string()
    } else {
        task.acceptance_criteria
            .iter()
            .map(|c| format!("- [ ] {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let description = if task.description.is_empty() {
        "No description provided"
    } else {
        task.description.as_str()
    };
    format!(
        "## Summary\n\n{description}\n\n## Acceptance Criteria\n\n{criteria}\n\nCompletes: `{}`",
        task.id
    )
}
