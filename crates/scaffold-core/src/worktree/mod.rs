//! Git worktree management for task isolation.
//!
//! Every task runs in its own git worktree: filesystem isolation without
//! full clones, sharing the object store of the main repository. On top of
//! the raw git plumbing this manager keeps a durable metadata index
//! (`.scaffold/worktrees.json`) so a restarted orchestrator sees prior
//! worktrees, enforces a concurrency cap, and guarantees that at most one
//! active worktree exists per task and per branch.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it locks the shared object store), so all mutating
//! operations serialize on a single manager-wide lock. `list_worktrees`
//! returns a snapshot and takes the lock only long enough to clone the
//! index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Branch namespace for orchestrator-created worktrees.
const BRANCH_PREFIX: &str = "autonomous/";

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A live worktree already exists for the task.
    #[error("active worktree already exists for task {0}")]
    AlreadyExists(String),

    /// The concurrency cap is reached.
    #[error("worktree limit reached ({active}/{max} active)")]
    LimitReached { active: usize, max: usize },

    /// The worktree has uncommitted changes and `force` was not given.
    #[error("worktree has uncommitted changes: {0}")]
    DirtyWorktree(PathBuf),

    /// No metadata entry for the task.
    #[error("no worktree registered for task {0}")]
    NotFound(String),

    /// Disallowed metadata status transition.
    #[error("invalid worktree status transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: WorktreeStatus,
        to: WorktreeStatus,
    },

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The metadata index could not be read or written.
    #[error("worktree index error: {0}")]
    Index(String),

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Metadata status of a managed worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    /// A task owns the worktree right now.
    Active,
    /// Derived view for reclamation (aged out, or rediscovered after a
    /// restart with no owning session).
    Stale,
    /// Handed off for review: a PR was opened from this branch. The name
    /// is historical; it does not mean the PR has landed.
    Merged,
    /// Released by cleanup or failure handling.
    Abandoned,
}

impl std::fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorktreeStatus::Active => "active",
            WorktreeStatus::Stale => "stale",
            WorktreeStatus::Merged => "merged",
            WorktreeStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// One record in the durable worktree index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeMetadata {
    pub task_id: String,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
    /// Tag naming what created the worktree (e.g. "orchestrator").
    pub creator: String,
    pub status: WorktreeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// Raw info about a single git worktree, from `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages isolated worktrees with a durable index and a concurrency cap.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    index_path: PathBuf,
    max_concurrent: usize,
    remote: String,
    /// Guards both the metadata index and all mutating git operations.
    inner: Arc<Mutex<HashMap<String, WorktreeMetadata>>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            index_path: self.index_path.clone(),
            max_concurrent: self.max_concurrent,
            remote: self.remote.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorktreeManager {
    /// Open a manager for the repository at `repo_path`.
    ///
    /// Verifies the path is a git repository and loads the metadata index
    /// from `<repo>/.scaffold/worktrees.json` (an absent index is an empty
    /// one).
    pub fn new(
        repo_path: impl Into<PathBuf>,
        max_concurrent: usize,
        remote: impl Into<String>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let index_path = repo_path.join(crate::STATE_DIR).join("worktrees.json");
        let index = load_index(&index_path)?;

        Ok(Self {
            repo_path,
            index_path,
            max_concurrent,
            remote: remote.into(),
            inner: Arc::new(Mutex::new(index)),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Conventional worktree path: `<repo_parent>/<repo_name>-<task_id>`.
    fn worktree_path_for(&self, task_id: &str) -> PathBuf {
        let repo_name = self
            .repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        let dir_name = format!("{repo_name}-{task_id}");
        self.repo_path
            .parent()
            .map(|p| p.join(&dir_name))
            .unwrap_or_else(|| PathBuf::from(dir_name))
    }

    /// Create a worktree for the task on branch `autonomous/<task_id>`.
    ///
    /// Fails with [`WorktreeError::AlreadyExists`] when the task already
    /// has an active worktree and [`WorktreeError::LimitReached`] when the
    /// active count is at the cap. A branch-name collision (local, remote,
    /// or in the index) is resolved by appending a numeric suffix.
    pub fn create_worktree(
        &self,
        task_id: &str,
        creator: &str,
    ) -> Result<WorktreeMetadata, WorktreeError> {
        let mut index = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if index
            .get(task_id)
            .is_some_and(|m| m.status == WorktreeStatus::Active)
        {
            return Err(WorktreeError::AlreadyExists(task_id.to_string()));
        }

        let active = index
            .values()
            .filter(|m| m.status == WorktreeStatus::Active)
            .count();
        if active >= self.max_concurrent {
            return Err(WorktreeError::LimitReached {
                active,
                max: self.max_concurrent,
            });
        }

        let worktree_path = self.worktree_path_for(task_id);
        if worktree_path.exists() {
            // A directory left behind by something we no longer track.
            return Err(WorktreeError::AlreadyExists(task_id.to_string()));
        }

        let branch_name = self.unique_branch_name(task_id, &index)?;

        let output = Command::new("git")
            .args(["worktree", "add", "-b"])
            .arg(&branch_name)
            .arg(&worktree_path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add -b".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Best-effort cleanup of partial state.
            if worktree_path.exists() {
                let _ = std::fs::remove_dir_all(&worktree_path);
            }
            let _ = self.prune_worktrees();
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let meta = WorktreeMetadata {
            task_id: task_id.to_string(),
            worktree_path,
            branch_name,
            created_at: Utc::now(),
            creator: creator.to_string(),
            status: WorktreeStatus::Active,
            pr_url: None,
        };
        index.insert(task_id.to_string(), meta.clone());
        save_index(&self.index_path, &index)?;

        info!(
            task_id,
            path = %meta.worktree_path.display(),
            branch = %meta.branch_name,
            "created worktree"
        );
        Ok(meta)
    }

    /// First free name in `autonomous/<task_id>`, `autonomous/<task_id>-2`, ...
    fn unique_branch_name(
        &self,
        task_id: &str,
        index: &HashMap<String, WorktreeMetadata>,
    ) -> Result<String, WorktreeError> {
        let base = format!("{BRANCH_PREFIX}{task_id}");
        let taken = |name: &str| -> Result<bool, WorktreeError> {
            if index
                .values()
                .any(|m| m.status == WorktreeStatus::Active && m.branch_name == name)
            {
                return Ok(true);
            }
            if self.local_branch_exists(name)? {
                return Ok(true);
            }
            Ok(self.remote_branch_exists(name))
        };

        if !taken(&base)? {
            return Ok(base);
        }
        for n in 2.. {
            let candidate = format!("{base}-{n}");
            if !taken(&candidate)? {
                return Ok(candidate);
            }
        }
        unreachable!("suffix search is unbounded");
    }

    fn local_branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    /// Best-effort remote check; a missing or unreachable remote counts as
    /// no collision.
    fn remote_branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["ls-remote", "--exit-code", "--heads"])
            .arg(&self.remote)
            .arg(branch)
            .current_dir(&self.repo_path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Transition a worktree's metadata status.
    ///
    /// Allowed: `active -> {merged, abandoned, stale}` and
    /// `stale -> abandoned`; writing the current status is a no-op.
    pub fn update_worktree_status(
        &self,
        task_id: &str,
        status: WorktreeStatus,
        pr_url: Option<String>,
    ) -> Result<(), WorktreeError> {
        let mut index = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let meta = index
            .get_mut(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;

        let allowed = meta.status == status
            || matches!(
                (meta.status, status),
                (WorktreeStatus::Active, _) | (WorktreeStatus::Stale, WorktreeStatus::Abandoned)
            );
        if !allowed {
            return Err(WorktreeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: meta.status,
                to: status,
            });
        }

        meta.status = status;
        if pr_url.is_some() {
            meta.pr_url = pr_url;
        }
        save_index(&self.index_path, &index)
    }

    /// Snapshot of the metadata index, optionally filtered by status.
    pub fn list_worktrees(&self, status: Option<WorktreeStatus>) -> Vec<WorktreeMetadata> {
        let index = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<WorktreeMetadata> = index
            .values()
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        list
    }

    /// Metadata for one task, if any.
    pub fn get(&self, task_id: &str) -> Option<WorktreeMetadata> {
        let index = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        index.get(task_id).cloned()
    }

    /// Remove a task's worktree from disk and git, optionally deleting its
    /// branch. Idempotent: cleaning an unknown or already-removed worktree
    /// is a no-op.
    ///
    /// Without `force`, a worktree with uncommitted changes is refused
    /// with [`WorktreeError::DirtyWorktree`].
    pub fn cleanup_worktree(
        &self,
        task_id: &str,
        force: bool,
        delete_branch: bool,
    ) -> Result<(), WorktreeError> {
        let mut index = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(meta) = index.get(task_id).cloned() else {
            return Ok(());
        };

        if meta.worktree_path.exists() {
            if !force && self.worktree_is_dirty(&meta.worktree_path)? {
                return Err(WorktreeError::DirtyWorktree(meta.worktree_path.clone()));
            }

            let output = Command::new("git")
                .args(["worktree", "remove", "--force"])
                .arg(&meta.worktree_path)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree remove".into(),
                    source: e,
                })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if !stderr.contains("is not a working tree") {
                    return Err(WorktreeError::GitExit {
                        command: "worktree remove".into(),
                        code: output.status.code().unwrap_or(-1),
                        stderr,
                    });
                }
                // Not registered with git anymore; fall through and remove
                // the directory directly.
                let _ = std::fs::remove_dir_all(&meta.worktree_path);
            }
        } else {
            let _ = self.prune_worktrees();
        }

        if delete_branch {
            self.delete_branch(&meta.branch_name)?;
        }

        if let Some(entry) = index.get_mut(task_id) {
            // A handed-off worktree keeps its merged status through cleanup.
            if entry.status != WorktreeStatus::Merged {
                entry.status = WorktreeStatus::Abandoned;
            }
        }
        save_index(&self.index_path, &index)?;

        info!(task_id, "cleaned up worktree");
        Ok(())
    }

    fn worktree_is_dirty(&self, path: &Path) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git status".into(),
                source: e,
            })?;
        Ok(!output.stdout.is_empty())
    }

    /// Force-delete a local branch. Missing branches are not an error.
    fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["branch", "-D", branch])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !stderr.contains("not found") {
                return Err(WorktreeError::GitExit {
                    command: "branch -D".into(),
                    code: output.status.code().unwrap_or(-1),
                    stderr,
                });
            }
        }
        Ok(())
    }

    fn prune_worktrees(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// Query git for actual worktrees and reconcile the index with reality.
    ///
    /// Worktrees on an `autonomous/*` branch that the index does not know
    /// are adopted as `stale`; live index entries whose worktree vanished
    /// are marked `abandoned`.
    pub fn reconcile(&self) -> Result<(), WorktreeError> {
        let actual = self.git_worktree_list()?;
        let mut index = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let actual_paths: Vec<PathBuf> = actual
            .iter()
            .map(|w| canonical_or(&w.path))
            .collect();

        // Adopt unknown orchestrator worktrees.
        for wt in &actual {
            let Some(branch) = wt.branch.as_deref() else {
                continue;
            };
            let Some(task_id) = branch.strip_prefix(BRANCH_PREFIX) else {
                continue;
            };
            let task_id = task_id.to_string();
            let known = index
                .values()
                .any(|m| canonical_or(&m.worktree_path) == canonical_or(&wt.path));
            if !known {
                warn!(
                    task_id = %task_id,
                    path = %wt.path.display(),
                    "adopting untracked worktree as stale"
                );
                index.insert(
                    task_id.clone(),
                    WorktreeMetadata {
                        task_id,
                        worktree_path: wt.path.clone(),
                        branch_name: branch.to_string(),
                        created_at: Utc::now(),
                        creator: "reconcile".to_string(),
                        status: WorktreeStatus::Stale,
                        pr_url: None,
                    },
                );
            }
        }

        // Mark vanished entries abandoned.
        for meta in index.values_mut() {
            if matches!(meta.status, WorktreeStatus::Active | WorktreeStatus::Stale)
                && !actual_paths.contains(&canonical_or(&meta.worktree_path))
            {
                warn!(
                    task_id = %meta.task_id,
                    path = %meta.worktree_path.display(),
                    "worktree vanished, marking abandoned"
                );
                meta.status = WorktreeStatus::Abandoned;
            }
        }

        save_index(&self.index_path, &index)
    }

    /// Transition active worktrees older than `max_age` to `stale`.
    pub fn mark_stale(&self, max_age: chrono::Duration) -> Result<usize, WorktreeError> {
        let cutoff = Utc::now() - max_age;
        let mut index = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut aged = 0;
        for meta in index.values_mut() {
            if meta.status == WorktreeStatus::Active && meta.created_at < cutoff {
                meta.status = WorktreeStatus::Stale;
                aged += 1;
            }
        }
        if aged > 0 {
            save_index(&self.index_path, &index)?;
        }
        Ok(aged)
    }

    fn git_worktree_list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn canonical_or(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Index persistence
// ---------------------------------------------------------------------------

fn load_index(path: &Path) -> Result<HashMap<String, WorktreeMetadata>, WorktreeError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map_err(|e| WorktreeError::Index(format!("failed to parse {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(WorktreeError::Index(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn save_index(
    path: &Path,
    index: &HashMap<String, WorktreeMetadata>,
) -> Result<(), WorktreeError> {
    let parent = path
        .parent()
        .ok_or_else(|| WorktreeError::Index("index path has no parent".into()))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| WorktreeError::Index(format!("failed to create {}: {e}", parent.display())))?;

    let mut json = serde_json::to_string_pretty(index)
        .map_err(|e| WorktreeError::Index(format!("failed to serialize index: {e}")))?;
    json.push('\n');

    let tmp = parent.join(".worktrees.json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| WorktreeError::Index(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| WorktreeError::Index(format!("failed to replace {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Porcelain parsing
// ---------------------------------------------------------------------------

/// Parse the output of `git worktree list --porcelain`.
///
/// Blocks are separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare`, detached worktrees `detached`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // `bare`, `detached`, `prunable` etc. are ignored.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp dir containing `repo/`, a git repository with one
    /// commit, leaving room for sibling worktree directories.
    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().join("repo");
        std::fs::create_dir(&repo_path).unwrap();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init"]);
        run(&["config", "user.email", "test@scaffold.dev"]);
        run(&["config", "user.name", "Scaffold Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    fn manager(repo_path: &Path) -> WorktreeManager {
        WorktreeManager::new(repo_path, 3, "origin").expect("failed to create WorktreeManager")
    }

    #[test]
    fn new_with_invalid_repo_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = WorktreeManager::new(dir.path(), 3, "origin");
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn create_registers_active_metadata() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);

        let meta = mgr.create_worktree("task-1", "orchestrator").unwrap();
        assert!(meta.worktree_path.exists());
        assert_eq!(meta.branch_name, "autonomous/task-1");
        assert_eq!(meta.status, WorktreeStatus::Active);
        assert_eq!(meta.creator, "orchestrator");
        assert!(
            meta.worktree_path
                .to_string_lossy()
                .ends_with("repo-task-1")
        );

        let listed = mgr.list_worktrees(Some(WorktreeStatus::Active));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, "task-1");
    }

    #[test]
    fn create_twice_fails_already_exists() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);

        mgr.create_worktree("task-1", "orchestrator").unwrap();
        let err = mgr.create_worktree("task-1", "orchestrator").unwrap_err();
        assert!(matches!(err, WorktreeError::AlreadyExists(_)));
    }

    #[test]
    fn create_respects_concurrency_cap() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, 2, "origin").unwrap();

        mgr.create_worktree("task-1", "orchestrator").unwrap();
        mgr.create_worktree("task-2", "orchestrator").unwrap();
        let err = mgr.create_worktree("task-3", "orchestrator").unwrap_err();
        assert!(matches!(
            err,
            WorktreeError::LimitReached { active: 2, max: 2 }
        ));
    }

    #[test]
    fn cleanup_frees_a_slot() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorktreeManager::new(&repo, 1, "origin").unwrap();

        mgr.create_worktree("task-1", "orchestrator").unwrap();
        mgr.cleanup_worktree("task-1", true, true).unwrap();
        // Slot freed and branch deleted, so the same name is reusable.
        let meta = mgr.create_worktree("task-2", "orchestrator").unwrap();
        assert_eq!(meta.branch_name, "autonomous/task-2");
    }

    #[test]
    fn branch_collision_appends_suffix() {
        let (_dir, repo) = create_temp_repo();
        // Occupy the conventional branch name ahead of time.
        let output = Command::new("git")
            .args(["branch", "autonomous/task-1"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(output.status.success());

        let mgr = manager(&repo);
        let meta = mgr.create_worktree("task-1", "orchestrator").unwrap();
        assert_eq!(meta.branch_name, "autonomous/task-1-2");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);

        mgr.create_worktree("task-1", "orchestrator").unwrap();
        mgr.cleanup_worktree("task-1", true, false).unwrap();
        mgr.cleanup_worktree("task-1", true, false).unwrap();
        // Cleaning a task that never had a worktree is also a no-op.
        mgr.cleanup_worktree("task-never", false, false).unwrap();

        assert_eq!(
            mgr.get("task-1").unwrap().status,
            WorktreeStatus::Abandoned
        );
    }

    #[test]
    fn cleanup_refuses_dirty_worktree_without_force() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);

        let meta = mgr.create_worktree("task-1", "orchestrator").unwrap();
        std::fs::write(meta.worktree_path.join("scratch.txt"), "wip\n").unwrap();

        let err = mgr.cleanup_worktree("task-1", false, false).unwrap_err();
        assert!(matches!(err, WorktreeError::DirtyWorktree(_)));
        assert!(meta.worktree_path.exists());

        mgr.cleanup_worktree("task-1", true, false).unwrap();
        assert!(!meta.worktree_path.exists());
    }

    #[test]
    fn status_transitions_enforced() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        mgr.create_worktree("task-1", "orchestrator").unwrap();

        mgr.update_worktree_status(
            "task-1",
            WorktreeStatus::Merged,
            Some("https://example.com/pull/1".to_string()),
        )
        .unwrap();
        let meta = mgr.get("task-1").unwrap();
        assert_eq!(meta.status, WorktreeStatus::Merged);
        assert_eq!(meta.pr_url.as_deref(), Some("https://example.com/pull/1"));

        // merged -> active is not a legal transition.
        let err = mgr
            .update_worktree_status("task-1", WorktreeStatus::Active, None)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::InvalidTransition { .. }));

        // Same-status writes are a no-op.
        mgr.update_worktree_status("task-1", WorktreeStatus::Merged, None)
            .unwrap();
    }

    #[test]
    fn update_status_unknown_task_fails() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        let err = mgr
            .update_worktree_status("task-ghost", WorktreeStatus::Stale, None)
            .unwrap_err();
        assert!(matches!(err, WorktreeError::NotFound(_)));
    }

    #[test]
    fn merged_status_survives_cleanup() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        mgr.create_worktree("task-1", "orchestrator").unwrap();
        mgr.update_worktree_status("task-1", WorktreeStatus::Merged, None)
            .unwrap();

        mgr.cleanup_worktree("task-1", true, false).unwrap();
        assert_eq!(mgr.get("task-1").unwrap().status, WorktreeStatus::Merged);
    }

    #[test]
    fn index_persists_across_reopen() {
        let (_dir, repo) = create_temp_repo();
        {
            let mgr = manager(&repo);
            mgr.create_worktree("task-1", "orchestrator").unwrap();
        }
        let mgr = manager(&repo);
        let meta = mgr.get("task-1").unwrap();
        assert_eq!(meta.status, WorktreeStatus::Active);
        assert_eq!(meta.branch_name, "autonomous/task-1");
    }

    #[test]
    fn index_file_is_newline_terminated_json_object() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        mgr.create_worktree("task-1", "orchestrator").unwrap();

        let contents =
            std::fs::read_to_string(repo.join(crate::STATE_DIR).join("worktrees.json")).unwrap();
        assert!(contents.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(value.get("task-1").is_some());
    }

    #[test]
    fn reconcile_adopts_untracked_and_abandons_vanished() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);

        // A worktree created behind the manager's back.
        let foreign = repo.parent().unwrap().join("repo-task-foreign");
        let output = Command::new("git")
            .args(["worktree", "add", "-b", "autonomous/task-foreign"])
            .arg(&foreign)
            .current_dir(&repo)
            .output()
            .unwrap();
        assert!(output.status.success());

        // A tracked worktree whose directory vanishes.
        let meta = mgr.create_worktree("task-gone", "orchestrator").unwrap();
        std::fs::remove_dir_all(&meta.worktree_path).unwrap();
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&repo)
            .output();

        mgr.reconcile().unwrap();

        assert_eq!(
            mgr.get("task-foreign").unwrap().status,
            WorktreeStatus::Stale
        );
        assert_eq!(
            mgr.get("task-gone").unwrap().status,
            WorktreeStatus::Abandoned
        );
    }

    #[test]
    fn mark_stale_ages_out_active_entries() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        mgr.create_worktree("task-1", "orchestrator").unwrap();

        // Nothing is older than a day.
        assert_eq!(mgr.mark_stale(chrono::Duration::days(1)).unwrap(), 0);
        // Everything is older than -1 seconds.
        assert_eq!(mgr.mark_stale(chrono::Duration::seconds(-1)).unwrap(), 1);
        assert_eq!(mgr.get("task-1").unwrap().status, WorktreeStatus::Stale);
    }

    #[test]
    fn worktree_isolation_from_main_repo() {
        let (_dir, repo) = create_temp_repo();
        let mgr = manager(&repo);
        let meta = mgr.create_worktree("task-1", "orchestrator").unwrap();

        std::fs::write(meta.worktree_path.join("agent-work.txt"), "output\n").unwrap();
        assert!(!repo.join("agent-work.txt").exists());
    }

    #[test]
    fn parse_porcelain_output_blocks() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/project-task-9
HEAD 789abc012def
branch refs/heads/autonomous/task-9

worktree /home/user/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch.as_deref(), Some("autonomous/task-9"));
        assert_eq!(result[1].path, PathBuf::from("/home/user/project-task-9"));
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn parse_porcelain_output_without_trailing_newline() {
        let input = "worktree /p\nHEAD abc\nbranch refs/heads/main";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }
}
