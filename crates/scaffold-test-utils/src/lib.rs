//! Shared test utilities for the orchestrator workspace.
//!
//! Provides the filesystem fixtures the integration tests need: an
//! in-memory backlog with failure injection, temp git repositories,
//! executable fake agent scripts, and a recording VCS stub.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use scaffold_backlog::{
    BacklogAdapter, BacklogError, TaskQuery, TaskSpec, TaskStatus, adapter::dependencies_satisfied,
};
use scaffold_core::vcs::{CommitOutcome, VcsAdapter, VcsError};

// ---------------------------------------------------------------------------
// In-memory backlog
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryBacklogInner {
    tasks: BTreeMap<String, TaskSpec>,
    /// Ids that report a parse error instead of a record.
    poisoned: BTreeMap<String, String>,
    fail_writes: bool,
}

/// `BacklogAdapter` backed by a map. Supports injecting parse errors
/// (`poison`) and write failures (`fail_writes`).
#[derive(Default)]
pub struct MemoryBacklog {
    inner: Mutex<MemoryBacklogInner>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: TaskSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id.clone(), task);
    }

    /// Make `get_task(id)` fail with a parse error carrying `message`.
    pub fn poison(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.poisoned.insert(id.to_string(), message.to_string());
    }

    /// Toggle failure of all write operations.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    /// Current snapshot of a task, bypassing the adapter interface.
    pub fn snapshot(&self, id: &str) -> Option<TaskSpec> {
        self.inner.lock().unwrap().tasks.get(id).cloned()
    }
}

#[async_trait]
impl BacklogAdapter for MemoryBacklog {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskSpec>, BacklogError> {
        let inner = self.inner.lock().unwrap();
        let by_id: BTreeMap<&str, TaskStatus> = inner
            .tasks
            .iter()
            .map(|(id, t)| (id.as_str(), t.status))
            .collect();

        let mut out: Vec<TaskSpec> = inner
            .tasks
            .values()
            .filter(|t| !inner.poisoned.contains_key(&t.id))
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
        let inner = self.inner.lock().unwrap();
        if let Some(message) = inner.poisoned.get(task_id) {
            return Err(BacklogError::Parse {
                task_id: task_id.to_string(),
                message: message.clone(),
            });
        }
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| BacklogError::NotFound(task_id.to_string()))
    }

    async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
    ) -> Result<(), BacklogError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(BacklogError::Other("write failure injected".to_string()));
        }
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BacklogError::NotFound(task_id.to_string()))?;
        task.status = new_status;
        Ok(())
    }

    async fn append_notes(&self, task_id: &str, text: &str) -> Result<(), BacklogError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(BacklogError::Other("write failure injected".to_string()));
        }
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BacklogError::NotFound(task_id.to_string()))?;
        if task.implementation_notes.is_empty() {
            task.implementation_notes = text.to_string();
        } else {
            task.implementation_notes.push('\n');
            task.implementation_notes.push_str(text);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

/// Run a git command in `dir`, panicking on failure.
pub fn git(args: &[&str], dir: &Path) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a temp dir containing `repo/`, an initialized git repository
/// with one commit. The repo is a subdirectory so sibling worktree
/// directories land inside the temp dir.
pub fn temp_git_repo() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("failed to create temp dir");
    let repo = dir.path().join("repo");
    std::fs::create_dir(&repo).expect("failed to create repo dir");

    git(&["init"], &repo);
    git(&["config", "user.email", "test@scaffold.dev"], &repo);
    git(&["config", "user.name", "Scaffold Test"], &repo);
    std::fs::write(repo.join("README.md"), "# Test repo\n").expect("failed to write README");
    git(&["add", "."], &repo);
    git(&["commit", "-m", "Initial commit"], &repo);

    (dir, repo)
}

/// Write an executable `#!/bin/sh` script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path
}

// ---------------------------------------------------------------------------
// Recording VCS stub
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StubVcsState {
    pushes: Vec<(String, String, bool)>,
    prs: Vec<(String, String, String, String)>,
    commit_messages: Vec<String>,
}

/// `VcsAdapter` that succeeds at everything and records what it was asked
/// to do. PR URLs are `https://github.com/example/repo/pull/<n>`.
#[derive(Debug, Default)]
pub struct StubVcs {
    state: Mutex<StubVcsState>,
    pr_counter: AtomicUsize,
}

impl StubVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(remote, branch, set_upstream)` pushes.
    pub fn pushes(&self) -> Vec<(String, String, bool)> {
        self.state.lock().unwrap().pushes.clone()
    }

    /// Recorded `(title, body, head, base)` PR creations.
    pub fn prs(&self) -> Vec<(String, String, String, String)> {
        self.state.lock().unwrap().prs.clone()
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.state.lock().unwrap().commit_messages.clone()
    }
}

#[async_trait]
impl VcsAdapter for StubVcs {
    async fn head_sha(&self, _dir: &Path) -> Result<String, VcsError> {
        Ok("abc1234".to_string())
    }

    async fn diff_names(&self, _dir: &Path) -> Result<Vec<String>, VcsError> {
        Ok(Vec::new())
    }

    async fn commits_since(&self, _dir: &Path, _start: &str) -> Result<Vec<String>, VcsError> {
        Ok(Vec::new())
    }

    async fn current_branch(&self, _dir: &Path) -> Result<String, VcsError> {
        Ok("autonomous/unknown".to_string())
    }

    async fn stage_and_commit(
        &self,
        _dir: &Path,
        message: &str,
    ) -> Result<CommitOutcome, VcsError> {
        self.state
            .lock()
            .unwrap()
            .commit_messages
            .push(message.to_string());
        Ok(CommitOutcome::NothingToCommit)
    }

    async fn push(
        &self,
        _dir: &Path,
        remote: &str,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), VcsError> {
        self.state.lock().unwrap().pushes.push((
            remote.to_string(),
            branch.to_string(),
            set_upstream,
        ));
        Ok(())
    }

    async fn create_draft_pr(
        &self,
        _dir: &Path,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String, VcsError> {
        let n = self.pr_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().unwrap().prs.push((
            title.to_string(),
            body.to_string(),
            head.to_string(),
            base.to_string(),
        ));
        Ok(format!("https://github.com/example/repo/pull/{n}"))
    }
}
