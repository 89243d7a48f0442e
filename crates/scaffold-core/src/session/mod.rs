//! Session state and its on-disk store.
//!
//! A session is one invocation of the orchestrator run loop. Its state is
//! a single JSON document under `.scaffold/sessions/<session_id>.json`,
//! rewritten atomically after every phase transition so a crash at any
//! point leaves a resumable record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persistent state of one orchestrator session.
///
/// Invariant: a task id appears in at most one of `tasks_queued`,
/// `tasks_in_progress`, `tasks_completed`, `tasks_failed`. The `mark_*`
/// transitions below maintain this by removing the id from every other
/// place before inserting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub max_tasks: usize,
    #[serde(default)]
    pub max_cost: f64,
    #[serde(default)]
    pub max_time_hours: f64,
    #[serde(default)]
    pub tasks_queued: Vec<String>,
    /// task_id -> worktree path.
    #[serde(default)]
    pub tasks_in_progress: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
    #[serde(default)]
    pub tasks_failed: Vec<String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_duration_sec: f64,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        max_tasks: usize,
        max_cost: f64,
        max_time_hours: f64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Utc::now(),
            max_tasks,
            max_cost,
            max_time_hours,
            tasks_queued: Vec::new(),
            tasks_in_progress: BTreeMap::new(),
            tasks_completed: Vec::new(),
            tasks_failed: Vec::new(),
            total_cost: 0.0,
            total_duration_sec: 0.0,
        }
    }

    /// Derive a session id from a start instant: `YYYYmmdd_HHMMSS`.
    pub fn derive_id(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d_%H%M%S").to_string()
    }

    fn forget(&mut self, task_id: &str) {
        self.tasks_queued.retain(|t| t != task_id);
        self.tasks_in_progress.remove(task_id);
        self.tasks_completed.retain(|t| t != task_id);
        self.tasks_failed.retain(|t| t != task_id);
    }

    /// Record the fetched candidate queue, dropping anything this session
    /// has already finished with.
    pub fn seed_queue(&mut self, task_ids: impl IntoIterator<Item = String>) {
        let queued: Vec<String> = task_ids
            .into_iter()
            .filter(|id| !self.is_settled(id) && !self.tasks_in_progress.contains_key(id))
            .collect();
        self.tasks_queued = queued;
    }

    /// Whether the session already completed or failed the task.
    pub fn is_settled(&self, task_id: &str) -> bool {
        self.tasks_completed.iter().any(|t| t == task_id)
            || self.tasks_failed.iter().any(|t| t == task_id)
    }

    pub fn mark_in_progress(&mut self, task_id: &str, worktree_path: PathBuf) {
        self.forget(task_id);
        self.tasks_in_progress
            .insert(task_id.to_string(), worktree_path);
    }

    pub fn mark_completed(&mut self, task_id: &str, cost_usd: f64, duration_sec: f64) {
        self.forget(task_id);
        self.tasks_completed.push(task_id.to_string());
        self.total_cost += cost_usd;
        self.total_duration_sec += duration_sec;
    }

    pub fn mark_failed(&mut self, task_id: &str, duration_sec: f64) {
        self.forget(task_id);
        self.tasks_failed.push(task_id.to_string());
        self.total_duration_sec += duration_sec;
    }

    /// Drop a task from the session without counting it as completed or
    /// failed (manual-action outcomes, dry-run candidates).
    pub fn mark_skipped(&mut self, task_id: &str) {
        self.forget(task_id);
    }

    /// Completed plus failed: the count the session task cap applies to.
    pub fn settled_count(&self) -> usize {
        self.tasks_completed.len() + self.tasks_failed.len()
    }
}

/// File-backed store: one JSON document per session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Open a store rooted at `<state_dir>/sessions`, creating it if needed.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let sessions_dir = state_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir).with_context(|| {
            format!("failed to create session directory {}", sessions_dir.display())
        })?;
        Ok(Self { sessions_dir })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    /// Allocate a fresh session id for the given start time.
    ///
    /// Timestamp ids are second-granular; a numeric suffix keeps ids
    /// monotonic when two sessions start within the same second.
    pub fn allocate_session_id(&self, at: DateTime<Utc>) -> String {
        let base = SessionState::derive_id(at);
        if !self.session_path(&base).exists() {
            return base;
        }
        for n in 2.. {
            let candidate = format!("{base}_{n}");
            if !self.session_path(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!("suffix search is unbounded");
    }

    /// Persist the session, atomically (write temp file, then rename).
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.session_path(&state.session_id);
        let tmp = self
            .sessions_dir
            .join(format!(".{}.json.tmp", state.session_id));

        let mut json = serde_json::to_string_pretty(state).context("serialize session state")?;
        json.push('\n');
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load a session by id. Missing fields are filled with defaults;
    /// a missing file yields `None`.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.session_path(session_id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    /// All known session ids, ascending (timestamp ids sort newest-last).
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("failed to read {}", self.sessions_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with('.') {
                    // Leftover temp file from an interrupted write.
                    warn!(file = %path.display(), "ignoring stale session temp file");
                    continue;
                }
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load a session for resumption, failing loudly when it is absent.
    pub fn resume(&self, session_id: &str) -> Result<SessionState> {
        self.load(session_id)?
            .with_context(|| format!("no persisted session with id {session_id}"))
    }
}
