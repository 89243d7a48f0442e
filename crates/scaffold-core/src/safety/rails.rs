//! Pre-execution validation and safety checks.
//!
//! Six checks run in order, short-circuiting on the first failure:
//!
//! 1. emergency stop file (`.scaffold_stop`)
//! 2. manual skip list (`.scaffold_skip`)
//! 3. task exists in the backlog
//! 4. all dependencies are `Done`
//! 5. the backlog record parses cleanly
//! 6. retry budget and backoff window
//!
//! The same component owns heuristic cost estimation and the in-memory
//! retry map. Retry state is session-scoped: it is not persisted, so a
//! crash-and-resume resets the retry clock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scaffold_backlog::{BacklogAdapter, BacklogError, Priority, TaskStatus};
use tracing::debug;

/// What a validation check failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailureKind {
    EmergencyStop,
    TaskSkipped,
    TaskNotFound,
    DependenciesNotSatisfied,
    InvalidRecord,
    RetryLimitExceeded,
    BackoffActive,
}

/// A failed validation: the kind plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub kind: ValidationFailureKind,
    pub reason: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl ValidationFailure {
    fn new(kind: ValidationFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Retry bookkeeping for a single task, kept only for the session.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub task_id: String,
    /// Number of recorded failures.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Backoff applied after the most recent failure.
    pub backoff: Duration,
    /// Earliest instant at which a retry is allowed.
    pub next_retry_time: Instant,
}

/// How a cost estimate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateMethod {
    Heuristic,
    /// Conservative constant used when estimation itself failed.
    Fallback,
}

/// Heuristic pre-execution cost prediction for one task.
#[derive(Debug, Clone)]
pub struct CostEstimate {
    pub task_id: String,
    pub estimated_cost_usd: f64,
    /// 0.0 - 1.0.
    pub confidence: f64,
    pub method: EstimateMethod,
    /// Attribution of the estimate to its inputs.
    pub factors: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct SafetyRailsConfig {
    pub max_retries: u32,
    pub emergency_stop_file: String,
    pub skip_file: String,
}

impl Default for SafetyRailsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            emergency_stop_file: ".scaffold_stop".to_string(),
            skip_file: ".scaffold_skip".to_string(),
        }
    }
}

/// Backoff after the nth recorded failure (1-based).
fn backoff_for_attempt(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_secs(10),
        2 => Duration::from_secs(30),
        _ => Duration::from_secs(90),
    }
}

/// Pre-execution validation, cost estimation, and retry accounting.
///
/// One instance per orchestrator session.
pub struct SafetyRails {
    repo_root: PathBuf,
    backlog: Arc<dyn BacklogAdapter>,
    config: SafetyRailsConfig,
    retry_states: Mutex<HashMap<String, RetryState>>,
}

impl SafetyRails {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        backlog: Arc<dyn BacklogAdapter>,
        config: SafetyRailsConfig,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            backlog,
            config,
            retry_states: Mutex::new(HashMap::new()),
        }
    }

    /// Run all validation checks for a task, in order, stopping at the
    /// first failure.
    pub async fn validate(&self, task_id: &str) -> Result<(), ValidationFailure> {
        // 1. Emergency stop.
        if let Some(reason) = self.check_emergency_stop() {
            return Err(ValidationFailure::new(
                ValidationFailureKind::EmergencyStop,
                format!("Emergency stop: {reason}"),
            ));
        }

        // 2. Manual skip list.
        if self.in_skip_list(task_id) {
            return Err(ValidationFailure::new(
                ValidationFailureKind::TaskSkipped,
                format!("Task skipped: listed in {}", self.config.skip_file),
            ));
        }

        // 3 + 5. Existence and record validity. Fetching the task parses
        // its record, so both checks resolve here: a missing task fails
        // check 3, a malformed record fails check 5.
        let task = match self.backlog.get_task(task_id).await {
            Ok(task) => task,
            Err(BacklogError::NotFound(_)) => {
                return Err(ValidationFailure::new(
                    ValidationFailureKind::TaskNotFound,
                    format!("Task not found: {task_id}"),
                ));
            }
            Err(BacklogError::Parse { message, .. }) => {
                return Err(ValidationFailure::new(
                    ValidationFailureKind::InvalidRecord,
                    format!("YAML invalid: {message}"),
                ));
            }
            Err(e) => {
                return Err(ValidationFailure::new(
                    ValidationFailureKind::TaskNotFound,
                    format!("Error checking task existence: {e}"),
                ));
            }
        };

        // 4. Dependencies satisfied.
        let mut blocked_by = Vec::new();
        for dep_id in &task.dependencies {
            match self.backlog.get_task(dep_id).await {
                Ok(dep) if dep.status == TaskStatus::Done => {}
                Ok(dep) => blocked_by.push(format!("{dep_id} ({})", dep.status)),
                Err(_) => blocked_by.push(format!("{dep_id} (not found)")),
            }
        }
        if !blocked_by.is_empty() {
            return Err(ValidationFailure::new(
                ValidationFailureKind::DependenciesNotSatisfied,
                format!("Blocked by: {}", blocked_by.join(", ")),
            ));
        }

        // 6. Retry budget and backoff window.
        self.check_retry_allowed(task_id)
    }

    /// Heuristic cost estimate.
    ///
    /// Base $0.10, priority multiplier (high 1.5 / medium 1.0 / low 0.8),
    /// additive label deltas, $0.02 per acceptance criterion, floored at
    /// $0.05 and rounded to cents. Any failure produces a conservative
    /// $0.50 estimate at 0.30 confidence.
    pub async fn estimate_cost(&self, task_id: &str) -> CostEstimate {
        match self.backlog.get_task(task_id).await {
            Ok(task) => {
                let mut factors = BTreeMap::new();
                let mut cost = 0.10;
                factors.insert("base".to_string(), 0.10);

                let multiplier = match task.priority {
                    Priority::High => 1.5,
                    Priority::Medium => 1.0,
                    Priority::Low => 0.8,
                };
                cost *= multiplier;
                factors.insert("priority_multiplier".to_string(), multiplier);

                for (label, delta) in [
                    ("scaffold", 0.05),
                    ("build", 0.15),
                    ("fix", -0.05),
                    ("refactor", 0.10),
                ] {
                    if task.has_label(label) {
                        cost += delta;
                        factors.insert(format!("label_{label}"), delta);
                    }
                }

                if !task.acceptance_criteria.is_empty() {
                    let criteria_cost = task.acceptance_criteria.len() as f64 * 0.02;
                    cost += criteria_cost;
                    factors.insert("acceptance_criteria".to_string(), criteria_cost);
                }

                cost = cost.max(0.05);
                cost = (cost * 100.0).round() / 100.0;

                CostEstimate {
                    task_id: task_id.to_string(),
                    estimated_cost_usd: cost,
                    confidence: 0.70,
                    method: EstimateMethod::Heuristic,
                    factors,
                }
            }
            Err(e) => {
                debug!(task_id, error = %e, "cost estimation fell back to constant");
                CostEstimate {
                    task_id: task_id.to_string(),
                    estimated_cost_usd: 0.50,
                    confidence: 0.30,
                    method: EstimateMethod::Fallback,
                    factors: BTreeMap::new(),
                }
            }
        }
    }

    /// Record a task failure: bump the attempt count and arm the backoff
    /// window (10 s, 30 s, then 90 s for every further attempt).
    pub fn record_failure(&self, task_id: &str, error: &str) {
        let mut states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(task_id.to_string())
            .or_insert_with(|| RetryState {
                task_id: task_id.to_string(),
                attempt_count: 0,
                last_error: None,
                backoff: Duration::ZERO,
                next_retry_time: Instant::now(),
            });
        state.attempt_count += 1;
        state.last_error = Some(error.to_string());
        state.backoff = backoff_for_attempt(state.attempt_count);
        state.next_retry_time = Instant::now() + state.backoff;
    }

    /// Record a task success: the retry state is dropped entirely.
    pub fn record_success(&self, task_id: &str) {
        let mut states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(task_id);
    }

    /// Snapshot of the retry state for a task, if any failures were
    /// recorded.
    pub fn retry_state(&self, task_id: &str) -> Option<RetryState> {
        let states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(task_id).cloned()
    }

    /// Whether the task still has retry budget left. Tasks with no
    /// recorded failures trivially do.
    pub fn can_retry(&self, task_id: &str) -> bool {
        let states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .get(task_id)
            .is_none_or(|s| s.attempt_count < self.config.max_retries)
    }

    /// Remaining backoff wait for a task that is eligible to retry but
    /// still inside its window. `None` when the task can run now or is
    /// out of retries.
    pub fn time_until_retry(&self, task_id: &str) -> Option<Duration> {
        let states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.get(task_id)?;
        if state.attempt_count >= self.config.max_retries {
            return None;
        }
        let now = Instant::now();
        (state.next_retry_time > now).then(|| state.next_retry_time - now)
    }

    fn check_retry_allowed(&self, task_id: &str) -> Result<(), ValidationFailure> {
        let states = self.retry_states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get(task_id) else {
            return Ok(());
        };

        if state.attempt_count >= self.config.max_retries {
            return Err(ValidationFailure::new(
                ValidationFailureKind::RetryLimitExceeded,
                format!(
                    "Retry limit exceeded ({}/{} attempts)",
                    state.attempt_count, self.config.max_retries
                ),
            ));
        }

        let now = Instant::now();
        if now < state.next_retry_time {
            let wait = state.next_retry_time - now;
            return Err(ValidationFailure::new(
                ValidationFailureKind::BackoffActive,
                format!(
                    "Backoff active (retry in {}s, attempt {})",
                    wait.as_secs(),
                    state.attempt_count + 1
                ),
            ));
        }

        Ok(())
    }

    /// Emergency stop check: `Some(reason)` when the stop file exists.
    ///
    /// The first `REASON: <text>` line is surfaced; an unreadable file
    /// still stops the session.
    fn check_emergency_stop(&self) -> Option<String> {
        let stop_file = self.repo_root.join(&self.config.emergency_stop_file);
        if !stop_file.exists() {
            return None;
        }
        match std::fs::read_to_string(&stop_file) {
            Ok(contents) => {
                for line in contents.lines() {
                    if let Some(reason) = line.strip_prefix("REASON:") {
                        return Some(reason.trim().to_string());
                    }
                }
                Some("Emergency stop active".to_string())
            }
            Err(e) => Some(format!("Emergency stop file found but unreadable: {e}")),
        }
    }

    /// Whether the task id appears in the skip file. An unreadable skip
    /// file does not block anything.
    fn in_skip_list(&self, task_id: &str) -> bool {
        let skip_file = self.repo_root.join(&self.config.skip_file);
        let Ok(contents) = std::fs::read_to_string(&skip_file) else {
            return false;
        };
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .any(|line| line == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaffold_test_utils::MemoryBacklog;
    use scaffold_backlog::TaskSpec;

    fn rails_with(backlog: MemoryBacklog, root: &std::path::Path) -> SafetyRails {
        SafetyRails::new(root, Arc::new(backlog), SafetyRailsConfig::default())
    }

    fn task(id: &str) -> TaskSpec {
        TaskSpec::new(id, format!("Task {id}"))
    }

    #[tokio::test]
    async fn validate_passes_for_plain_task() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        backlog.insert(task("task-1"));
        let rails = rails_with(backlog, dir.path());

        assert!(rails.validate("task-1").await.is_ok());
    }

    #[tokio::test]
    async fn emergency_stop_short_circuits_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".scaffold_stop"),
            "REASON: maintenance window\nmore text\n",
        )
        .unwrap();
        // Even a task that does not exist reports the stop first.
        let rails = rails_with(MemoryBacklog::default(), dir.path());

        let err = rails.validate("task-ghost").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::EmergencyStop);
        assert_eq!(err.reason, "Emergency stop: maintenance window");
    }

    #[tokio::test]
    async fn stop_file_without_reason_line_uses_default() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".scaffold_stop"), "halt\n").unwrap();
        let rails = rails_with(MemoryBacklog::default(), dir.path());

        let err = rails.validate("task-1").await.unwrap_err();
        assert_eq!(err.reason, "Emergency stop: Emergency stop active");
    }

    #[tokio::test]
    async fn skip_list_matches_exact_ids_and_ignores_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".scaffold_skip"),
            "# temporarily parked\ntask-42\n\ntask-7\n",
        )
        .unwrap();
        let backlog = MemoryBacklog::default();
        backlog.insert(task("task-42"));
        backlog.insert(task("task-421"));
        let rails = rails_with(backlog, dir.path());

        let err = rails.validate("task-42").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::TaskSkipped);
        // Prefix overlap is not a match.
        assert!(rails.validate("task-421").await.is_ok());
    }

    #[tokio::test]
    async fn missing_task_fails_existence() {
        let dir = tempfile::TempDir::new().unwrap();
        let rails = rails_with(MemoryBacklog::default(), dir.path());

        let err = rails.validate("task-ghost").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::TaskNotFound);
    }

    #[tokio::test]
    async fn unsatisfied_dependencies_report_blockers() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        let mut t = task("task-2");
        t.dependencies = vec!["task-99".to_string(), "task-98".to_string()];
        backlog.insert(t);
        backlog.insert(task("task-99")); // still To Do

        let rails = rails_with(backlog, dir.path());
        let err = rails.validate("task-2").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::DependenciesNotSatisfied);
        assert!(err.reason.starts_with("Blocked by: "));
        assert!(err.reason.contains("task-99 (To Do)"));
        assert!(err.reason.contains("task-98 (not found)"));
    }

    #[tokio::test]
    async fn done_dependencies_pass() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        let mut dep = task("task-1");
        dep.status = TaskStatus::Done;
        backlog.insert(dep);
        let mut t = task("task-2");
        t.dependencies = vec!["task-1".to_string()];
        backlog.insert(t);

        let rails = rails_with(backlog, dir.path());
        assert!(rails.validate("task-2").await.is_ok());
    }

    #[tokio::test]
    async fn parse_error_surfaces_as_yaml_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        backlog.poison("task-bad", "mapping values are not allowed here");
        let rails = rails_with(backlog, dir.path());

        let err = rails.validate("task-bad").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::InvalidRecord);
        assert!(err.reason.starts_with("YAML invalid: "));
    }

    #[tokio::test]
    async fn backoff_blocks_immediately_after_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        backlog.insert(task("task-3"));
        let rails = rails_with(backlog, dir.path());

        rails.record_failure("task-3", "build failed");
        let err = rails.validate("task-3").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::BackoffActive);
        assert!(rails.time_until_retry("task-3").is_some());
    }

    #[tokio::test]
    async fn retry_limit_exhausts_after_max_retries() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        backlog.insert(task("task-3"));
        let rails = rails_with(backlog, dir.path());

        for _ in 0..3 {
            rails.record_failure("task-3", "boom");
        }
        let err = rails.validate("task-3").await.unwrap_err();
        assert_eq!(err.kind, ValidationFailureKind::RetryLimitExceeded);
        assert_eq!(err.reason, "Retry limit exceeded (3/3 attempts)");
        assert!(rails.time_until_retry("task-3").is_none());
    }

    #[test]
    fn backoff_schedule_is_10_30_90() {
        let dir = tempfile::TempDir::new().unwrap();
        let rails = SafetyRails::new(
            dir.path(),
            Arc::new(MemoryBacklog::default()),
            SafetyRailsConfig::default(),
        );

        rails.record_failure("task-3", "one");
        assert_eq!(
            rails.retry_state("task-3").unwrap().backoff,
            Duration::from_secs(10)
        );
        rails.record_failure("task-3", "two");
        assert_eq!(
            rails.retry_state("task-3").unwrap().backoff,
            Duration::from_secs(30)
        );
        rails.record_failure("task-3", "three");
        assert_eq!(
            rails.retry_state("task-3").unwrap().backoff,
            Duration::from_secs(90)
        );
        rails.record_failure("task-3", "four");
        assert_eq!(
            rails.retry_state("task-3").unwrap().backoff,
            Duration::from_secs(90)
        );
    }

    #[test]
    fn record_failure_is_monotonic_and_arms_the_clock() {
        let dir = tempfile::TempDir::new().unwrap();
        let rails = SafetyRails::new(
            dir.path(),
            Arc::new(MemoryBacklog::default()),
            SafetyRailsConfig::default(),
        );

        rails.record_failure("task-1", "first");
        let s1 = rails.retry_state("task-1").unwrap();
        assert_eq!(s1.attempt_count, 1);
        assert!(s1.next_retry_time > Instant::now());

        rails.record_failure("task-1", "second");
        let s2 = rails.retry_state("task-1").unwrap();
        assert!(s2.attempt_count > s1.attempt_count);
        assert_eq!(s2.last_error.as_deref(), Some("second"));
    }

    #[test]
    fn record_success_drops_retry_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let rails = SafetyRails::new(
            dir.path(),
            Arc::new(MemoryBacklog::default()),
            SafetyRailsConfig::default(),
        );

        rails.record_failure("task-1", "boom");
        rails.record_success("task-1");
        assert!(rails.retry_state("task-1").is_none());
    }

    // -- Cost estimation -----------------------------------------------------

    #[tokio::test]
    async fn estimate_low_priority_bare_task_is_8_cents() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        let mut t = task("task-1");
        t.priority = Priority::Low;
        backlog.insert(t);
        let rails = rails_with(backlog, dir.path());

        let est = rails.estimate_cost("task-1").await;
        assert_eq!(est.method, EstimateMethod::Heuristic);
        assert!((est.estimated_cost_usd - 0.08).abs() < 1e-9);
        assert!((est.confidence - 0.70).abs() < 1e-9);
        assert!(est.estimated_cost_usd >= 0.05);
    }

    #[tokio::test]
    async fn estimate_applies_multiplier_labels_and_criteria() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        let mut t = task("task-1");
        t.priority = Priority::High;
        t.labels = vec!["build".to_string(), "scaffold".to_string()];
        t.acceptance_criteria = vec!["a".to_string(), "b".to_string()];
        backlog.insert(t);
        let rails = rails_with(backlog, dir.path());

        // 0.10 * 1.5 + 0.15 + 0.05 + 2 * 0.02 = 0.39
        let est = rails.estimate_cost("task-1").await;
        assert!((est.estimated_cost_usd - 0.39).abs() < 1e-9);
        assert_eq!(est.factors.get("label_build"), Some(&0.15));
        assert_eq!(est.factors.get("priority_multiplier"), Some(&1.5));
    }

    #[tokio::test]
    async fn estimate_fix_label_is_floored() {
        let dir = tempfile::TempDir::new().unwrap();
        let backlog = MemoryBacklog::default();
        let mut t = task("task-1");
        t.priority = Priority::Low;
        t.labels = vec!["fix".to_string()];
        backlog.insert(t);
        let rails = rails_with(backlog, dir.path());

        // 0.10 * 0.8 - 0.05 = 0.03, floored to 0.05.
        let est = rails.estimate_cost("task-1").await;
        assert!((est.estimated_cost_usd - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn estimate_failure_yields_conservative_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let rails = rails_with(MemoryBacklog::default(), dir.path());

        let est = rails.estimate_cost("task-ghost").await;
        assert_eq!(est.method, EstimateMethod::Fallback);
        assert!((est.estimated_cost_usd - 0.50).abs() < 1e-9);
        assert!((est.confidence - 0.30).abs() < 1e-9);
    }
}
