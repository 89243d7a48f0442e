//! The structured result every handler produces.

/// Outcome of executing one task in a worktree.
///
/// Handlers are infallible at the type level: anything that goes wrong
/// (spawn failure, timeout, non-zero exit) is encoded as
/// `success = false` with an `error`, never as a Rust error.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Changed paths, relative to the worktree. Capped at 50 entries.
    pub files_changed: Vec<String>,
    /// Abbreviated (7-char) SHAs of commits created during the run.
    pub commits: Vec<String>,
    /// Tri-state: `Some(true)` / `Some(false)` when a test marker was
    /// recognized in the output, `None` when nothing was conclusive.
    pub tests_passed: Option<bool>,
    /// Process exit code; `-1` for timeouts and spawn failures.
    pub exit_code: i32,
    /// Combined stdout and stderr, truncated to at most 64 KiB.
    pub output: String,
    /// Short failure description (at most 500 characters).
    pub error: Option<String>,
    pub cost_usd: f64,
    pub duration_sec: f64,
}

impl ExecutionResult {
    /// A failure with no captured output.
    pub fn failure(error: impl Into<String>, exit_code: i32, duration_sec: f64) -> Self {
        Self {
            success: false,
            files_changed: Vec::new(),
            commits: Vec::new(),
            tests_passed: None,
            exit_code,
            output: String::new(),
            error: Some(error.into()),
            cost_usd: 0.0,
            duration_sec,
        }
    }
}
