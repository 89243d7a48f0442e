//! Headless coding-agent CLI handler.
//!
//! Spawns the agent binary in non-interactive mode with the assembled
//! context as its prompt, captures combined stdout and stderr under a hard
//! wall-clock timeout, and scrapes the result for changed files, commits,
//! test outcomes, and cost. Every parse step is best-effort: a failed
//! probe degrades the corresponding field, never the whole result.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use scaffold_backlog::TaskSpec;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::ContextAssembler;
use crate::vcs::VcsAdapter;

use super::trait_def::Handler;
use super::types::ExecutionResult;

/// Captured output is truncated to this many bytes (the tail is kept:
/// test summaries, cost lines, and errors cluster at the end).
const MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// At most this many changed files are reported.
const MAX_FILES: usize = 50;
/// Error summaries are clipped to this many characters.
const MAX_ERROR_CHARS: usize = 500;

pub struct ClaudeCodeHandler {
    agent_cmd: String,
    assembler: ContextAssembler,
    vcs: Arc<dyn VcsAdapter>,
}

impl ClaudeCodeHandler {
    pub fn new(
        agent_cmd: impl Into<String>,
        assembler: ContextAssembler,
        vcs: Arc<dyn VcsAdapter>,
    ) -> Self {
        Self {
            agent_cmd: agent_cmd.into(),
            assembler,
            vcs,
        }
    }
}

#[async_trait]
impl Handler for ClaudeCodeHandler {
    fn name(&self) -> &str {
        crate::route::CLAUDE_CODE
    }

    async fn execute(
        &self,
        task: &TaskSpec,
        worktree_path: &Path,
        timeout: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();
        let context = self.assembler.assemble_context(task, worktree_path);
        debug!(task_id = %task.id, chars = context.len(), "assembled context");

        // HEAD before the run, so commits the agent creates can be listed.
        let start_sha = self.vcs.head_sha(worktree_path).await.ok();

        let mut child = match Command::new(&self.agent_cmd)
            .arg("--non-interactive")
            .arg("--prompt")
            .arg(&context)
            .current_dir(worktree_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to spawn agent binary");
                return ExecutionResult::failure(
                    format!("Execution failed: failed to spawn '{}': {e}", self.agent_cmd),
                    -1,
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutionResult::failure(
                    format!("Execution failed: {e}"),
                    -1,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(_) => {
                // The child is killed on drop; report the timeout.
                return ExecutionResult::failure(
                    format!("Execution timeout after {}s", timeout.as_secs()),
                    -1,
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let duration_sec = started.elapsed().as_secs_f64();
        let exit_code = output.status.code().unwrap_or(-1);

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            combined.push_str("\n\n--- STDERR ---\n");
            combined.push_str(&stderr);
        }
        let combined = truncate_tail(&combined, MAX_OUTPUT_BYTES);

        let files_changed = self.extract_files_changed(worktree_path, &combined).await;
        let commits = self.extract_commits(worktree_path, start_sha.as_deref(), &combined).await;
        let tests_passed = detect_tests_passed(&combined);
        let cost_usd = parse_cost(&combined);

        let success = is_successful(exit_code, tests_passed, &commits, &files_changed);
        let error = if success {
            None
        } else {
            Some(extract_error(&combined, exit_code))
        };

        info!(
            task_id = %task.id,
            success,
            exit_code,
            files = files_changed.len(),
            commits = commits.len(),
            duration_sec,
            "agent run finished"
        );

        ExecutionResult {
            success,
            files_changed,
            commits,
            tests_passed,
            exit_code,
            output: combined,
            error,
            cost_usd,
            duration_sec,
        }
    }
}

impl ClaudeCodeHandler {
    /// Changed files: ask the VCS first, fall back to scraping the
    /// output for file mentions.
    async fn extract_files_changed(&self, worktree_path: &Path, output: &str) -> Vec<String> {
        let mut files = match self.vcs.diff_names(worktree_path).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "could not diff worktree, falling back to output scan");
                Vec::new()
            }
        };
        if files.is_empty() {
            files = parse_files_from_output(output);
        }
        files.sort();
        files.dedup();
        files.truncate(MAX_FILES);
        files
    }

    /// Commits created during the run: VCS log from the pre-run HEAD,
    /// falling back to SHA-shaped mentions in the output.
    async fn extract_commits(
        &self,
        worktree_path: &Path,
        start_sha: Option<&str>,
        output: &str,
    ) -> Vec<String> {
        if let Some(start) = start_sha {
            match self.vcs.commits_since(worktree_path, start).await {
                Ok(commits) if !commits.is_empty() => {
                    return commits.into_iter().map(|c| abbreviate(&c)).collect();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "could not list commits, falling back to output scan");
                }
            }
        }
        parse_commits_from_output(output)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

static FILE_MENTION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?:modified|created|deleted):\s+(\S+)").unwrap(),
        Regex::new(r"([A-Za-z0-9_/\\.-]+\.py)\b").unwrap(),
        Regex::new(r"([A-Za-z0-9_/\\.-]+\.md)\b").unwrap(),
    ]
});

static COMMIT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\bcommit ([0-9a-f]{7,40})\b").unwrap(),
        Regex::new(r"\[([0-9a-f]{7,40})\]").unwrap(),
        Regex::new(r"Created commit ([0-9a-f]{7})\b").unwrap(),
    ]
});

static TESTS_PASSED_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\d+ passed in [\d.]+s").unwrap(),
        Regex::new(r"(?i)all tests? passed").unwrap(),
        Regex::new(r"OK \(\d+ tests?\)").unwrap(),
    ]
});

static TESTS_FAILED_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\d+ failed").unwrap(),
        Regex::new(r"(?i)FAILED tests?").unwrap(),
        Regex::new(r"(?im)^.*ERROR:.*\btests?\b.*$").unwrap(),
    ]
});

static COST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cost[:\s]+\$?([\d.]+)").unwrap());

static ERROR_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?im)^.*?ERROR:\s*(.+)$").unwrap(),
        Regex::new(r"(?im)^.*?Exception:\s*(.+)$").unwrap(),
        Regex::new(r"(?im)^.*?Failed:\s*(.+)$").unwrap(),
    ]
});

fn abbreviate(sha: &str) -> String {
    sha.chars().take(7).collect()
}

/// Keep the final `max_bytes` of `s`, prefixing a marker when truncated.
fn truncate_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

fn parse_files_from_output(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    for re in FILE_MENTION_RES.iter() {
        for cap in re.captures_iter(output) {
            if let Some(m) = cap.get(1) {
                let path = m.as_str().trim().to_string();
                if !path.is_empty() {
                    files.push(path);
                }
            }
        }
    }
    files
}

fn parse_commits_from_output(output: &str) -> Vec<String> {
    let mut commits = Vec::new();
    for re in COMMIT_RES.iter() {
        for cap in re.captures_iter(output) {
            if let Some(m) = cap.get(1) {
                let sha = abbreviate(m.as_str());
                if !commits.contains(&sha) {
                    commits.push(sha);
                }
            }
        }
    }
    commits
}

/// Tri-state test detection. Failure markers dominate pass markers.
fn detect_tests_passed(output: &str) -> Option<bool> {
    if TESTS_FAILED_RES.iter().any(|re| re.is_match(output)) {
        return Some(false);
    }
    if TESTS_PASSED_RES.iter().any(|re| re.is_match(output)) {
        return Some(true);
    }
    None
}

/// Cost: an explicit `cost: $N` marker in the output, else a rough
/// length-based heuristic ($0.10 per 10k chars, 4 decimals).
fn parse_cost(output: &str) -> f64 {
    if let Some(cap) = COST_RE.captures(output) {
        if let Ok(cost) = cap[1].parse::<f64>() {
            return cost;
        }
    }
    let estimated = (output.len() as f64 / 10_000.0) * 0.10;
    (estimated * 10_000.0).round() / 10_000.0
}

/// Success requires a zero exit, no test-failure marker, and hard
/// evidence of work: a commit, a changed file, or an explicit test pass.
/// A clean exit with none of those is a no-op run, not a success.
fn is_successful(
    exit_code: i32,
    tests_passed: Option<bool>,
    commits: &[String],
    files_changed: &[String],
) -> bool {
    exit_code == 0
        && tests_passed != Some(false)
        && (!commits.is_empty() || !files_changed.is_empty() || tests_passed == Some(true))
}

/// Short failure description: the first ERROR/Exception/Failed line, or
/// the tail of the output.
fn extract_error(output: &str, exit_code: i32) -> String {
    for re in ERROR_RES.iter() {
        if let Some(cap) = re.captures(output) {
            let message = cap[1].trim();
            return message.chars().take(MAX_ERROR_CHARS).collect();
        }
    }

    let trimmed = output.trim();
    if trimmed.is_empty() {
        return format!("agent exited with code {exit_code} and no output");
    }
    if trimmed.chars().count() > MAX_ERROR_CHARS {
        let tail: String = trimmed
            .chars()
            .rev()
            .take(MAX_ERROR_CHARS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("...{tail}")
    } else {
        trimmed.to_string()
    }
}
