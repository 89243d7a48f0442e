//! Subprocess seam to the source-control binary and the PR-hosting CLI.
//!
//! Everything the result processor and the coding-agent handler need from
//! git and `gh` goes through the [`VcsAdapter`] trait, so tests can
//! substitute fakes and the CLI can point at alternate binaries. Each call
//! wraps one subprocess invocation with its own timeout.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("{command} failed to start: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("could not extract a PR URL from: {0}")]
    MissingPrUrl(String),
}

/// Result of staging and committing in a worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A commit was created; carries the abbreviated (7-char) SHA.
    Created(String),
    /// The tree was already clean. Not an error: the handler may have
    /// committed everything itself.
    NothingToCommit,
}

/// Source-control and PR-hosting operations the core depends on.
#[async_trait]
pub trait VcsAdapter: Send + Sync {
    /// Abbreviated (7-char) SHA of HEAD in `dir`.
    async fn head_sha(&self, dir: &Path) -> Result<String, VcsError>;

    /// Paths changed relative to HEAD (staged or not), one per entry.
    async fn diff_names(&self, dir: &Path) -> Result<Vec<String>, VcsError>;

    /// Abbreviated SHAs of commits in `start..HEAD`, oldest first.
    async fn commits_since(&self, dir: &Path, start: &str) -> Result<Vec<String>, VcsError>;

    /// Name of the branch checked out in `dir`.
    async fn current_branch(&self, dir: &Path) -> Result<String, VcsError>;

    /// Stage everything and commit. A clean tree yields
    /// [`CommitOutcome::NothingToCommit`], not an error.
    async fn stage_and_commit(
        &self,
        dir: &Path,
        message: &str,
    ) -> Result<CommitOutcome, VcsError>;

    /// Push `branch` to `remote`, optionally setting the upstream.
    async fn push(
        &self,
        dir: &Path,
        remote: &str,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), VcsError>;

    /// Open a draft pull request and return its URL.
    async fn create_draft_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String, VcsError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn VcsAdapter) {}
};

/// Real implementation over the `git` and `gh` binaries.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_cmd: String,
    gh_cmd: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git", "gh")
    }
}

impl GitCli {
    pub fn new(git_cmd: impl Into<String>, gh_cmd: impl Into<String>) -> Self {
        Self {
            git_cmd: git_cmd.into(),
            gh_cmd: gh_cmd.into(),
        }
    }

    /// Run one subprocess to completion with a timeout, returning stdout.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        dir: &Path,
        timeout: Duration,
    ) -> Result<String, VcsError> {
        let label = format!("{program} {}", args.first().copied().unwrap_or(""));
        debug!(command = %label, dir = %dir.display(), "running vcs command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VcsError::Command {
                command: label.clone(),
                source: e,
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| VcsError::Command {
                command: label.clone(),
                source: e,
            })?,
            Err(_) => {
                return Err(VcsError::Timeout {
                    command: label,
                    seconds: timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(VcsError::Exit {
                command: label,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

static PR_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+/pull/\d+").unwrap());

/// Extract the PR URL from hosting-CLI output: a bare URL on stdout, or
/// the first URL-shaped token anywhere in it.
fn parse_pr_url(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.starts_with("http") && !trimmed.contains(char::is_whitespace) {
        return Some(trimmed.to_string());
    }
    PR_URL_RE.find(output).map(|m| m.as_str().to_string())
}

#[async_trait]
impl VcsAdapter for GitCli {
    async fn head_sha(&self, dir: &Path) -> Result<String, VcsError> {
        let out = self
            .run(
                &self.git_cmd,
                &["rev-parse", "--short=7", "HEAD"],
                dir,
                Duration::from_secs(5),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn diff_names(&self, dir: &Path) -> Result<Vec<String>, VcsError> {
        let out = self
            .run(
                &self.git_cmd,
                &["diff", "--name-only", "HEAD"],
                dir,
                Duration::from_secs(5),
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn commits_since(&self, dir: &Path, start: &str) -> Result<Vec<String>, VcsError> {
        let range = format!("{start}..HEAD");
        let out = self
            .run(
                &self.git_cmd,
                &["log", "--format=%h", "--reverse", &range],
                dir,
                Duration::from_secs(5),
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn current_branch(&self, dir: &Path) -> Result<String, VcsError> {
        let out = self
            .run(
                &self.git_cmd,
                &["branch", "--show-current"],
                dir,
                Duration::from_secs(5),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn stage_and_commit(
        &self,
        dir: &Path,
        message: &str,
    ) -> Result<CommitOutcome, VcsError> {
        self.run(&self.git_cmd, &["add", "."], dir, Duration::from_secs(10))
            .await?;

        let result = self
            .run(
                &self.git_cmd,
                &["commit", "-m", message],
                dir,
                Duration::from_secs(30),
            )
            .await;

        match result {
            Ok(_) => {
                let sha = self.head_sha(dir).await?;
                info!(sha = %sha, "created commit");
                Ok(CommitOutcome::Created(sha))
            }
            Err(VcsError::Exit { stderr, code, command }) => {
                // `git commit` reports a clean tree on stdout, but by the
                // time it reaches us only stderr is kept; re-check status.
                let clean = self
                    .run(
                        &self.git_cmd,
                        &["status", "--porcelain"],
                        dir,
                        Duration::from_secs(5),
                    )
                    .await
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(false);
                if clean {
                    debug!("nothing to commit");
                    Ok(CommitOutcome::NothingToCommit)
                } else {
                    Err(VcsError::Exit {
                        command,
                        code,
                        stderr,
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn push(
        &self,
        dir: &Path,
        remote: &str,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), VcsError> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.push(remote);
        args.push(branch);
        self.run(&self.git_cmd, &args, dir, Duration::from_secs(60))
            .await?;
        info!(remote, branch, "pushed branch");
        Ok(())
    }

    async fn create_draft_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<String, VcsError> {
        let out = self
            .run(
                &self.gh_cmd,
                &[
                    "pr", "create", "--title", title, "--body", body, "--base", base, "--head",
                    head, "--draft",
                ],
                dir,
                Duration::from_secs(30),
            )
            .await?;
        parse_pr_url(&out).ok_or_else(|| VcsError::MissingPrUrl(out.trim().to_string()))
    }
}
