//! Prompt assembly for the coding-agent handler.
//!
//! The assembled context has five blocks: project instructions, a
//! repository snapshot (pruned file tree plus recent log), the task
//! specification, the execution environment, and closing instructions.
//! Every block degrades independently; total failure still yields a
//! minimal prompt with the task id, title, description, and worktree
//! path. Assembly never returns an error.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use scaffold_backlog::TaskSpec;
use tracing::debug;

/// Directories excluded from the repository snapshot tree.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    ".scaffold",
];

#[derive(Debug, Clone)]
pub struct ContextAssemblerConfig {
    /// Project instructions document looked up under the repo root.
    pub instructions_file: String,
    /// How many leading lines of the instructions document to include.
    pub instructions_max_lines: usize,
    /// Maximum depth of the file tree snapshot.
    pub tree_max_depth: usize,
    /// How many recent log lines to include.
    pub log_lines: usize,
}

impl Default for ContextAssemblerConfig {
    fn default() -> Self {
        Self {
            instructions_file: "CLAUDE.md".to_string(),
            instructions_max_lines: 200,
            tree_max_depth: 3,
            log_lines: 10,
        }
    }
}

/// Composes a single prompt string for handler execution.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    repo_root: PathBuf,
    config: ContextAssemblerConfig,
}

impl ContextAssembler {
    pub fn new(repo_root: impl Into<PathBuf>, config: ContextAssemblerConfig) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
        }
    }

    /// Build the full prompt for a task executing in `worktree_path`.
    pub fn assemble_context(&self, task: &TaskSpec, worktree_path: &Path) -> String {
        let mut out = String::new();

        if let Some(instructions) = self.instructions_block() {
            out.push_str("# Project Instructions\n\n");
            out.push_str(&instructions);
            out.push_str("\n\n");
        }

        if let Some(tree) = self.tree_block(worktree_path) {
            out.push_str("# Repository Snapshot\n\n");
            out.push_str("## File tree\n\n");
            out.push_str(&tree);
            out.push('\n');
            if let Some(log) = self.log_block(worktree_path) {
                out.push_str("## Recent commits\n\n");
                out.push_str(&log);
                out.push('\n');
            }
        }

        out.push_str(&self.task_block(task));
        out.push_str(&environment_block(task, worktree_path));
        out.push_str(CLOSING_INSTRUCTIONS);

        out
    }

    fn instructions_block(&self) -> Option<String> {
        let path = self.repo_root.join(&self.config.instructions_file);
        let contents = std::fs::read_to_string(&path).ok()?;
        let block: Vec<&str> = contents
            .lines()
            .take(self.config.instructions_max_lines)
            .collect();
        if block.is_empty() {
            return None;
        }
        Some(block.join("\n"))
    }

    fn tree_block(&self, root: &Path) -> Option<String> {
        let mut out = String::new();
        if walk_tree(root, 0, self.config.tree_max_depth, &mut out).is_err() {
            debug!(root = %root.display(), "file tree snapshot failed, omitting");
            return None;
        }
        (!out.is_empty()).then_some(out)
    }

    fn log_block(&self, worktree_path: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["log", "--oneline", "--decorate"])
            .arg(format!("-{}", self.config.log_lines))
            .current_dir(worktree_path)
            .output()
            .ok()?;
        if !output.status.success() {
            debug!("git log failed, omitting recent commits block");
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    fn task_block(&self, task: &TaskSpec) -> String {
        let mut out = String::new();
        out.push_str("# Task\n\n");
        let _ = writeln!(out, "ID: {}", task.id);
        let _ = writeln!(out, "Title: {}", task.title);
        let _ = writeln!(out, "Priority: {}", task.priority);
        if !task.labels.is_empty() {
            let _ = writeln!(out, "Labels: {}", task.labels.join(", "));
        }
        out.push('\n');
        if !task.description.is_empty() {
            out.push_str(&task.description);
            out.push_str("\n\n");
        }
        if !task.acceptance_criteria.is_empty() {
            out.push_str("Acceptance criteria:\n");
            for criterion in &task.acceptance_criteria {
                let _ = writeln!(out, "- [ ] {criterion}");
            }
            out.push('\n');
        }
        out
    }
}

fn environment_block(task: &TaskSpec, worktree_path: &Path) -> String {
    format!(
        "# Execution Environment\n\n\
         Worktree: {}\n\
         Task ID: {}\n\n",
        worktree_path.display(),
        task.id
    )
}

const CLOSING_INSTRUCTIONS: &str = "# Instructions\n\n\
    Execute the task so every acceptance criterion is satisfied. Commit your \
    changes with a descriptive message, and make sure the test suite passes \
    before finishing.\n";

/// Depth-limited directory walk, sorted by name.
fn walk_tree(
    dir: &Path,
    depth: usize,
    max_depth: usize,
    out: &mut String,
) -> std::io::Result<()> {
    if depth >= max_depth {
        return Ok(());
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let indent = "  ".repeat(depth);
        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name) || name.starts_with(".scaffold_") {
                continue;
            }
            let _ = writeln!(out, "{indent}{name}/");
            walk_tree(&path, depth + 1, max_depth, out)?;
        } else {
            let _ = writeln!(out, "{indent}{name}");
        }
    }
    Ok(())
}
