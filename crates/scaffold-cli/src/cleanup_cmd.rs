//! `scaffold cleanup`: reclaim worktrees that are no longer working.
//!
//! Removes worktrees whose metadata says stale, abandoned, or merged
//! (handed off). With `--all`, active worktrees go too. An age threshold
//! first transitions old active worktrees to stale.

use std::path::Path;

use anyhow::Result;

use scaffold_core::worktree::{WorktreeError, WorktreeManager, WorktreeStatus};

pub fn run_cleanup(
    repo_root: &Path,
    all: bool,
    older_than_hours: Option<f64>,
    max_concurrent: usize,
) -> Result<()> {
    let worktrees = WorktreeManager::new(repo_root, max_concurrent, "origin")?;
    worktrees.reconcile()?;

    if let Some(hours) = older_than_hours {
        let aged = worktrees.mark_stale(chrono::Duration::seconds((hours * 3600.0) as i64))?;
        if aged > 0 {
            println!("Marked {aged} worktree(s) stale (older than {hours}h).");
        }
    }

    let mut removed = 0;
    let mut skipped = 0;

    for meta in worktrees.list_worktrees(None) {
        let reclaim = all
            || matches!(
                meta.status,
                WorktreeStatus::Stale | WorktreeStatus::Abandoned | WorktreeStatus::Merged
            );
        if !reclaim {
            skipped += 1;
            continue;
        }

        match worktrees.cleanup_worktree(&meta.task_id, all, true) {
            Ok(()) => {
                if meta.worktree_path.exists() {
                    // Still present means the removal was refused.
                    skipped += 1;
                } else {
                    println!("  Removed: {} ({})", meta.task_id, meta.worktree_path.display());
                    removed += 1;
                }
            }
            Err(WorktreeError::DirtyWorktree(path)) => {
                eprintln!(
                    "  Skipping {}: uncommitted changes in {} (use --all to force)",
                    meta.task_id,
                    path.display()
                );
                skipped += 1;
            }
            Err(e) => {
                eprintln!("  Warning: failed to remove worktree for {}: {e}", meta.task_id);
                skipped += 1;
            }
        }
    }

    println!("\nCleanup complete: {removed} worktree(s) removed, {skipped} skipped.");
    Ok(())
}
