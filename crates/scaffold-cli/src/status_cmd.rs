//! `scaffold status`: show persisted sessions and the worktree index.

use std::path::Path;

use anyhow::Result;

use scaffold_core::STATE_DIR;
use scaffold_core::session::SessionStore;
use scaffold_core::worktree::WorktreeManager;

pub fn run_status(repo_root: &Path) -> Result<()> {
    let store = SessionStore::open(&repo_root.join(STATE_DIR))?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions recorded.");
    } else {
        println!("Sessions:");
        for id in &sessions {
            match store.load(id)? {
                Some(state) => {
                    println!(
                        "  {}  completed={} failed={} in-progress={} cost=${:.2}",
                        id,
                        state.tasks_completed.len(),
                        state.tasks_failed.len(),
                        state.tasks_in_progress.len(),
                        state.total_cost,
                    );
                }
                None => println!("  {id}  (unreadable)"),
            }
        }
    }

    let worktrees = WorktreeManager::new(repo_root, usize::MAX, "origin")?;
    let all = worktrees.list_worktrees(None);
    if all.is_empty() {
        println!("\nNo worktrees tracked.");
        return Ok(());
    }

    println!("\nWorktrees:");
    for meta in all {
        let pr = meta.pr_url.as_deref().unwrap_or("-");
        println!(
            "  {}  [{}]  {}  {}",
            meta.task_id,
            meta.status,
            meta.worktree_path.display(),
            pr,
        );
    }
    Ok(())
}
