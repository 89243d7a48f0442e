//! `scaffold run`: execute one orchestrator session.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use scaffold_backlog::MarkdownBacklog;
use scaffold_core::context::{ContextAssembler, ContextAssemblerConfig};
use scaffold_core::handler::{ClaudeCodeHandler, HandlerRegistry, ManualHandler};
use scaffold_core::orchestrator::{Orchestrator, OrchestratorConfig, SessionSummary};
use scaffold_core::vcs::GitCli;

use crate::config::ResolvedRun;

/// Exit code per the session outcome:
/// 0 when at least one task completed, on a dry run, or on a clean
/// shutdown with nothing attempted; 1 when every attempted task failed;
/// 2 when no work was available; 130 on user interrupt.
pub fn exit_code(summary: &SessionSummary) -> i32 {
    if summary.interrupted {
        return 130;
    }
    if summary.dry_run {
        return 0;
    }
    if !summary.tasks_completed.is_empty() {
        return 0;
    }
    if !summary.tasks_failed.is_empty() {
        return 1;
    }
    if summary.abort_reason.is_some() {
        // Clean shutdown (emergency stop, limit breach) before any work.
        return 0;
    }
    2
}

pub fn print_summary(summary: &SessionSummary) {
    println!();
    println!("============================================================");
    println!("Session Summary");
    println!("============================================================");
    println!("Session ID:      {}", summary.session_id);
    println!("Dry Run:         {}", summary.dry_run);
    println!("Tasks Completed: {}", summary.tasks_completed.len());
    for task in &summary.tasks_completed {
        println!("  - {task}");
    }
    println!("Tasks Failed:    {}", summary.tasks_failed.len());
    for task in &summary.tasks_failed {
        println!("  - {task}");
    }
    println!("Tasks Skipped:   {}", summary.tasks_skipped.len());
    println!("Total Cost:      ${:.2}", summary.total_cost);
    println!("Total Duration:  {:.1}s", summary.total_duration_sec);
    if let Some(reason) = &summary.abort_reason {
        println!("Aborted:         {reason}");
    }
    println!("============================================================");
}

/// Build and run the orchestrator; returns the summary for exit-code
/// selection.
pub async fn run(
    repo_root: &Path,
    settings: &ResolvedRun,
    labels: Option<Vec<String>>,
    resume: Option<String>,
) -> Result<SessionSummary> {
    let repo_root = repo_root
        .canonicalize()
        .with_context(|| format!("repository root not found: {}", repo_root.display()))?;

    let backlog = Arc::new(MarkdownBacklog::discover(&repo_root));
    let vcs = Arc::new(GitCli::new("git", settings.gh_cmd.clone()));

    let mut registry = HandlerRegistry::new();
    registry.register(ClaudeCodeHandler::new(
        settings.agent_cmd.clone(),
        ContextAssembler::new(&repo_root, ContextAssemblerConfig::default()),
        vcs.clone(),
    ));
    registry.register(ManualHandler::new());

    let mut config = OrchestratorConfig::new(&repo_root);
    config.max_tasks = settings.max_tasks;
    config.max_concurrent = settings.max_concurrent;
    config.max_cost_usd = settings.max_cost;
    config.max_time_hours = settings.max_time_hours;
    config.per_task_timeout = settings.per_task_timeout;
    config.labels = labels;
    config.dry_run = settings.dry_run;
    config.resume_session = resume;
    config.remote = settings.remote.clone();
    config.base_branch = settings.base_branch.clone();

    let orchestrator = Orchestrator::new(config, backlog, vcs, registry)?;

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    orchestrator.run(cancel).await
}
