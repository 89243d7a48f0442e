//! Full-stack session tests: Markdown backlog on disk, the real
//! coding-agent handler running fake agent binaries, the real git CLI
//! adapter pushing to a local bare remote, and a fake PR-hosting CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use scaffold_backlog::{BacklogAdapter, MarkdownBacklog, Priority, TaskSpec, TaskStatus};
use scaffold_core::context::{ContextAssembler, ContextAssemblerConfig};
use scaffold_core::handler::{ClaudeCodeHandler, HandlerRegistry, ManualHandler};
use scaffold_core::orchestrator::{Orchestrator, OrchestratorConfig};
use scaffold_core::vcs::GitCli;
use scaffold_test_utils::{git, temp_git_repo, write_script};

fn seed_task(repo: &Path) -> Arc<MarkdownBacklog> {
    let backlog = MarkdownBacklog::discover(repo);
    let mut task = TaskSpec::new("task-1", "BUILD: Teach the repo a trick");
    task.description = "Add a trick file.".to_string();
    task.priority = Priority::High;
    task.labels = vec!["build".to_string()];
    task.acceptance_criteria = vec!["trick.txt exists".to_string()];
    backlog.put_task(&task).unwrap();
    // The backlog directory is part of the repo.
    git(&["add", "."], repo);
    git(&["commit", "-m", "Add backlog"], repo);
    Arc::new(backlog)
}

fn bare_remote(dir: &Path, repo: &Path) -> PathBuf {
    let bare = dir.join("remote.git");
    let output = std::process::Command::new("git")
        .args(["init", "--bare"])
        .arg(&bare)
        .output()
        .unwrap();
    assert!(output.status.success());
    git(&["remote", "add", "origin", bare.to_str().unwrap()], repo);
    bare
}

fn orchestrator_over(
    repo: &Path,
    backlog: Arc<MarkdownBacklog>,
    agent: &Path,
    gh: &Path,
    dry_run: bool,
    labels: Option<Vec<String>>,
) -> Orchestrator {
    let vcs = Arc::new(GitCli::new("git", gh.to_string_lossy().into_owned()));

    let mut registry = HandlerRegistry::new();
    registry.register(ClaudeCodeHandler::new(
        agent.to_string_lossy().into_owned(),
        ContextAssembler::new(repo, ContextAssemblerConfig::default()),
        vcs.clone(),
    ));
    registry.register(ManualHandler::new());

    let mut config = OrchestratorConfig::new(repo);
    config.max_concurrent = 1;
    config.per_task_timeout = Duration::from_secs(60);
    config.dry_run = dry_run;
    config.labels = labels;
    config.vcs_retry_backoff = Duration::ZERO;

    Orchestrator::new(config, backlog, vcs, registry).expect("orchestrator construction failed")
}

#[tokio::test]
async fn full_run_completes_a_task_through_the_real_stack() {
    let (dir, repo) = temp_git_repo();
    let backlog = seed_task(&repo);
    bare_remote(dir.path(), &repo);

    // The fake agent does real work: writes a file, commits, reports tests.
    let agent = write_script(
        dir.path(),
        "agent.sh",
        "echo 'trick' > trick.txt\n\
         git add . >/dev/null 2>&1\n\
         git commit -m 'add trick' >/dev/null 2>&1\n\
         echo 'All tests passed'\n\
         echo 'cost: $0.10'\n",
    );
    let gh = write_script(
        dir.path(),
        "gh.sh",
        "echo 'https://github.com/example/repo/pull/1'\n",
    );

    let orchestrator =
        orchestrator_over(&repo, backlog.clone(), &agent, &gh, false, None);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("run failed");

    assert_eq!(summary.tasks_completed, vec!["task-1"]);
    assert!(summary.tasks_failed.is_empty());
    assert!((summary.total_cost - 0.10).abs() < 1e-9);

    // The task file on disk was transitioned and annotated.
    let task = backlog.get_task("task-1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.implementation_notes.contains("pull/1"));

    // The branch made it to the remote.
    let output = std::process::Command::new("git")
        .args(["ls-remote", "--heads", "origin", "autonomous/task-1"])
        .current_dir(&repo)
        .output()
        .unwrap();
    assert!(
        !output.stdout.is_empty(),
        "expected autonomous/task-1 on the remote"
    );

    // State was persisted under .scaffold/.
    assert!(repo.join(".scaffold/worktrees.json").exists());
    assert!(
        repo.join(".scaffold/sessions")
            .join(format!("{}.json", summary.session_id))
            .exists()
    );
}

#[tokio::test]
async fn agent_failure_is_recorded_and_worktree_released() {
    let (dir, repo) = temp_git_repo();
    let backlog = seed_task(&repo);
    bare_remote(dir.path(), &repo);

    let agent = write_script(
        dir.path(),
        "agent.sh",
        "echo 'ERROR: no API key' >&2\nexit 2\n",
    );
    let gh = write_script(dir.path(), "gh.sh", "exit 9\n");

    // One failing attempt is enough; cap the session at a single settled
    // task so the backoff retry loop does not extend the test.
    let vcs = Arc::new(GitCli::new("git", gh.to_string_lossy().into_owned()));
    let mut registry = HandlerRegistry::new();
    registry.register(ClaudeCodeHandler::new(
        agent.to_string_lossy().into_owned(),
        ContextAssembler::new(&repo, ContextAssemblerConfig::default()),
        vcs.clone(),
    ));
    registry.register(ManualHandler::new());
    let mut config = OrchestratorConfig::new(&repo);
    config.max_concurrent = 1;
    config.max_tasks = 1;
    config.per_task_timeout = Duration::from_secs(60);
    let orchestrator = Orchestrator::new(config, backlog.clone(), vcs, registry).unwrap();
    let summary = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.tasks_failed, vec!["task-1"]);
    assert!(summary.tasks_completed.is_empty());

    let task = backlog.get_task("task-1").await.unwrap();
    // Failed tasks keep their in-progress status for later retry runs.
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.implementation_notes.contains("no API key"));

    // The worktree directory was released.
    let worktree = repo.parent().unwrap().join("repo-task-1");
    assert!(!worktree.exists());
}

#[tokio::test]
async fn dry_run_reports_work_without_doing_any() {
    let (dir, repo) = temp_git_repo();
    let backlog = seed_task(&repo);

    // Binaries that would fail loudly if invoked.
    let agent = write_script(dir.path(), "agent.sh", "echo 'should not run' >&2\nexit 9\n");
    let gh = write_script(dir.path(), "gh.sh", "exit 9\n");

    let orchestrator = orchestrator_over(&repo, backlog.clone(), &agent, &gh, true, None);
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("dry run failed");

    assert!(summary.dry_run);
    assert!(summary.tasks_skipped.contains(&"task-1".to_string()));
    assert!(summary.tasks_completed.is_empty());

    let task = backlog.get_task("task-1").await.unwrap();
    assert_eq!(task.status, TaskStatus::ToDo);
    assert!(!repo.parent().unwrap().join("repo-task-1").exists());
}

#[tokio::test]
async fn label_filter_restricts_the_session() {
    let (dir, repo) = temp_git_repo();
    let backlog = MarkdownBacklog::discover(&repo);
    let mut build = TaskSpec::new("task-build", "BUILD: b");
    build.labels = vec!["build".to_string()];
    backlog.put_task(&build).unwrap();
    let mut docs = TaskSpec::new("task-docs", "DOCS: d");
    docs.labels = vec!["docs".to_string()];
    backlog.put_task(&docs).unwrap();
    git(&["add", "."], &repo);
    git(&["commit", "-m", "Add backlog"], &repo);
    bare_remote(dir.path(), &repo);
    let backlog = Arc::new(backlog);

    let agent = write_script(
        dir.path(),
        "agent.sh",
        "echo ok > done.txt\ngit add . >/dev/null 2>&1\ngit commit -m done >/dev/null 2>&1\necho 'All tests passed'\n",
    );
    let gh = write_script(
        dir.path(),
        "gh.sh",
        "echo 'https://github.com/example/repo/pull/2'\n",
    );

    let orchestrator = orchestrator_over(
        &repo,
        backlog.clone(),
        &agent,
        &gh,
        false,
        Some(vec!["docs".to_string()]),
    );
    let summary = orchestrator
        .run(CancellationToken::new())
        .await
        .expect("run failed");

    assert_eq!(summary.tasks_completed, vec!["task-docs"]);
    assert_eq!(
        backlog.get_task("task-build").await.unwrap().status,
        TaskStatus::ToDo
    );
}
