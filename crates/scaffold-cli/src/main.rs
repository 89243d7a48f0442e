mod cleanup_cmd;
mod config;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::RunOverrides;

#[derive(Parser)]
#[command(name = "scaffold", about = "Autonomous task orchestrator: backlog in, draft PRs out")]
struct Cli {
    /// Repository root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file to ~/.config/scaffold/config.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run one orchestrator session
    Run {
        /// Skip handler execution and VCS writes (env: DRY_RUN)
        #[arg(long)]
        dry_run: bool,
        /// Session task cap (env: MAX_TASKS, default 10)
        #[arg(long)]
        max_tasks: Option<usize>,
        /// Worker pool size (env: MAX_CONCURRENT, default 3)
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Session USD cap (env: MAX_COST, default 5.0)
        #[arg(long)]
        max_cost: Option<f64>,
        /// Session wall-clock cap in hours (env: MAX_TIME_HOURS, default 4.0)
        #[arg(long)]
        max_time: Option<f64>,
        /// Restrict to tasks carrying any listed label (comma-separated)
        #[arg(long)]
        labels: Option<String>,
        /// Resume a persisted session by id
        #[arg(long)]
        resume: Option<String>,
    },
    /// Show persisted sessions and the worktree index
    Status,
    /// Reclaim stale, abandoned, and handed-off worktrees
    Cleanup {
        /// Remove every tracked worktree, including active and dirty ones
        #[arg(long)]
        all: bool,
        /// First mark active worktrees older than this many hours stale
        #[arg(long)]
        older_than_hours: Option<f64>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = config::init_config(force)?;
            println!("Config written to {}", path.display());
            println!("Edit it to point at your agent binary, remote, and base branch.");
        }
        Commands::Run {
            dry_run,
            max_tasks,
            max_concurrent,
            max_cost,
            max_time,
            labels,
            resume,
        } => {
            let overrides = RunOverrides {
                dry_run,
                max_tasks,
                max_concurrent,
                max_cost,
                max_time,
            };
            let settings = config::resolve_run(&overrides)?;
            let labels = labels.map(|csv| {
                csv.split(',')
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
            });

            match run_cmd::run(&cli.repo, &settings, labels, resume).await {
                Ok(summary) => {
                    run_cmd::print_summary(&summary);
                    std::process::exit(run_cmd::exit_code(&summary));
                }
                Err(e) => {
                    eprintln!("Fatal error: {e:#}");
                    std::process::exit(3);
                }
            }
        }
        Commands::Status => {
            status_cmd::run_status(&cli.repo)?;
        }
        Commands::Cleanup {
            all,
            older_than_hours,
        } => {
            cleanup_cmd::run_cleanup(&cli.repo, all, older_than_hours, 3)?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}
