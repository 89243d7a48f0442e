//! Configuration file management for scaffold.
//!
//! Provides a TOML config file at `~/.config/scaffold/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Coding-agent CLI command.
    pub command: String,
    /// PR-hosting CLI command.
    pub gh_command: String,
    /// Per-task wall-clock timeout in seconds.
    pub task_timeout_sec: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: "claude-code".to_string(),
            gh_command: "gh".to_string(),
            task_timeout_sec: 3600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GitSection {
    pub remote: String,
    pub base_branch: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitsSection {
    pub max_tasks: usize,
    pub max_concurrent: usize,
    pub max_cost: f64,
    pub max_time_hours: f64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_tasks: 10,
            max_concurrent: 3,
            max_cost: 5.0,
            max_time_hours: 4.0,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Scaffold config directory, always in XDG layout:
/// `$XDG_CONFIG_HOME/scaffold` or `~/.config/scaffold`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("scaffold");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("scaffold")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Write a default config file. Fails if one exists unless `force`.
pub fn init_config(force: bool) -> Result<PathBuf> {
    let path = config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    save_config(&ConfigFile::default())?;
    Ok(path)
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Fully resolved run settings, ready to hand to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRun {
    pub dry_run: bool,
    pub max_tasks: usize,
    pub max_concurrent: usize,
    pub max_cost: f64,
    pub max_time_hours: f64,
    pub per_task_timeout: Duration,
    pub agent_cmd: String,
    pub gh_cmd: String,
    pub remote: String,
    pub base_branch: String,
}

/// CLI-provided overrides (each `None` when the flag was not given).
#[derive(Debug, Default, Clone)]
pub struct RunOverrides {
    pub dry_run: bool,
    pub max_tasks: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub max_cost: Option<f64>,
    pub max_time: Option<f64>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Resolve the effective run settings: CLI flag > env var > config file
/// > default. A missing config file is fine; a malformed one is not.
pub fn resolve_run(overrides: &RunOverrides) -> Result<ResolvedRun> {
    let file = if config_path().exists() {
        load_config()?
    } else {
        ConfigFile::default()
    };

    let dry_run = overrides.dry_run || env_flag("DRY_RUN").unwrap_or(false);
    let max_tasks = overrides
        .max_tasks
        .or_else(|| env_parse("MAX_TASKS"))
        .unwrap_or(file.limits.max_tasks);
    let max_concurrent = overrides
        .max_concurrent
        .or_else(|| env_parse("MAX_CONCURRENT"))
        .unwrap_or(file.limits.max_concurrent);
    let max_cost = overrides
        .max_cost
        .or_else(|| env_parse("MAX_COST"))
        .unwrap_or(file.limits.max_cost);
    let max_time_hours = overrides
        .max_time
        .or_else(|| env_parse("MAX_TIME_HOURS"))
        .unwrap_or(file.limits.max_time_hours);

    Ok(ResolvedRun {
        dry_run,
        max_tasks,
        max_concurrent,
        max_cost,
        max_time_hours,
        per_task_timeout: Duration::from_secs(file.agent.task_timeout_sec),
        agent_cmd: file.agent.command,
        gh_cmd: file.agent.gh_command,
        remote: file.git.remote,
        base_branch: file.git.base_branch,
    })
}
