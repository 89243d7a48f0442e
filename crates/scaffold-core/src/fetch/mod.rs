//! Eligible-task queries with caching and deterministic priority scoring.
//!
//! The fetcher is side-effect free with respect to the backlog: it only
//! reads. Results for the one query it ever issues (status To Do,
//! dependencies satisfied) are cached for a TTL; the label filter and the
//! `max_tasks` slice are applied to the cached list so repeated calls with
//! different filters do not refetch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scaffold_backlog::{BacklogAdapter, Priority, TaskQuery, TaskSpec};
use tracing::{debug, warn};

/// Deterministic priority score used to order fetched tasks.
///
/// Base: high 10, medium 5, low 1. Labels: `critical` +5, `quick-win` +3,
/// `user-action` -10. Age bonus: `min(age_days / 30, 2.0)` when a creation
/// date is present. Clamped at zero.
pub fn priority_score(task: &TaskSpec, now: DateTime<Utc>) -> f64 {
    let base = match task.priority {
        Priority::High => 10.0,
        Priority::Medium => 5.0,
        Priority::Low => 1.0,
    };

    let mut adjustment = 0.0;
    if task.has_label("critical") {
        adjustment += 5.0;
    }
    if task.has_label("quick-win") {
        adjustment += 3.0;
    }
    if task.has_label("user-action") {
        adjustment -= 10.0;
    }

    let age_bonus = task
        .created_date
        .map(|created| {
            let age_days = (now - created).num_seconds() as f64 / 86_400.0;
            (age_days / 30.0).clamp(0.0, 2.0)
        })
        .unwrap_or(0.0);

    (base + adjustment + age_bonus).max(0.0)
}

struct CachedFetch {
    tasks: Vec<TaskSpec>,
    fetched_at: Instant,
}

/// Cached, scored access to the eligible slice of the backlog.
pub struct TaskFetcher {
    backlog: Arc<dyn BacklogAdapter>,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedFetch>>,
}

impl TaskFetcher {
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

    pub fn new(backlog: Arc<dyn BacklogAdapter>, cache_ttl: Duration) -> Self {
        Self {
            backlog,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Fetch eligible tasks (status To Do, all dependencies Done), sorted
    /// by descending priority score with ties broken by ascending task id.
    ///
    /// Fetch errors are never raised: the read is retried once, then an
    /// empty list is returned and the failure logged.
    pub async fn fetch_eligible(
        &self,
        max_tasks: usize,
        labels: Option<&[String]>,
    ) -> Vec<TaskSpec> {
        let cached = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache
                .as_ref()
                .filter(|c| c.fetched_at.elapsed() < self.cache_ttl)
                .map(|c| c.tasks.clone())
        };

        let tasks = match cached {
            Some(tasks) => {
                debug!(count = tasks.len(), "using cached eligible tasks");
                tasks
            }
            None => match self.fetch_and_score().await {
                Some(fresh) => {
                    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    *cache = Some(CachedFetch {
                        tasks: fresh.clone(),
                        fetched_at: Instant::now(),
                    });
                    fresh
                }
                // Failed fetches are not cached; the next call retries.
                None => return Vec::new(),
            },
        };

        let mut filtered: Vec<TaskSpec> = match labels {
            Some(labels) if !labels.is_empty() => tasks
                .into_iter()
                .filter(|t| labels.iter().any(|l| t.has_label(l)))
                .collect(),
            _ => tasks,
        };
        filtered.truncate(max_tasks);
        filtered
    }

    /// Drop the cache so the next fetch hits the backlog. Called after
    /// every task transition this process performs.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
        debug!("fetch cache invalidated");
    }

    async fn fetch_and_score(&self) -> Option<Vec<TaskSpec>> {
        let query = TaskQuery::eligible();
        let result = match self.backlog.list_tasks(&query).await {
            Ok(tasks) => Ok(tasks),
            Err(first) => {
                warn!(error = %first, "backlog fetch failed, retrying once");
                self.backlog.list_tasks(&query).await
            }
        };

        let mut tasks = match result {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "backlog fetch failed twice, treating as empty");
                return None;
            }
        };

        let now = Utc::now();
        // Stable ordering: score descending, then task id ascending.
        tasks.sort_by(|a, b| {
            priority_score(b, now)
                .partial_cmp(&priority_score(a, now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(count = tasks.len(), "fetched eligible tasks");
        Some(tasks)
    }
}
