//! The top-level session loop.
//!
//! A single coordinator task owns all shared state (session record, safety
//! monitor, retry map, worktree index) and is the only place that mutates
//! it, so budget checks and accounting can never interleave. Workers are
//! spawned per task, run the handler and result processing, and report
//! back over an mpsc channel.
//!
//! Per task the steps run strictly in order: validate, estimate, reserve
//! budget, create worktree, mark in-progress, execute, process, persist.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scaffold_backlog::{BacklogAdapter, TaskSpec, TaskStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::TaskFetcher;
use crate::handler::{ExecutionResult, HandlerRegistry};
use crate::process::{BacklogIntent, ProcessOutcome, ResultProcessor, ResultProcessorConfig};
use crate::route::TaskRouter;
use crate::safety::{SafetyMonitor, SafetyMonitorConfig, SafetyRails, SafetyRailsConfig};
use crate::safety::rails::ValidationFailureKind;
use crate::session::{SessionState, SessionStore};
use crate::vcs::VcsAdapter;
use crate::worktree::{WorktreeError, WorktreeManager};

/// Creator tag stamped on worktrees this orchestrator makes.
const CREATOR: &str = "orchestrator";

/// Longest single sleep while waiting out a retry backoff, so
/// cancellation and limit checks stay responsive.
const BACKOFF_WAIT_SLICE: Duration = Duration::from_secs(5);

/// How long to wait for in-flight workers after a user interrupt.
const INTERRUPT_DRAIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub repo_root: PathBuf,
    pub max_tasks: usize,
    pub max_concurrent: usize,
    pub max_cost_usd: f64,
    pub max_time_hours: f64,
    pub per_task_timeout: Duration,
    pub labels: Option<Vec<String>>,
    pub dry_run: bool,
    /// Resume a persisted session instead of starting a new one.
    pub resume_session: Option<String>,
    pub fetch_cache_ttl: Duration,
    pub remote: String,
    pub base_branch: String,
    /// Backoff before the single push/PR retry in result processing.
    pub vcs_retry_backoff: Duration,
}

impl OrchestratorConfig {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            max_tasks: 10,
            max_concurrent: 3,
            max_cost_usd: 5.0,
            max_time_hours: 4.0,
            per_task_timeout: Duration::from_secs(3600),
            labels: None,
            dry_run: false,
            resume_session: None,
            fetch_cache_ttl: TaskFetcher::DEFAULT_CACHE_TTL,
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            vcs_retry_backoff: Duration::from_secs(2),
        }
    }
}

/// What one session did, for reporting and exit-code selection.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub dry_run: bool,
    pub tasks_completed: Vec<String>,
    pub tasks_failed: Vec<String>,
    /// Tasks dropped without counting as completed or failed: manual
    /// actions, dry-run candidates, already-claimed worktrees.
    pub tasks_skipped: Vec<String>,
    pub total_cost: f64,
    pub total_duration_sec: f64,
    /// Why acquisition stopped early, if it did.
    pub abort_reason: Option<String>,
    pub interrupted: bool,
}

impl SessionSummary {
    pub fn no_work(&self) -> bool {
        self.tasks_completed.is_empty()
            && self.tasks_failed.is_empty()
            && self.tasks_skipped.is_empty()
    }
}

/// Outcome of a dispatch attempt.
enum Dispatch {
    /// The task was spawned, skipped, or recorded as failed.
    Handled,
    /// No worktree slot was available; the candidate is handed back.
    SlotsBusy(TaskSpec),
}

/// Message from a worker back to the coordinator.
struct TaskDone {
    task_id: String,
    route: String,
    result: ExecutionResult,
    outcome: ProcessOutcome,
}

/// Mutable state of one loop run, owned by the coordinator.
struct LoopState {
    session: SessionState,
    in_flight: usize,
    skipped: Vec<String>,
    /// Failed tasks with retry budget left. They stay `In Progress` in
    /// the backlog, so the To-Do fetcher will not re-surface them; the
    /// coordinator re-offers them itself.
    retry_pending: Vec<String>,
    /// Deferred backlog writes, re-attempted each iteration.
    pending_intents: Vec<(String, BacklogIntent)>,
    /// Estimated cost of in-flight tasks, so concurrent acquisitions
    /// cannot jointly over-commit the budget.
    reserved_cost: f64,
    reservations: Vec<(String, f64)>,
    abort_reason: Option<String>,
    interrupted: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    backlog: Arc<dyn BacklogAdapter>,
    fetcher: TaskFetcher,
    rails: SafetyRails,
    monitor: SafetyMonitor,
    worktrees: WorktreeManager,
    router: TaskRouter,
    registry: Arc<HandlerRegistry>,
    processor: Arc<ResultProcessor>,
    store: SessionStore,
}

impl Orchestrator {
    /// Wire up a session's components. Adapters are injected; everything
    /// else is constructed here.
    pub fn new(
        config: OrchestratorConfig,
        backlog: Arc<dyn BacklogAdapter>,
        vcs: Arc<dyn VcsAdapter>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        let store = SessionStore::open(&config.repo_root.join(crate::STATE_DIR))?;
        let worktrees = WorktreeManager::new(
            &config.repo_root,
            config.max_concurrent,
            config.remote.clone(),
        )
        .context("failed to open worktree manager")?;

        let fetcher = TaskFetcher::new(backlog.clone(), config.fetch_cache_ttl);
        let rails = SafetyRails::new(
            &config.repo_root,
            backlog.clone(),
            SafetyRailsConfig::default(),
        );
        let monitor = SafetyMonitor::new(SafetyMonitorConfig {
            max_cost_usd: config.max_cost_usd,
            max_time_hours: config.max_time_hours,
            ..Default::default()
        });
        let processor = Arc::new(ResultProcessor::new(
            backlog.clone(),
            vcs,
            worktrees.clone(),
            ResultProcessorConfig {
                remote: config.remote.clone(),
                base_branch: config.base_branch.clone(),
                retry_backoff: config.vcs_retry_backoff,
            },
        ));

        Ok(Self {
            config,
            backlog,
            fetcher,
            rails,
            monitor,
            worktrees,
            router: TaskRouter::new(),
            registry: Arc::new(registry),
            processor,
            store,
        })
    }

    pub fn router_mut(&mut self) -> &mut TaskRouter {
        &mut self.router
    }

    /// Run the session loop to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SessionSummary> {
        self.worktrees
            .reconcile()
            .context("worktree reconciliation failed")?;

        let mut state = LoopState {
            session: self.startup_session()?,
            in_flight: 0,
            skipped: Vec::new(),
            retry_pending: Vec::new(),
            pending_intents: Vec::new(),
            reserved_cost: 0.0,
            reservations: Vec::new(),
            abort_reason: None,
            interrupted: false,
        };

        // Orphan recovery: a resumed session may list in-progress tasks
        // whose workers died with the previous process. Release their
        // worktrees and re-offer them through the retry queue.
        let orphans: Vec<String> = state.session.tasks_in_progress.keys().cloned().collect();
        for task_id in &orphans {
            warn!(task_id = %task_id, "recovering orphaned in-progress task");
            if let Err(e) = self.worktrees.cleanup_worktree(task_id, true, true) {
                warn!(task_id = %task_id, error = %e, "failed to release orphaned worktree");
            }
            state.session.mark_skipped(task_id);
            push_unique(&mut state.retry_pending, task_id);
        }
        if !orphans.is_empty() {
            self.save(&state.session);
        }

        let (tx, mut rx) = mpsc::channel::<TaskDone>(self.config.max_concurrent.max(1) * 2);

        info!(
            session_id = %state.session.session_id,
            dry_run = self.config.dry_run,
            max_tasks = self.config.max_tasks,
            max_concurrent = self.config.max_concurrent,
            "session starting"
        );

        loop {
            self.flush_intents(&mut state.pending_intents).await;

            // Interrupt: stop acquiring, give in-flight workers a bounded
            // drain, then exit.
            if cancel.is_cancelled() {
                state.interrupted = true;
                state
                    .abort_reason
                    .get_or_insert_with(|| "interrupted by user".to_string());
                self.drain(&mut rx, &mut state, Some(INTERRUPT_DRAIN)).await;
                break;
            }

            // Fold any finished workers without blocking.
            while let Ok(done) = rx.try_recv() {
                state.in_flight -= 1;
                self.fold(done, &mut state).await;
            }

            // Session task cap.
            if state.session.settled_count() >= self.config.max_tasks {
                info!(max_tasks = self.config.max_tasks, "session task cap reached");
                self.drain(&mut rx, &mut state, None).await;
                break;
            }

            // Session hard limits. In-flight tasks finish their current
            // phase; nothing new is acquired.
            if let Err(breach) = self.monitor.check_limits() {
                warn!(reason = %breach, "session limit breached, aborting acquisition");
                state.abort_reason = Some(breach.to_string());
                self.drain(&mut rx, &mut state, None).await;
                break;
            }

            // All slots busy, or the cap will be reached once in-flight
            // tasks settle: wait for a worker.
            let remaining_slots = self
                .config
                .max_tasks
                .saturating_sub(state.session.settled_count() + state.in_flight);
            if state.in_flight >= self.config.max_concurrent || remaining_slots == 0 {
                self.wait_one(&mut rx, &mut state, &cancel).await;
                continue;
            }

            // Candidate selection: retry-pending tasks first, then the
            // fetched eligible queue.
            let candidates = self.collect_candidates(&mut state, remaining_slots).await;

            let mut picked: Option<(TaskSpec, f64)> = None;
            let mut min_backoff: Option<Duration> = None;
            let mut emergency: Option<String> = None;

            for task in candidates {
                match self.rails.validate(&task.id).await {
                    Ok(()) => {
                        let estimate = self.rails.estimate_cost(&task.id).await;
                        if self
                            .monitor
                            .would_exceed_cost(state.reserved_cost + estimate.estimated_cost_usd)
                        {
                            info!(
                                task_id = %task.id,
                                estimate = estimate.estimated_cost_usd,
                                "deferring task: estimate does not fit remaining budget"
                            );
                            continue;
                        }
                        picked = Some((task, estimate.estimated_cost_usd));
                        break;
                    }
                    Err(failure) if failure.kind == ValidationFailureKind::EmergencyStop => {
                        emergency = Some(failure.reason);
                        break;
                    }
                    Err(failure) if failure.kind == ValidationFailureKind::BackoffActive => {
                        if let Some(wait) = self.rails.time_until_retry(&task.id) {
                            min_backoff = Some(match min_backoff {
                                Some(current) => current.min(wait),
                                None => wait,
                            });
                        }
                        debug!(task_id = %task.id, reason = %failure, "task waiting out backoff");
                    }
                    Err(failure) => {
                        info!(task_id = %task.id, reason = %failure, "task failed validation");
                        if failure.kind == ValidationFailureKind::RetryLimitExceeded {
                            state.retry_pending.retain(|id| id != &task.id);
                        }
                    }
                }
            }

            if let Some(reason) = emergency {
                warn!(reason = %reason, "emergency stop, aborting acquisition");
                state.abort_reason = Some(format!("Emergency stop: {reason}"));
                self.drain(&mut rx, &mut state, None).await;
                break;
            }

            let Some((task, estimate)) = picked else {
                if state.in_flight > 0 {
                    self.wait_one(&mut rx, &mut state, &cancel).await;
                    continue;
                }
                if let Some(wait) = min_backoff {
                    let nap = wait.min(BACKOFF_WAIT_SLICE).max(Duration::from_millis(100));
                    debug!(wait_sec = wait.as_secs(), "all candidates in backoff, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }
                info!("no eligible work remaining");
                break;
            };

            // Dry run: the pipeline up to here ran for real; execution and
            // all writes are replaced by logging.
            if self.config.dry_run {
                info!(
                    task_id = %task.id,
                    title = %task.title,
                    estimate,
                    "[dry-run] would execute task"
                );
                state.skipped.push(task.id.clone());
                state.session.mark_skipped(&task.id);
                self.save(&state.session);
                continue;
            }

            if let Dispatch::SlotsBusy(task) =
                self.dispatch(task, estimate, &mut state, &tx).await
            {
                // Worktree slots are exhausted even though this loop has
                // spare workers (stale active entries can cause that).
                // Wait up to the per-task timeout for a slot to free; if
                // none does, defer the candidate and move on.
                let freed = self.wait_for_slot(&mut rx, &mut state, &cancel).await;
                if !freed && !cancel.is_cancelled() {
                    warn!(
                        task_id = %task.id,
                        "no worktree slot freed within the per-task timeout, deferring task"
                    );
                    state.skipped.push(task.id.clone());
                    state.retry_pending.retain(|id| id != &task.id);
                    state.session.mark_skipped(&task.id);
                    self.save(&state.session);
                }
            }
        }

        self.flush_intents(&mut state.pending_intents).await;
        self.save(&state.session);

        let summary = SessionSummary {
            session_id: state.session.session_id.clone(),
            dry_run: self.config.dry_run,
            tasks_completed: state.session.tasks_completed.clone(),
            tasks_failed: state.session.tasks_failed.clone(),
            tasks_skipped: state.skipped,
            total_cost: state.session.total_cost,
            total_duration_sec: state.session.total_duration_sec,
            abort_reason: state.abort_reason,
            interrupted: state.interrupted,
        };
        info!(
            session_id = %summary.session_id,
            completed = summary.tasks_completed.len(),
            failed = summary.tasks_failed.len(),
            skipped = summary.tasks_skipped.len(),
            total_cost = summary.total_cost,
            "session finished"
        );
        Ok(summary)
    }

    /// Create or resume the session record.
    fn startup_session(&self) -> Result<SessionState> {
        let session = match &self.config.resume_session {
            Some(id) => {
                let state = self.store.resume(id)?;
                info!(session_id = %id, "resuming session");
                state
            }
            None => {
                let id = self.store.allocate_session_id(chrono::Utc::now());
                SessionState::new(
                    id,
                    self.config.max_tasks,
                    self.config.max_cost_usd,
                    self.config.max_time_hours,
                )
            }
        };
        self.store.save(&session)?;
        Ok(session)
    }

    /// Assemble the candidate list for this iteration: retry-pending
    /// tasks (still `In Progress` in the backlog) followed by the fetched
    /// eligible queue.
    async fn collect_candidates(
        &self,
        state: &mut LoopState,
        remaining_slots: usize,
    ) -> Vec<TaskSpec> {
        let mut candidates: Vec<TaskSpec> = Vec::new();

        for task_id in state.retry_pending.clone() {
            if state.session.tasks_in_progress.contains_key(&task_id) {
                continue;
            }
            match self.backlog.get_task(&task_id).await {
                Ok(task) => candidates.push(task),
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "retry-pending task unavailable");
                }
            }
        }

        let fetched = self
            .fetcher
            .fetch_eligible(remaining_slots, self.config.labels.as_deref())
            .await;
        state
            .session
            .seed_queue(fetched.iter().map(|t| t.id.clone()));

        for task in fetched {
            if state.session.is_settled(&task.id)
                || state.session.tasks_in_progress.contains_key(&task.id)
                || state.skipped.iter().any(|s| s == &task.id)
                || candidates.iter().any(|c| c.id == task.id)
            {
                continue;
            }
            candidates.push(task);
        }

        candidates
    }

    /// Acquire a worktree for the picked task and spawn its worker.
    async fn dispatch(
        &mut self,
        task: TaskSpec,
        estimate: f64,
        state: &mut LoopState,
        tx: &mpsc::Sender<TaskDone>,
    ) -> Dispatch {
        let meta = match self.worktrees.create_worktree(&task.id, CREATOR) {
            Ok(meta) => meta,
            Err(WorktreeError::AlreadyExists(_)) => {
                warn!(task_id = %task.id, "worktree already exists, skipping task");
                state.skipped.push(task.id.clone());
                state.retry_pending.retain(|id| id != &task.id);
                state.session.mark_skipped(&task.id);
                self.save(&state.session);
                return Dispatch::Handled;
            }
            Err(WorktreeError::LimitReached { .. }) => {
                debug!(task_id = %task.id, "worktree slots exhausted, deferring");
                return Dispatch::SlotsBusy(task);
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "worktree creation failed");
                self.rails.record_failure(&task.id, &e.to_string());
                self.monitor.record_failure();
                state.session.mark_failed(&task.id, 0.0);
                if self.rails.can_retry(&task.id) {
                    push_unique(&mut state.retry_pending, &task.id);
                }
                self.save(&state.session);
                return Dispatch::Handled;
            }
        };

        // Mark acquired: session first (persisted), then the backlog.
        state.retry_pending.retain(|id| id != &task.id);
        state
            .session
            .mark_in_progress(&task.id, meta.worktree_path.clone());
        self.save(&state.session);
        if let Err(e) = self
            .backlog
            .update_status(&task.id, TaskStatus::InProgress)
            .await
        {
            warn!(task_id = %task.id, error = %e, "backlog acquisition write failed, deferring");
            state.pending_intents.push((
                task.id.clone(),
                BacklogIntent::SetStatus(TaskStatus::InProgress),
            ));
        }
        self.fetcher.invalidate_cache();

        // Route and resolve the handler, falling back to the default
        // route when the key has no registered handler.
        let mut route = self.router.route(&task).to_string();
        if self.registry.get(&route).is_none() {
            warn!(
                task_id = %task.id,
                route = %route,
                fallback = crate::route::CLAUDE_CODE,
                "no handler registered for route, falling back"
            );
            route = crate::route::CLAUDE_CODE.to_string();
        }

        state.reserved_cost += estimate;
        state.reservations.push((task.id.clone(), estimate));
        state.in_flight += 1;

        let registry = Arc::clone(&self.registry);
        let processor = Arc::clone(&self.processor);
        let tx = tx.clone();
        let timeout = self.config.per_task_timeout;
        let worktree_path = meta.worktree_path;

        tokio::spawn(async move {
            let result = match registry.get(&route) {
                Some(handler) => handler.execute(&task, &worktree_path, timeout).await,
                None => ExecutionResult::failure(
                    format!("handler '{route}' disappeared from registry"),
                    -1,
                    0.0,
                ),
            };
            let outcome = processor
                .process(&task, &worktree_path, &result, &route)
                .await;
            let _ = tx
                .send(TaskDone {
                    task_id: task.id.clone(),
                    route,
                    result,
                    outcome,
                })
                .await;
        });

        Dispatch::Handled
    }

    /// Fold a finished worker's report into session, monitor, and rails.
    async fn fold(&mut self, done: TaskDone, state: &mut LoopState) {
        if let Some(pos) = state
            .reservations
            .iter()
            .position(|(id, _)| id == &done.task_id)
        {
            let (_, estimate) = state.reservations.remove(pos);
            state.reserved_cost = (state.reserved_cost - estimate).max(0.0);
        }
        state.pending_intents.extend(done.outcome.deferred.clone());

        if done.route == crate::route::MANUAL {
            // Manual-action outcome: blocked, not failed.
            info!(task_id = %done.task_id, "task requires manual action, skipping");
            state.skipped.push(done.task_id.clone());
            state.session.mark_skipped(&done.task_id);
        } else if done.result.success && done.outcome.success {
            info!(task_id = %done.task_id, cost = done.result.cost_usd, "task completed");
            self.rails.record_success(&done.task_id);
            self.monitor.record_success(done.result.cost_usd);
            state.session.mark_completed(
                &done.task_id,
                done.result.cost_usd,
                done.result.duration_sec,
            );
        } else {
            let error = done
                .outcome
                .error
                .as_deref()
                .or(done.result.error.as_deref())
                .unwrap_or("unknown error");
            warn!(task_id = %done.task_id, error, "task failed");
            self.rails.record_failure(&done.task_id, error);
            self.monitor.record_failure();
            state
                .session
                .mark_failed(&done.task_id, done.result.duration_sec);
            if self.rails.can_retry(&done.task_id) {
                push_unique(&mut state.retry_pending, &done.task_id);
            }
        }

        self.fetcher.invalidate_cache();
        self.save(&state.session);
    }

    /// Wait up to the per-task timeout for a worker to report, freeing a
    /// worktree slot. Returns whether a result was folded.
    async fn wait_for_slot(
        &mut self,
        rx: &mut mpsc::Receiver<TaskDone>,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.per_task_timeout;
        tokio::select! {
            received = tokio::time::timeout_at(deadline, rx.recv()) => {
                match received {
                    Ok(Some(done)) => {
                        state.in_flight -= 1;
                        self.fold(done, state).await;
                        true
                    }
                    _ => false,
                }
            }
            _ = cancel.cancelled() => false,
        }
    }

    /// Block until one worker reports (or cancellation fires).
    async fn wait_one(
        &mut self,
        rx: &mut mpsc::Receiver<TaskDone>,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) {
        if state.in_flight == 0 {
            return;
        }
        tokio::select! {
            done = rx.recv() => {
                if let Some(done) = done {
                    state.in_flight -= 1;
                    self.fold(done, state).await;
                }
            }
            _ = cancel.cancelled() => {}
        }
    }

    /// Wait for all in-flight workers, folding their results. With a
    /// deadline (interrupt path), stop waiting when it expires.
    async fn drain(
        &mut self,
        rx: &mut mpsc::Receiver<TaskDone>,
        state: &mut LoopState,
        deadline: Option<Duration>,
    ) {
        if state.in_flight == 0 {
            return;
        }
        info!(in_flight = state.in_flight, "draining in-flight tasks");
        let drain_deadline = deadline.map(|d| tokio::time::Instant::now() + d);

        while state.in_flight > 0 {
            let received = match drain_deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(done) => done,
                    Err(_) => {
                        warn!(
                            remaining = state.in_flight,
                            "drain deadline expired with tasks still in flight"
                        );
                        break;
                    }
                },
                None => rx.recv().await,
            };
            let Some(done) = received else { break };
            state.in_flight -= 1;
            self.fold(done, state).await;
        }
    }

    /// Re-attempt deferred backlog writes; whatever still fails stays
    /// queued for the next iteration.
    async fn flush_intents(&self, pending: &mut Vec<(String, BacklogIntent)>) {
        if pending.is_empty() {
            return;
        }
        let mut still_pending = Vec::new();
        // Collapse duplicate status intents, keeping the newest per task.
        let mut seen_status: HashSet<String> = HashSet::new();
        for (task_id, intent) in pending.drain(..).rev() {
            if let BacklogIntent::SetStatus(_) = intent {
                if !seen_status.insert(task_id.clone()) {
                    continue;
                }
            }
            let result = match &intent {
                BacklogIntent::SetStatus(status) => {
                    self.backlog.update_status(&task_id, *status).await
                }
                BacklogIntent::AppendNotes(note) => {
                    self.backlog.append_notes(&task_id, note).await
                }
            };
            if let Err(e) = result {
                debug!(task_id = %task_id, error = %e, "deferred backlog write still failing");
                still_pending.push((task_id, intent));
            }
        }
        still_pending.reverse();
        *pending = still_pending;
    }

    /// Persist the session; a failed write is logged and retried at the
    /// next state change (prior persisted state governs resume).
    fn save(&self, session: &SessionState) {
        if let Err(e) = self.store.save(session) {
            warn!(error = %e, "session persistence failed; will retry on next transition");
        }
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}
