//! Orchestrator: scheduling loop, admission, completion handling, shutdown
//! cascade, and durable state snapshots.
//!
//! Two scheduling classes coexist in one run. The sequential class (P0 by
//! default) is processed one at a time: the loop waits for the pool to
//! drain, submits, and handles the result inline. The parallel class fills
//! the pool up to `max_workers`. Blocked issues wait regardless of priority;
//! priority wins only on the unblocked set.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::RunConfig;
use crate::git::GitLock;
use crate::issue::{Issue, Priority};
use crate::merge::{MergeCoordinator, MergeHooks, MergeSettled};
use crate::pool::WorkerPool;
use crate::ports::{AssistantRunner, GitRunner};
use crate::queue::IssueQueue;
use crate::report::RunReport;
use crate::state::{
    utc_now, MergeRequest, MergeStatus, OrchestratorState, PendingWorktreeInfo, StateStore,
    WorkerResult,
};

/// How long the shutdown cascade waits for in-flight pipelines to drain
/// before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
/// Loop wakeup bound so the shutdown flag is observable within ~1 second.
const EVENT_WAIT: Duration = Duration::from_secs(1);
const DEFER_WAIT: Duration = Duration::from_millis(50);
const GIT_OP_TIMEOUT: Duration = Duration::from_secs(120);

enum Event {
    WorkerDone(WorkerResult),
    MergeSettled(MergeSettled),
}

/// What `run` hands back to the CLI.
#[derive(Debug)]
pub struct RunSummary {
    pub interrupted: bool,
    pub merged: usize,
    pub failed: usize,
    pub report_text: String,
}

pub struct Orchestrator {
    config: Arc<RunConfig>,
    git: Arc<GitLock>,
    assistant: Arc<dyn AssistantRunner>,
    shutdown: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Run,
    /// Already completed in a prior run or earlier in this one.
    DropCompleted,
    /// Filtered out; the reason is user-facing.
    DropFiltered(String),
    /// Unmet blockers still pending or running.
    Defer,
    /// Every unmet blocker failed; propagate the failure.
    FailCascade(Vec<String>),
}

struct RunCtx<'a> {
    config: &'a RunConfig,
    queue: &'a IssueQueue,
    pool: &'a WorkerPool,
    coordinator: &'a MergeCoordinator,
    issue_index: &'a HashMap<String, Issue>,
    store: &'a StateStore,
    state: &'a mut OrchestratorState,
    report: &'a mut RunReport,
    merges_inflight: usize,
}

impl Orchestrator {
    pub fn new(config: RunConfig, assistant: Arc<dyn AssistantRunner>) -> Self {
        Self {
            config: Arc::new(config),
            git: Arc::new(GitLock::new()),
            assistant,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag flipped by the signal handler; the loop observes it within a
    /// second and starts the shutdown cascade.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn git_lock(&self) -> Arc<GitLock> {
        Arc::clone(&self.git)
    }

    /// Execute one run over the scanned issues.
    pub fn run(&self, issues: Vec<Issue>, resume: bool) -> Result<RunSummary> {
        let run_started = Instant::now();
        let config = Arc::clone(&self.config);

        fs::create_dir_all(config.worktree_base())
            .with_context(|| format!("creating {}", config.worktree_base().display()))?;
        ensure_gitignore_entry(&config.repo_root, &config.worktree_base_dir)?;

        let store = StateStore::new(&config.repo_root);
        let mut state = if resume {
            store.load().context("loading prior state")?
        } else {
            OrchestratorState::fresh()
        };
        state.pending_worktrees.clear();

        // Seed the queue. Prior terminal IDs are pre-marked so they are
        // never re-issued; `add` rejects them.
        let queue = IssueQueue::new();
        for id in &state.completed_issues {
            queue.mark_completed(id);
        }
        for id in state.failed_issues.keys() {
            queue.mark_failed(id);
        }
        let mut issue_index: HashMap<String, Issue> = HashMap::new();
        for issue in issues {
            issue_index.insert(issue.issue_id.clone(), issue.clone());
            queue.add(issue);
        }

        let (tx, rx) = mpsc::channel::<Event>();
        let git_runner: Arc<dyn GitRunner> = Arc::clone(&self.git) as Arc<dyn GitRunner>;
        let worker_tx = tx.clone();
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&config),
            Arc::clone(&git_runner),
            Arc::clone(&self.assistant),
            Box::new(move |result| {
                let _ = worker_tx.send(Event::WorkerDone(result));
            }),
        ));

        // Orphan sweep: runs once, before any pipeline starts, so the
        // active set cannot protect anything yet.
        pool.cleanup_all_worktrees();

        if config.dry_run {
            return Ok(self.dry_run_summary(&queue, run_started));
        }

        let settled_tx = tx.clone();
        let cleanup_pool = Arc::clone(&pool);
        let mut coordinator = MergeCoordinator::start(
            Arc::clone(&config),
            Arc::clone(&git_runner),
            MergeHooks {
                on_settled: Box::new(move |settled| {
                    let _ = settled_tx.send(Event::MergeSettled(settled));
                }),
                cleanup: Box::new(move |issue_id| cleanup_pool.cleanup_worktree(issue_id)),
            },
        )?;
        drop(tx);

        let mut report = RunReport::new();
        let interrupted = {
            let mut ctx = RunCtx {
                config: &config,
                queue: &queue,
                pool: &pool,
                coordinator: &coordinator,
                issue_index: &issue_index,
                store: &store,
                state: &mut state,
                report: &mut report,
                merges_inflight: 0,
            };
            let interrupted = run_loop(&mut ctx, &rx, &self.shutdown);

            // Shutdown cascade.
            ctx.pool.shutdown();
            if interrupted {
                ctx.report.mark_interrupted();
                info!("interrupt: terminating assistant subprocesses");
                ctx.pool.terminate_all_processes();
                ctx.coordinator.abandon_pending();
                let deadline = Instant::now() + SHUTDOWN_GRACE;
                while ctx.pool.active_count() > 0 && Instant::now() < deadline {
                    if let Ok(event) = rx.recv_timeout(Duration::from_millis(250)) {
                        handle_event(&mut ctx, event);
                    }
                }
                if ctx.pool.active_count() > 0 {
                    warn!("workers did not drain within grace period, forcing termination");
                    ctx.pool.terminate_all_processes();
                }
            }
            interrupted
        };

        pool.join();
        coordinator.close();
        // Everything still buffered on the channel settles the books.
        let mut ctx = RunCtx {
            config: &config,
            queue: &queue,
            pool: &pool,
            coordinator: &coordinator,
            issue_index: &issue_index,
            store: &store,
            state: &mut state,
            report: &mut report,
            merges_inflight: 0,
        };
        while let Ok(event) = rx.try_recv() {
            handle_event(&mut ctx, event);
        }

        let pending = collect_pending_worktrees(
            &config,
            git_runner.as_ref(),
            if interrupted { "interrupted" } else { "merge not completed" },
        );
        state.pending_worktrees = pending.clone();
        report.record_pending_worktrees(pending);

        state.last_update_time = utc_now();
        store.save(&state).context("writing final state")?;

        if interrupted {
            info!("run interrupted by user");
        }
        Ok(RunSummary {
            interrupted,
            merged: report.merged_count(),
            failed: report.failed_count(),
            report_text: report.render(run_started.elapsed()),
        })
    }

    fn dry_run_summary(&self, queue: &IssueQueue, run_started: Instant) -> RunSummary {
        let pending = queue.get_all_pending();
        println!("Dry run: {} issue(s) would be processed in this order:", pending.len());
        for issue in &pending {
            let blocked = if issue.blocked_by.is_empty() {
                String::new()
            } else {
                format!("  [blocked by {}]", issue.blocked_by.join(", "))
            };
            println!(
                "  {} {} {}{blocked}",
                issue.priority, issue.issue_id, issue.title
            );
        }
        RunSummary {
            interrupted: false,
            merged: 0,
            failed: 0,
            report_text: RunReport::new().render(run_started.elapsed()),
        }
    }
}

/// The execution loop. Returns true when it exited on the shutdown flag.
fn run_loop(ctx: &mut RunCtx<'_>, rx: &Receiver<Event>, shutdown: &AtomicBool) -> bool {
    let mut attempted_this_run = 0usize;
    let mut limit_reached = false;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        while let Ok(event) = rx.try_recv() {
            handle_event(ctx, event);
        }

        let idle = ctx.pool.active_count() == 0 && ctx.merges_inflight == 0;
        if ctx.queue.pending_count() == 0 && idle {
            return false;
        }
        if limit_reached && idle {
            info!("max_issues_per_run reached; stopping");
            return false;
        }

        if limit_reached || ctx.pool.active_count() >= ctx.config.max_workers {
            wait_event(ctx, rx, EVENT_WAIT);
            continue;
        }

        // Select the minimum admissible issue. Blocked entries are skipped
        // over and re-queued with a penalty timestamp: priority wins on the
        // unblocked set, blocked issues wait regardless of priority.
        let mut deferred: Vec<Issue> = Vec::new();
        let mut selected = None;
        while let Some(entry) = ctx.queue.get(false, None) {
            let admission = admit(&entry.issue, ctx.config, ctx.queue, ctx.state);
            if admission == Admission::Defer {
                deferred.push(entry.issue);
            } else {
                selected = Some((entry.issue, admission));
                break;
            }
        }
        let all_deferred = selected.is_none() && !deferred.is_empty();
        for issue in deferred {
            ctx.queue.requeue(issue);
        }

        let Some((issue, admission)) = selected else {
            if all_deferred && ctx.pool.active_count() == 0 && ctx.merges_inflight == 0 {
                // Nothing running can unblock them; only events already
                // buffered on the channel still could.
                let mut drained = false;
                while let Ok(event) = rx.try_recv() {
                    handle_event(ctx, event);
                    drained = true;
                }
                if drained {
                    continue;
                }
                fail_deadlocked(ctx);
                return false;
            }
            wait_event(ctx, rx, if all_deferred { DEFER_WAIT } else { EVENT_WAIT });
            continue;
        };
        let issue_id = issue.issue_id.clone();

        match admission {
            Admission::Run => {
                attempted_this_run += 1;
                ctx.state.attempted_issues.insert(issue_id.clone());
                persist(ctx);
                if ctx.config.max_issues_per_run > 0
                    && attempted_this_run >= ctx.config.max_issues_per_run
                {
                    limit_reached = true;
                }
                if is_sequential_class(&issue, ctx.config) {
                    run_sequential(ctx, rx, shutdown, issue);
                    if shutdown.load(Ordering::SeqCst) {
                        return true;
                    }
                } else if let Err(e) = ctx.pool.submit(issue) {
                    fail_issue(ctx, &issue_id, &format!("submit failed: {e:#}"));
                }
            }
            Admission::DropCompleted => {
                ctx.queue.mark_completed(&issue_id);
            }
            Admission::DropFiltered(reason) => {
                // Queue-level failure marker only: dependents must not treat
                // a filtered-out blocker as satisfied, and the durable state
                // stays untouched so a later unfiltered run can pick it up.
                ctx.queue.mark_failed(&issue_id);
                ctx.report.record_skipped(&issue_id, &reason);
            }
            Admission::FailCascade(blockers) => {
                let reason = format!("failure-cascade: blocked by failed {}", blockers.join(", "));
                fail_issue(ctx, &issue_id, &reason);
            }
            Admission::Defer => unreachable!("deferred issues are re-queued above"),
        }
    }
}

/// Sequential class: drain the pool, submit, handle this issue's completion
/// inline before admitting anything else.
fn run_sequential(
    ctx: &mut RunCtx<'_>,
    rx: &Receiver<Event>,
    shutdown: &AtomicBool,
    issue: Issue,
) {
    let issue_id = issue.issue_id.clone();
    while ctx.pool.active_count() > 0 {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        wait_event(ctx, rx, EVENT_WAIT);
    }
    if let Err(e) = ctx.pool.submit(issue) {
        fail_issue(ctx, &issue_id, &format!("submit failed: {e:#}"));
        return;
    }
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match rx.recv_timeout(EVENT_WAIT) {
            Ok(event) => {
                let done = matches!(&event, Event::WorkerDone(r) if r.issue_id == issue_id);
                handle_event(ctx, event);
                if done {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.pool.active_count() == 0 {
                    // Result already consumed or lost; nothing to wait on.
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn wait_event(ctx: &mut RunCtx<'_>, rx: &Receiver<Event>, timeout: Duration) {
    if let Ok(event) = rx.recv_timeout(timeout) {
        handle_event(ctx, event);
    }
}

/// Admission filters, applied in order, on an issue just popped.
fn admit(
    issue: &Issue,
    config: &RunConfig,
    queue: &IssueQueue,
    state: &OrchestratorState,
) -> Admission {
    let id = &issue.issue_id;
    if config.skip_ids.contains(id) {
        return Admission::DropFiltered("in skip_ids".to_string());
    }
    if !config.only_ids.is_empty() && !config.only_ids.contains(id) {
        return Admission::DropFiltered("not in only_ids".to_string());
    }
    if let Some(category) = &config.category {
        if issue.category != *category {
            return Admission::DropFiltered(format!("category is not '{category}'"));
        }
    }
    if state.completed_issues.contains(id) || queue.is_completed(id) {
        return Admission::DropCompleted;
    }
    if state.attempted_issues.contains(id) {
        return Admission::DropFiltered("already attempted".to_string());
    }
    let unmet: Vec<String> = issue
        .blocked_by
        .iter()
        .filter(|b| !queue.is_completed(b))
        .cloned()
        .collect();
    if unmet.is_empty() {
        return Admission::Run;
    }
    if unmet.iter().all(|b| queue.is_failed(b)) {
        return Admission::FailCascade(unmet);
    }
    Admission::Defer
}

fn is_sequential_class(issue: &Issue, config: &RunConfig) -> bool {
    config.p0_sequential && issue.priority == Priority::P0
}

fn handle_event(ctx: &mut RunCtx<'_>, event: Event) {
    match event {
        Event::WorkerDone(result) => on_worker_done(ctx, result),
        Event::MergeSettled(settled) => on_merge_settled(ctx, settled),
    }
}

fn on_worker_done(ctx: &mut RunCtx<'_>, result: WorkerResult) {
    let issue_id = result.issue_id.clone();
    if result.should_close || (result.success && result.work_done) {
        let issue_path = ctx
            .issue_index
            .get(&issue_id)
            .map(|i| i.path.clone())
            .unwrap_or_default();
        let request = MergeRequest {
            issue_id: issue_id.clone(),
            branch_name: result.branch_name.clone(),
            worktree_path: result.worktree_path.clone(),
            issue_path,
            result,
            status: MergeStatus::Pending,
        };
        match ctx.coordinator.submit(request) {
            Ok(()) => ctx.merges_inflight += 1,
            Err(e) => fail_issue(ctx, &issue_id, &format!("merge submit failed: {e:#}")),
        }
    } else if result.success {
        // Ran clean but changed nothing; no merge to serialize.
        ctx.queue.mark_completed(&issue_id);
        ctx.state.completed_issues.insert(issue_id.clone());
        ctx.report
            .record_no_changes(&issue_id, result.verdict.as_result_str());
        ctx.pool.cleanup_worktree(&issue_id);
    } else {
        let reason = result
            .error
            .clone()
            .unwrap_or_else(|| format!("verdict: {}", result.verdict.as_result_str()));
        ctx.queue.mark_failed(&issue_id);
        ctx.state.failed_issues.insert(issue_id.clone(), reason.clone());
        ctx.report.record_failed(&issue_id, &reason);
        ctx.pool.cleanup_worktree(&issue_id);
    }
    persist(ctx);
}

fn on_merge_settled(ctx: &mut RunCtx<'_>, settled: MergeSettled) {
    ctx.merges_inflight = ctx.merges_inflight.saturating_sub(1);
    let id = &settled.issue_id;
    match settled.status {
        MergeStatus::Merged => {
            ctx.queue.mark_completed(id);
            ctx.state.completed_issues.insert(id.clone());
            ctx.report.record_merged(id);
        }
        MergeStatus::ClosedNoMerge => {
            ctx.queue.mark_completed(id);
            ctx.state.completed_issues.insert(id.clone());
            ctx.report.record_closed(id);
        }
        MergeStatus::Conflict => {
            fail_issue(ctx, id, "merge conflict");
        }
        MergeStatus::Failed => {
            let reason = settled
                .message
                .clone()
                .unwrap_or_else(|| "merge failed".to_string());
            fail_issue(ctx, id, &reason);
        }
        MergeStatus::Pending | MergeStatus::InProgress => {}
    }
    persist(ctx);
}

fn fail_issue(ctx: &mut RunCtx<'_>, issue_id: &str, reason: &str) {
    ctx.queue.mark_failed(issue_id);
    ctx.state
        .failed_issues
        .insert(issue_id.to_string(), reason.to_string());
    ctx.report.record_failed(issue_id, reason);
    persist(ctx);
}

/// All remaining pending issues wait on blockers that can never complete.
fn fail_deadlocked(ctx: &mut RunCtx<'_>) {
    while let Some(entry) = ctx.queue.get(false, None) {
        let id = entry.issue.issue_id;
        let reason = format!(
            "unresolvable dependencies: {}",
            entry.issue.blocked_by.join(", ")
        );
        warn!("{id}: {reason}");
        fail_issue(ctx, &id, &reason);
    }
}

fn persist(ctx: &mut RunCtx<'_>) {
    ctx.state.last_update_time = utc_now();
    if let Err(e) = ctx.store.save(ctx.state) {
        warn!("state snapshot failed: {e:#}");
    }
}

/// Add the worktree base to the repository's ignore file if missing.
/// Idempotent.
pub fn ensure_gitignore_entry(repo_root: &Path, worktree_base_dir: &str) -> Result<()> {
    let path = repo_root.join(".gitignore");
    let entry = format!("{}/", worktree_base_dir.trim_end_matches('/'));
    let mut content = fs::read_to_string(&path).unwrap_or_default();
    let present = content.lines().any(|line| {
        let line = line.trim();
        line == entry || line == entry.trim_end_matches('/')
    });
    if present {
        return Ok(());
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&entry);
    content.push('\n');
    fs::write(&path, content).context("updating .gitignore")?;
    Ok(())
}

/// Inspect surviving `worker-*` directories for unmerged work.
fn collect_pending_worktrees(
    config: &RunConfig,
    git: &dyn GitRunner,
    reason: &str,
) -> Vec<PendingWorktreeInfo> {
    let mut infos = Vec::new();
    let entries = match fs::read_dir(config.worktree_base()) {
        Ok(entries) => entries,
        Err(_) => return infos,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(issue_id) = RunConfig::issue_id_from_worktree(&name) else {
            continue;
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let range = format!("{}..HEAD", config.main_branch);
        let commits_ahead = git
            .run_git(
                "rev-list-count",
                &["rev-list", "--count", &range],
                &path,
                GIT_OP_TIMEOUT,
                false,
            )
            .ok()
            .filter(|out| out.success())
            .and_then(|out| out.stdout_trimmed().parse::<u64>().ok())
            .unwrap_or(0);
        let has_uncommitted_changes = git
            .run_git(
                "status",
                &["status", "--porcelain"],
                &path,
                GIT_OP_TIMEOUT,
                false,
            )
            .map(|out| !out.stdout.trim().is_empty())
            .unwrap_or(false);
        let info = PendingWorktreeInfo {
            issue_id: issue_id.to_string(),
            branch_name: config.branch_for(issue_id),
            path,
            commits_ahead,
            has_uncommitted_changes,
            reason: reason.to_string(),
        };
        if info.has_pending_work() {
            infos.push(info);
        }
    }
    infos.sort_by(|a, b| a.issue_id.cmp(&b.issue_id));
    infos
}
