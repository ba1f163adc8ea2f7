//! Worker pool: runs issue pipelines in parallel, owns the worktree
//! lifecycle, and contains leaks into the main working tree.
//!
//! Per-issue pipeline: worktree setup → readiness probe → execute (with
//! continuation handoffs) → change detection → leak containment → result.
//! The pipeline boundary is an error firewall: everything thrown inside is
//! turned into a failed `WorkerResult`, never an escaped panic or error.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::RunConfig;
use crate::git::parse_porcelain_paths;
use crate::issue::Issue;
use crate::ports::{AssistantRunner, GitRunner, ProcessHooks};
use crate::state::WorkerResult;
use crate::supervisor::{terminate_pid, SubprocessTimeout};
use crate::verdict::{detect_handoff, parse_verdict, Verdict, CONTINUE_PROMPT_FILE};

/// Ceiling for any single git invocation issued by the pool.
const GIT_OP_TIMEOUT: Duration = Duration::from_secs(120);
const TERM_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);

type OnComplete = Box<dyn Fn(WorkerResult) + Send + Sync>;

struct PoolInner {
    config: Arc<RunConfig>,
    git: Arc<dyn GitRunner>,
    assistant: Arc<dyn AssistantRunner>,
    /// Worktree paths currently owned by a running pipeline. No cleanup
    /// routine may remove a member of this set.
    active_worktrees: Mutex<HashSet<PathBuf>>,
    /// Live assistant PIDs by issue, registered via the supervisor's
    /// start hook; targeted on shutdown.
    active_processes: Mutex<HashMap<String, u32>>,
    /// In-flight pipelines, including ones whose completion callback has
    /// not finished yet.
    active: AtomicUsize,
    accepting: AtomicBool,
    on_complete: OnComplete,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    leak_cleanups: AtomicU64,
    protected_skips: AtomicU64,
}

impl PoolInner {
    fn register_worktree(&self, path: &Path) {
        self.active_worktrees
            .lock()
            .unwrap()
            .insert(path.to_path_buf());
    }

    fn deregister_worktree(&self, path: &Path) {
        self.active_worktrees.lock().unwrap().remove(path);
    }

    fn is_worktree_active(&self, path: &Path) -> bool {
        self.active_worktrees.lock().unwrap().contains(path)
    }
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<RunConfig>,
        git: Arc<dyn GitRunner>,
        assistant: Arc<dyn AssistantRunner>,
        on_complete: OnComplete,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                git,
                assistant,
                active_worktrees: Mutex::new(HashSet::new()),
                active_processes: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                on_complete,
                handles: Mutex::new(Vec::new()),
                leak_cleanups: AtomicU64::new(0),
                protected_skips: AtomicU64::new(0),
            }),
        }
    }

    /// Start a pipeline for `issue` on its own thread. Errors after
    /// `shutdown`. Admission bounds concurrency, so the pool itself does not
    /// queue.
    pub fn submit(&self, issue: Issue) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            bail!("worker pool is shut down");
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let spawn = thread::Builder::new()
            .name(format!("worker-{}", issue.issue_id))
            .spawn(move || {
                let started = Instant::now();
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| process_issue(&inner, &issue)));
                let mut result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        // The pipeline panicked; release its worktree claim
                        // and synthesize a failure.
                        let wt = inner.config.worktree_for(&issue.issue_id);
                        inner.deregister_worktree(&wt);
                        failed_result(&inner.config, &issue, "internal error: worker panicked")
                    }
                };
                result.duration = started.elapsed().as_secs_f64();
                (inner.on_complete)(result);
                inner.active.fetch_sub(1, Ordering::SeqCst);
            });
        match spawn {
            Ok(handle) => {
                self.inner.handles.lock().unwrap().push(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                Err(e).context("spawning worker thread")
            }
        }
    }

    /// In-flight pipelines, completion callbacks included.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Refuse new submissions. Running pipelines are unaffected.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Join every pipeline thread started so far.
    pub fn join(&self) {
        let handles: Vec<_> = self.inner.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// SIGTERM then SIGKILL every tracked assistant subprocess.
    pub fn terminate_all_processes(&self) {
        let entries: Vec<(String, u32)> = self
            .inner
            .active_processes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();
        for (issue_id, pid) in entries {
            info!("terminating assistant for {issue_id} (pid {pid})");
            terminate_pid(pid, TERM_WAIT, KILL_WAIT);
        }
        self.inner.active_processes.lock().unwrap().clear();
    }

    pub fn is_worktree_active(&self, path: &Path) -> bool {
        self.inner.is_worktree_active(path)
    }

    pub fn active_worktrees(&self) -> Vec<PathBuf> {
        self.inner
            .active_worktrees
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }

    /// Leaked paths cleaned out of the main working tree so far.
    pub fn leak_cleanup_count(&self) -> u64 {
        self.inner.leak_cleanups.load(Ordering::SeqCst)
    }

    /// Cleanup attempts skipped because the worktree was active.
    pub fn protected_skip_count(&self) -> u64 {
        self.inner.protected_skips.load(Ordering::SeqCst)
    }

    /// Remove one issue's worktree and branch, unless a running pipeline
    /// still owns the path.
    pub fn cleanup_worktree(&self, issue_id: &str) {
        cleanup_worktree_inner(&self.inner, issue_id);
    }

    /// Sweep every `worker-*` directory under the worktree base, skipping
    /// members of the active set.
    pub fn cleanup_all_worktrees(&self) {
        let base = self.inner.config.worktree_base();
        let entries = match fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(issue_id) = RunConfig::issue_id_from_worktree(&name) {
                cleanup_worktree_inner(&self.inner, issue_id);
            }
        }
    }
}

fn cleanup_worktree_inner(inner: &PoolInner, issue_id: &str) {
    let cfg = &inner.config;
    let wt = cfg.worktree_for(issue_id);
    if inner.is_worktree_active(&wt) {
        warn!(
            "refusing to clean up active worktree {} for {issue_id}",
            wt.display()
        );
        inner.protected_skips.fetch_add(1, Ordering::SeqCst);
        return;
    }
    let wt_s = wt.display().to_string();
    let _ = inner.git.run_git(
        "worktree-remove",
        &["worktree", "remove", "--force", &wt_s],
        &cfg.repo_root,
        GIT_OP_TIMEOUT,
        false,
    );
    if wt.exists() {
        if let Err(e) = fs::remove_dir_all(&wt) {
            warn!("could not remove worktree dir {}: {e}", wt.display());
        }
    }
    let branch = cfg.branch_for(issue_id);
    let _ = inner.git.run_git(
        "branch-delete",
        &["branch", "-D", &branch],
        &cfg.repo_root,
        GIT_OP_TIMEOUT,
        false,
    );
    debug!("cleaned up worktree {} and branch {branch}", wt.display());
}

fn failed_result(config: &RunConfig, issue: &Issue, error: &str) -> WorkerResult {
    WorkerResult {
        issue_id: issue.issue_id.clone(),
        branch_name: config.branch_for(&issue.issue_id),
        worktree_path: config.worktree_for(&issue.issue_id),
        success: false,
        verdict: Verdict::Unknown,
        duration: 0.0,
        work_done: false,
        should_close: false,
        error: Some(error.to_string()),
        changed_files: vec![],
    }
}

/// Pipeline entry point and error firewall. Always returns a result;
/// leak containment runs on every path once the baseline was captured.
fn process_issue(inner: &PoolInner, issue: &Issue) -> WorkerResult {
    let wt = inner.config.worktree_for(&issue.issue_id);
    let baseline = match main_status_paths(inner) {
        Ok(paths) => Some(paths),
        Err(e) => {
            warn!("could not baseline main repo status: {e:#}");
            None
        }
    };

    let outcome = run_pipeline(inner, issue, &wt);

    if let Some(baseline) = &baseline {
        contain_leaks(inner, baseline);
    }
    inner.deregister_worktree(&wt);

    match outcome {
        Ok(result) => result,
        Err(e) => {
            let message = if e.downcast_ref::<SubprocessTimeout>().is_some()
                || e.to_string() == "timeout"
            {
                "timeout".to_string()
            } else {
                format!("{e:#}")
            };
            warn!("pipeline for {} failed: {message}", issue.issue_id);
            failed_result(&inner.config, issue, &message)
        }
    }
}

fn run_pipeline(inner: &PoolInner, issue: &Issue, wt: &Path) -> Result<WorkerResult> {
    let cfg = &inner.config;
    let started = Instant::now();
    let branch = cfg.branch_for(&issue.issue_id);

    setup_worktree(inner, &branch, wt)?;

    let mut result = WorkerResult {
        issue_id: issue.issue_id.clone(),
        branch_name: branch,
        worktree_path: wt.to_path_buf(),
        success: false,
        verdict: Verdict::Unknown,
        duration: 0.0,
        work_done: false,
        should_close: false,
        error: None,
        changed_files: vec![],
    };

    // Readiness probe.
    let probe = {
        let hooks = process_hooks(inner, &issue.issue_id);
        inner.assistant.probe(
            issue,
            wt,
            remaining_budget(cfg, started)?,
            ProcessHooks {
                on_start: &hooks.0,
                on_end: &hooks.1,
            },
        )?
    };
    let verdict = parse_verdict(&probe.stdout);
    result.verdict = verdict;
    debug!("{}: probe verdict {verdict}", issue.issue_id);

    match verdict {
        Verdict::NotReady | Verdict::Unknown => {
            // Not a system failure, but nothing to run or merge.
            return Ok(result);
        }
        Verdict::Close => {
            result.should_close = true;
            result.success = true;
            return Ok(result);
        }
        Verdict::Ready | Verdict::Corrected => {}
    }

    // Execute, honoring continuation handoffs up to the configured bound.
    let mut resume = false;
    let mut continuations = 0u32;
    loop {
        let output = {
            let hooks = process_hooks(inner, &issue.issue_id);
            inner.assistant.manage(
                issue,
                wt,
                resume,
                remaining_budget(cfg, started)?,
                ProcessHooks {
                    on_start: &hooks.0,
                    on_end: &hooks.1,
                },
            )?
        };
        if output.exit_code != 0 {
            bail!("assistant exited with status {}", output.exit_code);
        }
        let continue_file = wt.join(CONTINUE_PROMPT_FILE);
        if detect_handoff(&output.stdout) && continue_file.exists() {
            if continuations >= cfg.max_continuations {
                warn!(
                    "{}: handoff after {continuations} continuation(s), giving up on more",
                    issue.issue_id
                );
                break;
            }
            continuations += 1;
            let _ = fs::remove_file(&continue_file);
            info!(
                "{}: continuation handoff, re-invoking with resume ({continuations}/{})",
                issue.issue_id, cfg.max_continuations
            );
            resume = true;
            continue;
        }
        break;
    }

    result.changed_files = detect_changes(inner, wt)?;
    result.work_done = !result.changed_files.is_empty();
    result.success = true;
    Ok(result)
}

/// Remaining share of the issue envelope; expired → the pipeline fails with
/// the canonical "timeout" error.
fn remaining_budget(cfg: &RunConfig, started: Instant) -> Result<Duration> {
    let elapsed = started.elapsed();
    if elapsed >= cfg.timeout_per_issue {
        bail!("timeout");
    }
    Ok(cfg.timeout_per_issue - elapsed)
}

/// Per-invocation subprocess hooks: register the PID for global shutdown on
/// start, drop it when the process ends.
fn process_hooks<'a>(
    inner: &'a PoolInner,
    issue_id: &str,
) -> (impl Fn(u32) + Sync + 'a, impl Fn() + Sync + 'a) {
    let id_start = issue_id.to_string();
    let id_end = issue_id.to_string();
    (
        move |pid: u32| {
            inner
                .active_processes
                .lock()
                .unwrap()
                .insert(id_start.clone(), pid);
        },
        move || {
            inner.active_processes.lock().unwrap().remove(&id_end);
        },
    )
}

fn setup_worktree(inner: &PoolInner, branch: &str, wt: &Path) -> Result<()> {
    let cfg = &inner.config;
    let root = &cfg.repo_root;
    fs::create_dir_all(cfg.worktree_base())?;
    let wt_s = wt.display().to_string();

    if wt.exists() {
        if is_registered_worktree(inner, wt)? {
            let _ = inner.git.run_git(
                "worktree-remove",
                &["worktree", "remove", "--force", &wt_s],
                root,
                GIT_OP_TIMEOUT,
                false,
            );
        }
        if wt.exists() {
            fs::remove_dir_all(wt)
                .with_context(|| format!("removing stale worktree dir {}", wt.display()))?;
        }
    }

    // Force-delete any branch left over from a prior run.
    let _ = inner.git.run_git(
        "branch-delete",
        &["branch", "-D", branch],
        root,
        GIT_OP_TIMEOUT,
        false,
    );

    inner.git.run_git(
        "worktree-add",
        &["worktree", "add", "-b", branch, &wt_s, &cfg.main_branch],
        root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    inner.register_worktree(wt);
    Ok(())
}

fn is_registered_worktree(inner: &PoolInner, wt: &Path) -> Result<bool> {
    let out = inner.git.run_git(
        "worktree-list",
        &["worktree", "list"],
        &inner.config.repo_root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    let target = fs::canonicalize(wt).unwrap_or_else(|_| wt.to_path_buf());
    Ok(out.stdout.lines().any(|line| {
        line.split_whitespace()
            .next()
            .map(|p| {
                let listed = Path::new(p);
                fs::canonicalize(listed).unwrap_or_else(|_| listed.to_path_buf()) == target
            })
            .unwrap_or(false)
    }))
}

/// Status snapshot of the main working tree, ignored files included so
/// gitignored leaks are observable in the before/after diff.
fn main_status_paths(inner: &PoolInner) -> Result<BTreeSet<String>> {
    let out = inner.git.run_git(
        "status",
        &["status", "--porcelain", "--ignored"],
        &inner.config.repo_root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    Ok(parse_porcelain_paths(&out.stdout))
}

/// Files changed in the worktree versus the main branch, committed and
/// uncommitted, with housekeeping paths excluded.
fn detect_changes(inner: &PoolInner, wt: &Path) -> Result<Vec<PathBuf>> {
    let cfg = &inner.config;
    let range = format!("{}..HEAD", cfg.main_branch);
    let diff = inner.git.run_git(
        "diff-names",
        &["diff", "--name-only", &range],
        wt,
        GIT_OP_TIMEOUT,
        true,
    )?;
    let status = inner.git.run_git(
        "status",
        &["status", "--porcelain"],
        wt,
        GIT_OP_TIMEOUT,
        true,
    )?;

    let mut paths: BTreeSet<String> = diff
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    paths.extend(parse_porcelain_paths(&status.stdout));

    let completed_prefix = &cfg.completed_dir;
    Ok(paths
        .into_iter()
        .filter(|p| !p.starts_with(completed_prefix.as_str()))
        .filter(|p| !p.starts_with(".claude"))
        .map(PathBuf::from)
        .collect())
}

/// Remove every path that appeared in the main working tree since the
/// baseline. Leaked files are never merged; failures here are logged, not
/// fatal to the pipeline.
fn contain_leaks(inner: &PoolInner, baseline: &BTreeSet<String>) {
    let after = match main_status_paths(inner) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("leak scan failed: {e:#}");
            return;
        }
    };
    for path in after.difference(baseline) {
        if is_housekeeping_path(&inner.config, path) {
            continue;
        }
        if let Err(e) = clean_leak(inner, path) {
            warn!("failed to clean leaked path {path}: {e:#}");
        }
    }
}

/// Paths the orchestrator itself produces in the main tree; never leaks.
fn is_housekeeping_path(cfg: &RunConfig, rel: &str) -> bool {
    let trimmed = rel.trim_end_matches('/');
    trimmed == cfg.worktree_base_dir
        || rel.starts_with(&format!("{}/", cfg.worktree_base_dir))
        || trimmed == ".claude"
        || rel.starts_with(".claude/")
        || trimmed == ".gitignore"
}

fn clean_leak(inner: &PoolInner, rel: &str) -> Result<()> {
    let cfg = &inner.config;
    let out = inner.git.run_git(
        "status-path",
        &["status", "--porcelain", "--", rel],
        &cfg.repo_root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    let abs = cfg.repo_root.join(rel);
    if out.stdout.trim().is_empty() {
        // Gitignored: the path-scoped porcelain has nothing to say, so git
        // cannot restore or remove it; fall back to the filesystem.
        remove_path(&abs)?;
        warn!("removed gitignored leak {rel} from main working tree");
    } else if out.stdout.starts_with("??") || out.stdout.starts_with("!!") {
        remove_path(&abs)?;
        warn!("removed untracked leak {rel} from main working tree");
    } else {
        inner.git.run_git(
            "checkout-path",
            &["checkout", "--", rel],
            &cfg.repo_root,
            GIT_OP_TIMEOUT,
            true,
        )?;
        warn!("restored tracked leak {rel} in main working tree");
    }
    inner.leak_cleanups.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitLock;
    use crate::issue::{IssueType, Priority};
    use crate::ports::AssistantOutput;
    use std::process::{Command, Stdio};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn sh_git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        sh_git(dir.path(), &["init", "-b", "main"]);
        sh_git(dir.path(), &["config", "user.name", "drover-test"]);
        sh_git(dir.path(), &["config", "user.email", "drover@localhost"]);
        fs::create_dir_all(dir.path().join("issues")).unwrap();
        fs::write(dir.path().join("issues/BUG-1.md"), "Fix it\n").unwrap();
        fs::write(dir.path().join(".gitignore"), ".worktrees/\nscratch/\n").unwrap();
        sh_git(dir.path(), &["add", "."]);
        sh_git(dir.path(), &["commit", "-m", "init"]);
        dir
    }

    fn issue(id: &str) -> Issue {
        Issue {
            issue_id: id.to_string(),
            priority: Priority::P2,
            issue_type: IssueType::from_id(id),
            category: String::new(),
            path: PathBuf::from(format!("issues/{id}.md")),
            title: format!("Issue {id}"),
            blocked_by: vec![],
        }
    }

    /// Scripted assistant driving the pipeline without a real CLI.
    #[derive(Default)]
    struct MockAssistant {
        probe_stdout: String,
        /// File (relative to the worktree) to create and commit during manage.
        commit_file: Option<String>,
        /// Absolute path to write outside the worktree, a deliberate leak.
        leak_path: Option<PathBuf>,
        /// Print a handoff marker (and drop the continue file) on the first
        /// manage call only.
        handoff_first: bool,
        manage_exit_code: i32,
        manage_calls: Arc<AtomicUsize>,
        resume_calls: Arc<AtomicUsize>,
        panic_in_manage: bool,
    }

    impl AssistantRunner for MockAssistant {
        fn probe(
            &self,
            _issue: &Issue,
            _worktree: &Path,
            _budget: Duration,
            _hooks: ProcessHooks<'_>,
        ) -> Result<AssistantOutput> {
            Ok(AssistantOutput {
                exit_code: 0,
                stdout: self.probe_stdout.clone(),
            })
        }

        fn manage(
            &self,
            _issue: &Issue,
            worktree: &Path,
            resume: bool,
            _budget: Duration,
            _hooks: ProcessHooks<'_>,
        ) -> Result<AssistantOutput> {
            if self.panic_in_manage {
                panic!("scripted panic");
            }
            let call = self.manage_calls.fetch_add(1, Ordering::SeqCst);
            if resume {
                self.resume_calls.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(leak) = &self.leak_path {
                fs::write(leak, "leaked\n").unwrap();
            }
            if self.handoff_first && call == 0 {
                let cf = worktree.join(CONTINUE_PROMPT_FILE);
                fs::create_dir_all(cf.parent().unwrap()).unwrap();
                fs::write(&cf, "continue from step 3\n").unwrap();
                return Ok(AssistantOutput {
                    exit_code: 0,
                    stdout: "partial progress\nHANDOFF: out of context\n".to_string(),
                });
            }
            if let Some(file) = &self.commit_file {
                fs::write(worktree.join(file), "change\n").unwrap();
                sh_git(worktree, &["add", "."]);
                sh_git(worktree, &["commit", "-m", "work"]);
            }
            Ok(AssistantOutput {
                exit_code: self.manage_exit_code,
                stdout: "done\n".to_string(),
            })
        }
    }

    fn ready_assistant() -> MockAssistant {
        MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            commit_file: Some("src_change.txt".to_string()),
            ..MockAssistant::default()
        }
    }

    fn make_pool(
        root: &Path,
        assistant: MockAssistant,
    ) -> (WorkerPool, mpsc::Receiver<WorkerResult>) {
        let mut config = RunConfig::default();
        config.repo_root = root.to_path_buf();
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(
            Arc::new(config),
            Arc::new(GitLock::new()),
            Arc::new(assistant),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        (pool, rx)
    }

    fn run_one(pool: &WorkerPool, rx: &mpsc::Receiver<WorkerResult>, id: &str) -> WorkerResult {
        pool.submit(issue(id)).unwrap();
        let result = rx.recv_timeout(Duration::from_secs(60)).unwrap();
        pool.join();
        result
    }

    // ── Pipeline outcomes ────────────────────────────────────────────────────

    #[test]
    fn ready_issue_produces_committed_changes() {
        let repo = init_repo();
        let (pool, rx) = make_pool(repo.path(), ready_assistant());
        let result = run_one(&pool, &rx, "BUG-1");

        assert!(result.success);
        assert!(result.work_done);
        assert!(!result.should_close);
        assert_eq!(result.verdict, Verdict::Ready);
        assert!(result
            .changed_files
            .contains(&PathBuf::from("src_change.txt")));
        // Worktree left in place for the merge coordinator.
        assert!(result.worktree_path.exists());
        // Active set must be empty once the pipeline returned.
        assert!(pool.active_worktrees().is_empty());
    }

    #[test]
    fn not_ready_short_circuits_without_work() {
        let repo = init_repo();
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: NOT_READY\n".to_string(),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(!result.success);
        assert!(!result.work_done);
        assert_eq!(result.verdict, Verdict::NotReady);
        assert!(result.error.is_none());
    }

    #[test]
    fn unknown_verdict_treated_as_not_ready() {
        let repo = init_repo();
        let assistant = MockAssistant {
            probe_stdout: "no verdict here\n".to_string(),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(!result.success);
        assert_eq!(result.verdict, Verdict::Unknown);
    }

    #[test]
    fn close_verdict_sets_should_close() {
        let repo = init_repo();
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: CLOSE\n".to_string(),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(result.success);
        assert!(result.should_close);
        assert!(!result.work_done);
    }

    #[test]
    fn assistant_crash_becomes_failed_result() {
        let repo = init_repo();
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            manage_exit_code: 2,
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("assistant exited with status 2"));
    }

    #[test]
    fn panic_in_pipeline_is_contained() {
        let repo = init_repo();
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            panic_in_manage: true,
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("panicked"));
        assert!(pool.active_worktrees().is_empty());
        assert_eq!(pool.active_count(), 0);
    }

    // ── Continuation handoff ─────────────────────────────────────────────────

    #[test]
    fn handoff_triggers_resume_invocation() {
        let repo = init_repo();
        let manage_calls = Arc::new(AtomicUsize::new(0));
        let resume_calls = Arc::new(AtomicUsize::new(0));
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            commit_file: Some("late_change.txt".to_string()),
            handoff_first: true,
            manage_calls: Arc::clone(&manage_calls),
            resume_calls: Arc::clone(&resume_calls),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");

        assert!(result.success);
        assert!(result.work_done);
        assert_eq!(manage_calls.load(Ordering::SeqCst), 2);
        assert_eq!(resume_calls.load(Ordering::SeqCst), 1);
        assert!(result
            .changed_files
            .contains(&PathBuf::from("late_change.txt")));
        // Continue file was consumed.
        assert!(!result.worktree_path.join(CONTINUE_PROMPT_FILE).exists());
    }

    // ── Leak containment ─────────────────────────────────────────────────────

    #[test]
    fn gitignored_leak_is_deleted_from_main_tree() {
        let repo = init_repo();
        fs::create_dir_all(repo.path().join("scratch")).unwrap();
        // scratch/ is ignored; a leak inside it is invisible to path-scoped
        // porcelain and must fall back to filesystem deletion.
        let leak = repo.path().join("scratch/leaked.md");
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            leak_path: Some(leak.clone()),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");

        assert!(result.success);
        assert!(!result.work_done, "leak must not count as work");
        assert!(!leak.exists(), "gitignored leak should be deleted");
        assert!(pool.leak_cleanup_count() >= 1);
    }

    #[test]
    fn untracked_leak_is_deleted_from_main_tree() {
        let repo = init_repo();
        let leak = repo.path().join("stray-note.md");
        let assistant = MockAssistant {
            probe_stdout: "VERDICT: READY\n".to_string(),
            leak_path: Some(leak.clone()),
            ..MockAssistant::default()
        };
        let (pool, rx) = make_pool(repo.path(), assistant);
        let result = run_one(&pool, &rx, "BUG-1");

        assert!(result.success);
        assert!(!leak.exists(), "untracked leak should be deleted");
        assert!(pool.leak_cleanup_count() >= 1);
    }

    #[test]
    fn preexisting_dirt_is_not_treated_as_leak() {
        let repo = init_repo();
        let existing = repo.path().join("operator-notes.md");
        fs::write(&existing, "mine\n").unwrap();
        let (pool, rx) = make_pool(repo.path(), ready_assistant());
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(result.success);
        assert!(existing.exists(), "baseline files must survive");
    }

    // ── Active-worktree protection ───────────────────────────────────────────

    #[test]
    fn cleanup_skips_active_worktree() {
        let repo = init_repo();
        let (pool, _rx) = make_pool(repo.path(), MockAssistant::default());
        let wt = pool.inner.config.worktree_for("BUG-1");
        fs::create_dir_all(&wt).unwrap();
        pool.inner.register_worktree(&wt);

        pool.cleanup_all_worktrees();
        assert!(wt.exists(), "active worktree must not be removed");
        assert!(pool.protected_skip_count() >= 1);

        pool.inner.deregister_worktree(&wt);
        pool.cleanup_all_worktrees();
        assert!(!wt.exists(), "inactive worktree is swept");
    }

    #[test]
    fn cleanup_worktree_removes_branch_and_dir() {
        let repo = init_repo();
        let (pool, rx) = make_pool(repo.path(), ready_assistant());
        let result = run_one(&pool, &rx, "BUG-1");
        assert!(result.worktree_path.exists());

        pool.cleanup_worktree("BUG-1");
        assert!(!result.worktree_path.exists());
        let out = Command::new("git")
            .args(["branch", "--list", &result.branch_name])
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    }

    // ── Submission lifecycle ─────────────────────────────────────────────────

    #[test]
    fn submit_after_shutdown_errors() {
        let repo = init_repo();
        let (pool, _rx) = make_pool(repo.path(), MockAssistant::default());
        pool.shutdown();
        let err = pool.submit(issue("BUG-1")).unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn stale_branch_and_dir_from_prior_run_are_replaced() {
        let repo = init_repo();
        let (pool, rx) = make_pool(repo.path(), ready_assistant());

        // Simulate a prior crashed run: branch exists, unregistered dir
        // squats on the worktree path.
        sh_git(repo.path(), &["branch", "parallel/BUG-1"]);
        let wt = pool.inner.config.worktree_for("BUG-1");
        fs::create_dir_all(&wt).unwrap();
        fs::write(wt.join("junk.txt"), "old\n").unwrap();

        let result = run_one(&pool, &rx, "BUG-1");
        assert!(result.success, "error: {:?}", result.error);
        assert!(!result.worktree_path.join("junk.txt").exists());
    }
}
