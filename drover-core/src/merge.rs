//! Merge coordinator: the single writer for the main branch.
//!
//! One consumer thread drains a FIFO request channel; the arrival order is
//! the total order of main-branch mutations. Only pull and push retry, and
//! only on transient errors; conflicts are terminal and leave the worktree
//! in place for the operator. The request boundary is an error firewall.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::{MergeStrategy, RunConfig};
use crate::git::{
    is_divergence_error, is_missing_remote_error, is_transient_git_error, parse_porcelain_paths,
    GitOutput, GitTimeout,
};
use crate::ports::GitRunner;
use crate::state::{MergeRequest, MergeStatus};

const GIT_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Terminal notification for one request.
#[derive(Debug, Clone)]
pub struct MergeSettled {
    pub issue_id: String,
    pub status: MergeStatus,
    pub message: Option<String>,
}

/// Callbacks wired at construction time; the coordinator holds no
/// back-pointers into the orchestrator or pool.
pub struct MergeHooks {
    /// Fired once per request when it reaches a terminal status.
    pub on_settled: Box<dyn Fn(MergeSettled) + Send>,
    /// Worktree + branch removal, routed through the pool so the
    /// active-worktree protection applies. Receives the issue ID.
    pub cleanup: Box<dyn Fn(&str) + Send>,
}

pub struct MergeCoordinator {
    tx: Option<Sender<MergeRequest>>,
    handle: Option<thread::JoinHandle<()>>,
    abandoned: Arc<AtomicBool>,
}

impl MergeCoordinator {
    /// Spawn the consumer thread.
    pub fn start(
        config: Arc<RunConfig>,
        git: Arc<dyn GitRunner>,
        hooks: MergeHooks,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<MergeRequest>();
        let abandoned = Arc::new(AtomicBool::new(false));
        let abandoned2 = Arc::clone(&abandoned);
        let handle = thread::Builder::new()
            .name("merge-coordinator".to_string())
            .spawn(move || consumer_loop(&config, git.as_ref(), &hooks, &rx, &abandoned2))
            .context("spawning merge coordinator thread")?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            abandoned,
        })
    }

    /// Shutdown cascade: the in-progress request finishes, everything still
    /// queued settles as failed without touching git.
    pub fn abandon_pending(&self) {
        self.abandoned.store(true, AtomicOrdering::SeqCst);
    }

    /// Enqueue a request. FIFO: earlier submissions merge first.
    pub fn submit(&self, request: MergeRequest) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(request)
                .map_err(|_| anyhow::anyhow!("merge coordinator is closed")),
            None => bail!("merge coordinator is closed"),
        }
    }

    /// Let the in-progress request finish, drop anything still pending, and
    /// join the consumer thread.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MergeCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

fn consumer_loop(
    config: &RunConfig,
    git: &dyn GitRunner,
    hooks: &MergeHooks,
    rx: &Receiver<MergeRequest>,
    abandoned: &AtomicBool,
) {
    while let Ok(mut request) = rx.recv() {
        let issue_id = request.issue_id.clone();
        if abandoned.load(AtomicOrdering::SeqCst) {
            (hooks.on_settled)(MergeSettled {
                issue_id,
                status: MergeStatus::Failed,
                message: Some("merge dropped at shutdown".to_string()),
            });
            continue;
        }
        request.status = MergeStatus::InProgress;
        debug!("merge coordinator: processing {issue_id}");
        let (status, message) = process_request(config, git, &request);
        if status.is_success() {
            (hooks.cleanup)(&issue_id);
        } else {
            warn!(
                "merge of {issue_id} ended {}; worktree {} preserved",
                status.as_str(),
                request.worktree_path.display()
            );
        }
        (hooks.on_settled)(MergeSettled {
            issue_id,
            status,
            message,
        });
    }
}

/// Error firewall around one request.
fn process_request(
    config: &RunConfig,
    git: &dyn GitRunner,
    request: &MergeRequest,
) -> (MergeStatus, Option<String>) {
    let outcome = if request.result.should_close {
        close_request(config, git, request)
    } else {
        merge_request(config, git, request)
    };
    match outcome {
        Ok(status) => (status, None),
        Err(e) => {
            warn!("merge request for {} failed: {e:#}", request.issue_id);
            (MergeStatus::Failed, Some(format!("{e:#}")))
        }
    }
}

fn merge_request(
    config: &RunConfig,
    git: &dyn GitRunner,
    request: &MergeRequest,
) -> Result<MergeStatus> {
    let root = &config.repo_root;

    // Best-effort: offline runs proceed against the local main branch.
    let _ = git.run_git("fetch", &["fetch", "origin"], root, GIT_OP_TIMEOUT, false);

    git.run_git(
        "checkout",
        &["checkout", &config.main_branch],
        root,
        GIT_OP_TIMEOUT,
        true,
    )?;

    commit_request_files(config, git, request)?;
    pull_main(config, git)?;

    let (op, args): (&str, Vec<&str>) = match config.merge_strategy {
        MergeStrategy::Merge => ("merge", vec!["merge", &request.branch_name]),
        MergeStrategy::Rebase => ("rebase", vec!["rebase", &request.branch_name]),
    };
    let out = git.run_git(op, &args, root, GIT_OP_TIMEOUT, false)?;
    if !out.success() {
        if is_conflict_output(&out) {
            let abort: Vec<&str> = match config.merge_strategy {
                MergeStrategy::Merge => vec!["merge", "--abort"],
                MergeStrategy::Rebase => vec!["rebase", "--abort"],
            };
            let _ = git.run_git("merge-abort", &abort, root, GIT_OP_TIMEOUT, false);
            return Ok(MergeStatus::Conflict);
        }
        bail!("git {op} {} failed: {}", request.branch_name, out.stderr.trim());
    }

    push_main(config, git)?;
    info!("merged {} into {}", request.branch_name, config.main_branch);
    Ok(MergeStatus::Merged)
}

/// Close path: no merge. Move the issue file into the completed directory on
/// the main branch, commit, push. Same serialized single-writer path.
fn close_request(
    config: &RunConfig,
    git: &dyn GitRunner,
    request: &MergeRequest,
) -> Result<MergeStatus> {
    let root = &config.repo_root;

    git.run_git(
        "checkout",
        &["checkout", &config.main_branch],
        root,
        GIT_OP_TIMEOUT,
        true,
    )?;

    let src_rel = request.issue_path.display().to_string();
    let file_name = request
        .issue_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.md", request.issue_id));
    let dst_rel = format!("{}/{}", config.completed_dir, file_name);

    if root.join(&request.issue_path).exists() {
        fs::create_dir_all(root.join(&config.completed_dir))?;
        let mv = git.run_git(
            "mv",
            &["mv", &src_rel, &dst_rel],
            root,
            GIT_OP_TIMEOUT,
            false,
        )?;
        if !mv.success() {
            // Untracked issue file: plain rename, then stage the destination.
            fs::rename(root.join(&src_rel), root.join(&dst_rel))?;
            git.run_git(
                "add",
                &["add", "--", &dst_rel],
                root,
                GIT_OP_TIMEOUT,
                true,
            )?;
        }
        let message = format!("chore: close {} without code changes", request.issue_id);
        let commit = git.run_git(
            "commit",
            &["commit", "-m", &message],
            root,
            GIT_OP_TIMEOUT,
            false,
        )?;
        if !commit.success() {
            warn!(
                "close commit for {} produced nothing: {}",
                request.issue_id,
                commit.stderr.trim()
            );
        }
        push_main(config, git)?;
    } else {
        warn!(
            "issue file {} already gone; closing {} without a move",
            src_rel, request.issue_id
        );
    }
    info!("closed {} without merging", request.issue_id);
    Ok(MergeStatus::ClosedNoMerge)
}

/// Stash-skip discipline. A dirty main working copy is never stashed;
/// stashing would pick up unrelated leaks. Files belonging to the merging
/// request are committed; anything else is left alone and the following
/// pull surfaces the failure.
fn commit_request_files(
    config: &RunConfig,
    git: &dyn GitRunner,
    request: &MergeRequest,
) -> Result<()> {
    let status = git.run_git(
        "status",
        &["status", "--porcelain"],
        &config.repo_root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    if status.stdout.trim().is_empty() {
        return Ok(());
    }
    let dirty = parse_porcelain_paths(&status.stdout);
    let ours: Vec<String> = request
        .result
        .changed_files
        .iter()
        .map(|p| p.display().to_string())
        .filter(|p| dirty.contains(p))
        .collect();
    if ours.is_empty() {
        warn!(
            "main working copy dirty with files unrelated to {}; proceeding without stashing",
            request.issue_id
        );
        return Ok(());
    }
    let mut add_args: Vec<&str> = vec!["add", "--"];
    add_args.extend(ours.iter().map(String::as_str));
    git.run_git("add", &add_args, &config.repo_root, GIT_OP_TIMEOUT, true)?;
    let message = format!("chore: collect worker files for {}", request.issue_id);
    git.run_git(
        "commit",
        &["commit", "-m", &message],
        &config.repo_root,
        GIT_OP_TIMEOUT,
        true,
    )?;
    Ok(())
}

fn pull_main(config: &RunConfig, git: &dyn GitRunner) -> Result<()> {
    run_retrying(config, git, "pull", &["pull", "--ff-only"])
}

fn push_main(config: &RunConfig, git: &dyn GitRunner) -> Result<()> {
    run_retrying(
        config,
        git,
        "push",
        &["push", "origin", &config.main_branch],
    )
}

/// Retry wrapper for the two remote-facing steps. Transient failures (and
/// git-lock/subprocess timeouts) retry with a doubling backoff from
/// `merge_retry_delay`; a missing remote is tolerated as offline operation;
/// divergence and everything else fail immediately.
fn run_retrying(
    config: &RunConfig,
    git: &dyn GitRunner,
    operation: &str,
    args: &[&str],
) -> Result<()> {
    let attempts = config.merge_retry_attempts.max(1);
    let mut delay = config.merge_retry_delay;
    for attempt in 1..=attempts {
        let out = match git.run_git(operation, args, &config.repo_root, GIT_OP_TIMEOUT, false) {
            Ok(out) => out,
            Err(e) if e.downcast_ref::<GitTimeout>().is_some() && attempt < attempts => {
                warn!("git {operation} timed out (attempt {attempt}/{attempts}), retrying");
                thread::sleep(delay);
                delay *= 2;
                continue;
            }
            Err(e) => return Err(e),
        };
        if out.success() {
            return Ok(());
        }
        if is_missing_remote_error(&out.stderr) {
            debug!("git {operation}: no usable remote, continuing offline");
            return Ok(());
        }
        if is_divergence_error(&out.stderr) {
            bail!(
                "git {operation} rejected by local divergence: {}",
                out.stderr.trim()
            );
        }
        if is_transient_git_error(&out.stderr) && attempt < attempts {
            warn!(
                "git {operation} transient failure (attempt {attempt}/{attempts}): {}",
                out.stderr.trim()
            );
            thread::sleep(delay);
            delay *= 2;
            continue;
        }
        bail!(
            "git {operation} failed after {attempt} attempt(s): {}",
            out.stderr.trim()
        );
    }
    unreachable!("retry loop returns or bails");
}

fn is_conflict_output(out: &GitOutput) -> bool {
    let text = format!("{}\n{}", out.stdout, out.stderr).to_ascii_lowercase();
    text.contains("conflict") || text.contains("automatic merge failed") || text.contains("could not apply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkerResult;
    use crate::verdict::Verdict;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted git backend recording every argv.
    #[derive(Default)]
    struct MockGit {
        calls: Mutex<Vec<Vec<String>>>,
        /// Remaining scripted pull failures (transient stderr).
        pull_failures: AtomicI64,
        merge_conflict: bool,
        /// stderr for pull failures; transient by default.
        pull_stderr: Option<String>,
        push_stderr: Option<String>,
        /// Canned stdout by subcommand (e.g. "status").
        stdout_for: HashMap<String, String>,
    }

    impl MockGit {
        fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|argv| argv.first().map(String::as_str) == Some(subcommand))
                .cloned()
                .collect()
        }
    }

    impl GitRunner for MockGit {
        fn run_git(
            &self,
            _operation: &str,
            args: &[&str],
            _cwd: &Path,
            _timeout: Duration,
            check: bool,
        ) -> Result<GitOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let sub = args.first().copied().unwrap_or_default();
            let out = match sub {
                "pull" if self.pull_failures.fetch_sub(1, Ordering::SeqCst) > 0 => GitOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: self.pull_stderr.clone().unwrap_or_else(|| {
                        "fatal: unable to access 'https://example.com/': Could not resolve host"
                            .to_string()
                    }),
                },
                "merge" if self.merge_conflict && args.len() > 1 && args[1] != "--abort" => {
                    GitOutput {
                        exit_code: 1,
                        stdout: "CONFLICT (content): Merge conflict in src/lib.rs".to_string(),
                        stderr: "Automatic merge failed; fix conflicts and then commit".to_string(),
                    }
                }
                "push" if self.push_stderr.is_some() => GitOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: self.push_stderr.clone().unwrap(),
                },
                _ => GitOutput {
                    exit_code: 0,
                    stdout: self.stdout_for.get(sub).cloned().unwrap_or_default(),
                    stderr: String::new(),
                },
            };
            if check && !out.success() {
                bail!("git {} failed: {}", args.join(" "), out.stderr);
            }
            Ok(out)
        }
    }

    fn worker_result(issue_id: &str, changed: &[&str]) -> WorkerResult {
        WorkerResult {
            issue_id: issue_id.to_string(),
            branch_name: format!("parallel/{issue_id}"),
            worktree_path: PathBuf::from(format!(".worktrees/worker-{issue_id}")),
            success: true,
            verdict: Verdict::Ready,
            duration: 1.0,
            work_done: !changed.is_empty(),
            should_close: false,
            error: None,
            changed_files: changed.iter().map(PathBuf::from).collect(),
        }
    }

    fn request(issue_id: &str, changed: &[&str]) -> MergeRequest {
        MergeRequest {
            issue_id: issue_id.to_string(),
            branch_name: format!("parallel/{issue_id}"),
            worktree_path: PathBuf::from(format!(".worktrees/worker-{issue_id}")),
            issue_path: PathBuf::from(format!("issues/{issue_id}.md")),
            result: worker_result(issue_id, changed),
            status: MergeStatus::Pending,
        }
    }

    fn fast_config(root: &Path) -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.repo_root = root.to_path_buf();
        cfg.merge_retry_delay = Duration::from_millis(1);
        cfg
    }

    // ── Merge sequence ───────────────────────────────────────────────────────

    #[test]
    fn happy_path_emits_full_sequence() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit::default();
        let status = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap();
        assert_eq!(status, MergeStatus::Merged);

        let subs: Vec<String> = git
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv[0].clone())
            .collect();
        assert_eq!(subs, vec!["fetch", "checkout", "status", "pull", "merge", "push"]);
        assert_eq!(
            git.calls_for("merge")[0],
            vec!["merge".to_string(), "parallel/BUG-1".to_string()]
        );
        assert_eq!(git.calls_for("pull")[0], vec!["pull", "--ff-only"]);
        assert_eq!(git.calls_for("push")[0], vec!["push", "origin", "main"]);
    }

    #[test]
    fn rebase_strategy_swaps_the_integration_command() {
        let dir = TempDir::new().unwrap();
        let mut cfg = fast_config(dir.path());
        cfg.merge_strategy = MergeStrategy::Rebase;
        let git = MockGit::default();
        merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap();
        assert_eq!(git.calls_for("rebase").len(), 1);
        assert!(git.calls_for("merge").is_empty());
    }

    #[test]
    fn pull_retries_transient_failures_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit {
            pull_failures: AtomicI64::new(2),
            ..MockGit::default()
        };
        let status = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap();
        assert_eq!(status, MergeStatus::Merged);
        assert_eq!(git.calls_for("pull").len(), 3);
        assert_eq!(git.calls_for("push").len(), 1, "exactly one successful push");
    }

    #[test]
    fn pull_exhausts_retries_and_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit {
            pull_failures: AtomicI64::new(99),
            ..MockGit::default()
        };
        let err = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap_err();
        assert!(err.to_string().contains("pull"));
        assert_eq!(git.calls_for("pull").len(), 3);
        assert!(git.calls_for("push").is_empty());
    }

    #[test]
    fn divergence_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit {
            pull_failures: AtomicI64::new(99),
            pull_stderr: Some("fatal: Not possible to fast-forward, aborting.".to_string()),
            ..MockGit::default()
        };
        let err = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap_err();
        assert!(err.to_string().contains("divergence"));
        assert_eq!(git.calls_for("pull").len(), 1);
    }

    #[test]
    fn conflict_aborts_merge_and_reports_conflict() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit {
            merge_conflict: true,
            ..MockGit::default()
        };
        let status = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap();
        assert_eq!(status, MergeStatus::Conflict);
        let merges = git.calls_for("merge");
        assert_eq!(merges.len(), 2);
        assert_eq!(merges[1], vec!["merge", "--abort"]);
        assert!(git.calls_for("push").is_empty());
    }

    #[test]
    fn missing_remote_is_tolerated_on_push() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit {
            push_stderr: Some(
                "fatal: 'origin' does not appear to be a git repository".to_string(),
            ),
            ..MockGit::default()
        };
        let status = merge_request(&cfg, &git, &request("BUG-1", &[])).unwrap();
        assert_eq!(status, MergeStatus::Merged);
    }

    // ── Stash-skip discipline ────────────────────────────────────────────────

    #[test]
    fn dirty_tree_commits_only_request_files() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let mut stdout_for = HashMap::new();
        stdout_for.insert(
            "status".to_string(),
            " M src/a.rs\n?? leaked-note.md\n".to_string(),
        );
        let git = MockGit {
            stdout_for,
            ..MockGit::default()
        };
        merge_request(&cfg, &git, &request("BUG-1", &["src/a.rs"])).unwrap();

        let adds = git.calls_for("add");
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0], vec!["add", "--", "src/a.rs"]);
        assert!(!adds[0].contains(&"leaked-note.md".to_string()));
        assert_eq!(git.calls_for("commit").len(), 1);
        // Never a stash.
        assert!(git.calls_for("stash").is_empty());
    }

    #[test]
    fn dirty_tree_with_no_request_files_proceeds_without_commit() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let mut stdout_for = HashMap::new();
        stdout_for.insert("status".to_string(), "?? leaked-note.md\n".to_string());
        let git = MockGit {
            stdout_for,
            ..MockGit::default()
        };
        merge_request(&cfg, &git, &request("BUG-1", &["src/a.rs"])).unwrap();
        assert!(git.calls_for("add").is_empty());
        assert!(git.calls_for("commit").is_empty());
        assert!(git.calls_for("stash").is_empty());
    }

    // ── Close path ───────────────────────────────────────────────────────────

    #[test]
    fn close_moves_issue_file_and_pushes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("issues")).unwrap();
        std::fs::write(dir.path().join("issues/BUG-1.md"), "obsolete\n").unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit::default();

        let mut req = request("BUG-1", &[]);
        req.result.should_close = true;
        let (status, message) = process_request(&cfg, &git, &req);
        assert_eq!(status, MergeStatus::ClosedNoMerge);
        assert!(message.is_none());

        let mvs = git.calls_for("mv");
        assert_eq!(mvs.len(), 1);
        assert_eq!(
            mvs[0],
            vec!["mv", "issues/BUG-1.md", "issues/completed/BUG-1.md"]
        );
        assert_eq!(git.calls_for("commit").len(), 1);
        assert_eq!(git.calls_for("push").len(), 1);
        assert!(git.calls_for("merge").is_empty(), "close path never merges");
    }

    #[test]
    fn close_with_missing_file_still_settles() {
        let dir = TempDir::new().unwrap();
        let cfg = fast_config(dir.path());
        let git = MockGit::default();
        let mut req = request("BUG-1", &[]);
        req.result.should_close = true;
        let (status, _) = process_request(&cfg, &git, &req);
        assert_eq!(status, MergeStatus::ClosedNoMerge);
        assert!(git.calls_for("mv").is_empty());
    }

    // ── Coordinator thread ───────────────────────────────────────────────────

    #[test]
    fn requests_settle_in_fifo_order_with_cleanup() {
        let dir = TempDir::new().unwrap();
        let cfg = Arc::new(fast_config(dir.path()));
        let git: Arc<dyn GitRunner> = Arc::new(MockGit::default());

        let (settled_tx, settled_rx) = mpsc::channel::<MergeSettled>();
        let cleaned = Arc::new(Mutex::new(Vec::<String>::new()));
        let cleaned2 = Arc::clone(&cleaned);
        let mut coordinator = MergeCoordinator::start(
            cfg,
            git,
            MergeHooks {
                on_settled: Box::new(move |s| {
                    let _ = settled_tx.send(s);
                }),
                cleanup: Box::new(move |id| {
                    cleaned2.lock().unwrap().push(id.to_string());
                }),
            },
        )
        .unwrap();

        coordinator.submit(request("BUG-1", &[])).unwrap();
        coordinator.submit(request("BUG-2", &[])).unwrap();
        coordinator.submit(request("BUG-3", &[])).unwrap();

        let mut order = vec![];
        for _ in 0..3 {
            let settled = settled_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(settled.status, MergeStatus::Merged);
            order.push(settled.issue_id);
        }
        assert_eq!(order, vec!["BUG-1", "BUG-2", "BUG-3"]);
        coordinator.close();
        assert_eq!(*cleaned.lock().unwrap(), vec!["BUG-1", "BUG-2", "BUG-3"]);
    }

    #[test]
    fn failed_merge_skips_cleanup_and_reports_message() {
        let dir = TempDir::new().unwrap();
        let cfg = Arc::new(fast_config(dir.path()));
        let git: Arc<dyn GitRunner> = Arc::new(MockGit {
            pull_failures: AtomicI64::new(99),
            ..MockGit::default()
        });
        let (settled_tx, settled_rx) = mpsc::channel::<MergeSettled>();
        let cleaned = Arc::new(Mutex::new(Vec::<String>::new()));
        let cleaned2 = Arc::clone(&cleaned);
        let mut coordinator = MergeCoordinator::start(
            cfg,
            git,
            MergeHooks {
                on_settled: Box::new(move |s| {
                    let _ = settled_tx.send(s);
                }),
                cleanup: Box::new(move |id| {
                    cleaned2.lock().unwrap().push(id.to_string());
                }),
            },
        )
        .unwrap();

        coordinator.submit(request("BUG-1", &[])).unwrap();
        let settled = settled_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(settled.status, MergeStatus::Failed);
        assert!(settled.message.unwrap().contains("pull"));
        coordinator.close();
        assert!(cleaned.lock().unwrap().is_empty());
    }

    #[test]
    fn submit_after_close_errors() {
        let dir = TempDir::new().unwrap();
        let cfg = Arc::new(fast_config(dir.path()));
        let git: Arc<dyn GitRunner> = Arc::new(MockGit::default());
        let mut coordinator = MergeCoordinator::start(
            cfg,
            git,
            MergeHooks {
                on_settled: Box::new(|_| {}),
                cleanup: Box::new(|_| {}),
            },
        )
        .unwrap();
        coordinator.close();
        let err = coordinator.submit(request("BUG-1", &[])).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
