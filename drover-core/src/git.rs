//! Process-wide git serialization.
//!
//! Every git invocation in the run goes through [`GitLock::run`]; the lock is
//! held for the duration of the subprocess, not merely argv construction.
//! The lock is not reentrant: callers must never invoke `run` while holding
//! a guard.

use std::error::Error;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, for single-value probes like `rev-list --count`.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Timeout while waiting for the git lock or for a git subprocess.
#[derive(Debug)]
pub struct GitTimeout {
    pub operation: String,
    pub waited: Duration,
}

impl fmt::Display for GitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "git operation '{}' timed out after {:.1}s",
            self.operation,
            self.waited.as_secs_f64()
        )
    }
}

impl Error for GitTimeout {}

#[derive(Default)]
struct LockState {
    held: bool,
    holder: Option<String>,
}

/// Mutex around every git invocation, with timeouts and a contention counter.
///
/// Logically global to one run: it lives in the run instance and is shared by
/// `Arc`, never as module-level state.
pub struct GitLock {
    state: Mutex<LockState>,
    released: Condvar,
    contention: AtomicU64,
}

/// Scoped acquisition: releases the lock on drop, so release happens even
/// when the holder unwinds.
pub struct GitLockGuard<'a> {
    lock: &'a GitLock,
}

impl Drop for GitLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl Default for GitLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GitLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            contention: AtomicU64::new(0),
        }
    }

    /// Acquire the lock, recording `operation` plus the calling thread as the
    /// holder label. Increments the contention counter when the lock was
    /// already held; no backoff is applied here.
    pub fn acquire(&self, operation: &str, timeout: Duration) -> Result<GitLockGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.held {
            self.contention.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + timeout;
            while state.held {
                let now = Instant::now();
                if now >= deadline {
                    bail!(GitTimeout {
                        operation: operation.to_string(),
                        waited: timeout,
                    });
                }
                let (guard, _) = self.released.wait_timeout(state, deadline - now).unwrap();
                state = guard;
            }
        }
        state.held = true;
        let thread_name = thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        state.holder = Some(format!("{operation} ({thread_name})"));
        Ok(GitLockGuard { lock: self })
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.held = false;
        state.holder = None;
        self.released.notify_one();
    }

    /// How many acquisitions had to wait for another holder.
    pub fn contention_count(&self) -> u64 {
        self.contention.load(Ordering::SeqCst)
    }

    /// Diagnostic label of the current holder, if any.
    pub fn current_holder(&self) -> Option<String> {
        self.state.lock().unwrap().holder.clone()
    }

    /// Run `git <args>` in `cwd` under the lock.
    ///
    /// With `check`, a non-zero exit becomes an error carrying stderr.
    /// On subprocess timeout the child is killed, the lock is released, and
    /// a [`GitTimeout`] surfaces to the caller.
    pub fn run(
        &self,
        operation: &str,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
        check: bool,
    ) -> Result<GitOutput> {
        let _guard = self.acquire(operation, timeout)?;
        let output = run_command_with_timeout("git", args, cwd, timeout).map_err(|e| {
            e.context(format!("git {} (op: {operation})", args.join(" ")))
        })?;
        if check && !output.success() {
            bail!(
                "git {} failed with status {}: {}",
                args.join(" "),
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

/// Spawn a command, drain both pipes on reader threads, and poll for exit
/// against the deadline. On expiry the child is killed and a [`GitTimeout`]
/// is returned.
fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<GitOutput> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_reader = thread::spawn(move || read_all(stdout));
    let err_reader = thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = out_reader.join();
                    let _ = err_reader.join();
                    bail!(GitTimeout {
                        operation: format!("{program} {}", args.join(" ")),
                        waited: timeout,
                    });
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    Ok(GitOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn read_all(mut pipe: impl Read) -> String {
    let mut buf = String::new();
    let _ = pipe.read_to_string(&mut buf);
    buf
}

/// Paths from `XY path` porcelain status lines; rename entries keep the new
/// name.
pub fn parse_porcelain_paths(stdout: &str) -> std::collections::BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.get(3..))
        .map(|p| {
            p.split(" -> ")
                .last()
                .unwrap_or(p)
                .trim()
                .trim_matches('"')
                .to_string()
        })
        .filter(|p| !p.is_empty())
        .collect()
}

/// Whether a failed git invocation looks retryable: network hiccups, lock
/// files, temporary remote unavailability. Conflicts and divergence are not.
pub fn is_transient_git_error(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    [
        "index.lock",
        "shallow.lock",
        "unable to access",
        "could not resolve host",
        "connection reset",
        "connection timed out",
        "operation timed out",
        "temporarily unavailable",
        "early eof",
        "the remote end hung up",
        "failed to lock",
        "cannot lock ref",
    ]
    .iter()
    .any(|pat| s.contains(pat))
}

/// A pull/push rejection caused by local divergence; fails non-retryably.
pub fn is_divergence_error(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("non-fast-forward") || s.contains("divergent") || s.contains("not possible to fast-forward")
}

/// Whether this failure means the repository simply has no usable remote;
/// offline operation tolerates these for fetch/pull/push.
pub fn is_missing_remote_error(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("does not appear to be a git repository")
        || s.contains("no such remote")
        || s.contains("'origin' does not exist")
        || s.contains("no configured push destination")
        || s.contains("no remote repository specified")
        || s.contains("no tracking information")
}
