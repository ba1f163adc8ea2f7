//! Seam traits between the orchestration machinery and its side-effecting
//! collaborators. The worker pool and merge coordinator depend on these,
//! not on concrete processes, so tests inject mocks.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::git::{GitLock, GitOutput};
use crate::issue::Issue;

/// Executes git commands. Implemented by [`GitLock`] (every real invocation
/// goes through the process-wide lock); mocked with scripted outputs in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(
        &self,
        operation: &str,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
        check: bool,
    ) -> Result<GitOutput>;
}

impl GitRunner for GitLock {
    fn run_git(
        &self,
        operation: &str,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
        check: bool,
    ) -> Result<GitOutput> {
        self.run(operation, args, cwd, timeout, check)
    }
}

/// Captured result of one assistant invocation.
#[derive(Debug, Clone)]
pub struct AssistantOutput {
    pub exit_code: i32,
    pub stdout: String,
}

/// Subprocess lifecycle hooks threaded through from the worker pool so every
/// spawned assistant PID is registered for global shutdown.
pub struct ProcessHooks<'a> {
    pub on_start: &'a (dyn Fn(u32) + Sync),
    pub on_end: &'a (dyn Fn() + Sync),
}

impl ProcessHooks<'_> {
    /// Hooks that do nothing, for callers without a process registry.
    pub fn noop() -> ProcessHooks<'static> {
        const ON_START: &(dyn Fn(u32) + Sync) = &|_pid| {};
        const ON_END: &(dyn Fn() + Sync) = &|| {};
        ProcessHooks {
            on_start: ON_START,
            on_end: ON_END,
        }
    }
}

/// Runs the coding-assistant CLI against one issue inside its worktree.
///
/// `budget` is the remaining share of the issue's wall-clock envelope; the
/// implementation must not let the subprocess outlive it.
pub trait AssistantRunner: Send + Sync {
    /// Readiness probe; output feeds the verdict parser.
    fn probe(
        &self,
        issue: &Issue,
        worktree: &Path,
        budget: Duration,
        hooks: ProcessHooks<'_>,
    ) -> Result<AssistantOutput>;

    /// Implementation run. With `resume` the continuation flag is appended
    /// and the assistant picks up from its handoff file.
    fn manage(
        &self,
        issue: &Issue,
        worktree: &Path,
        resume: bool,
        budget: Duration,
        hooks: ProcessHooks<'_>,
    ) -> Result<AssistantOutput>;
}
