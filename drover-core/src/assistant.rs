//! Assistant CLI invocation: prompt construction and supervised execution.
//!
//! The CLI contract is intentionally thin: the configured command receives a
//! prompt via `-p`, runs inside the issue's worktree, and emits free text on
//! stdout. The probe prompt asks for a `VERDICT:` line; the manage prompt
//! explains the handoff protocol. Continuations re-run the same argv with
//! `--resume` appended.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::issue::Issue;
use crate::ports::{AssistantOutput, AssistantRunner, ProcessHooks};
use crate::supervisor::{supervise, SuperviseSpec};
use crate::verdict::{CONTINUE_PROMPT_FILE, HANDOFF_MARKER};

/// Build the readiness-probe prompt for an issue.
pub fn build_probe_prompt(issue: &Issue) -> String {
    format!(
        "Assess whether this issue is ready to implement.\n\n\
         Issue {id} ({itype}, {priority}): {title}\n\
         Issue file: {path}\n\n\
         Instructions:\n\
         - Read the issue file and judge whether the acceptance criteria are actionable\n\
         - If the file has fixable problems (stale paths, typos in references), fix the file in place\n\
         - Do NOT implement the change itself\n\
         - Finish with exactly one line:\n\
           VERDICT: READY | CORRECTED | NOT_READY | CLOSE\n\
           (CORRECTED = you fixed the file and it is now ready;\n\
            CLOSE = the issue is obsolete or already done and should be filed away)\n",
        id = issue.issue_id,
        itype = issue.issue_type,
        priority = issue.priority,
        title = issue.title,
        path = issue.path.display(),
    )
}

/// Build the implementation prompt for an issue.
pub fn build_manage_prompt(issue: &Issue) -> String {
    format!(
        "You are working in a dedicated git worktree on its own branch.\n\n\
         Your task ({id}, {priority}):\n{title}\n\
         Issue file: {path}\n\n\
         Instructions:\n\
         - Stay inside this worktree; never write to any other checkout of this repository\n\
         - Implement the change described in the issue file\n\
         - Run any existing tests and make sure they pass\n\
         - Commit your changes with a clear commit message; do NOT push\n\
         - If you run out of context before finishing: write what remains to\n\
           {continue_file} and print a line starting with '{marker}'\n",
        id = issue.issue_id,
        priority = issue.priority,
        title = issue.title,
        path = issue.path.display(),
        continue_file = CONTINUE_PROMPT_FILE,
        marker = HANDOFF_MARKER,
    )
}

/// Real [`AssistantRunner`]: runs the configured CLI under the subprocess
/// supervisor with the run's timeout settings.
pub struct CliAssistant {
    command: String,
    claude_timeout: Duration,
    idle_timeout: Duration,
    stream_output: bool,
}

impl CliAssistant {
    pub fn new(
        command: impl Into<String>,
        claude_timeout: Duration,
        idle_timeout: Duration,
        stream_output: bool,
    ) -> Self {
        Self {
            command: command.into(),
            claude_timeout,
            idle_timeout,
            stream_output,
        }
    }

    fn run_once(
        &self,
        prompt: String,
        resume: bool,
        worktree: &Path,
        budget: Duration,
        hooks: ProcessHooks<'_>,
    ) -> Result<AssistantOutput> {
        let mut args = vec!["-p".to_string(), prompt];
        if resume {
            args.push("--resume".to_string());
        }
        let spec = SuperviseSpec {
            program: self.command.clone(),
            args,
            cwd: worktree.to_path_buf(),
            // The issue envelope caps the subprocess wall clock.
            timeout: self.claude_timeout.min(budget),
            idle_timeout: self.idle_timeout,
            stream_output: self.stream_output,
        };
        let outcome = supervise(&spec, |pid| (hooks.on_start)(pid), || (hooks.on_end)())?;
        Ok(AssistantOutput {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
        })
    }
}

impl AssistantRunner for CliAssistant {
    fn probe(
        &self,
        issue: &Issue,
        worktree: &Path,
        budget: Duration,
        hooks: ProcessHooks<'_>,
    ) -> Result<AssistantOutput> {
        self.run_once(build_probe_prompt(issue), false, worktree, budget, hooks)
    }

    fn manage(
        &self,
        issue: &Issue,
        worktree: &Path,
        resume: bool,
        budget: Duration,
        hooks: ProcessHooks<'_>,
    ) -> Result<AssistantOutput> {
        self.run_once(build_manage_prompt(issue), resume, worktree, budget, hooks)
    }
}
