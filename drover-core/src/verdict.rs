//! Classification of assistant output: readiness verdicts and
//! continuation-handoff detection.

use std::fmt;

/// Outcome of the readiness probe.
///
/// A small closed set; everything downstream switches on the variant.
/// `Corrected` means the probe fixed the issue file itself and the run may
/// proceed; it collapses to `Ready` in the worker result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ready,
    Corrected,
    NotReady,
    Close,
    Unknown,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Corrected => "corrected",
            Self::NotReady => "not_ready",
            Self::Close => "close",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the pipeline proceeds to the implementation run.
    pub fn proceeds(self) -> bool {
        matches!(self, Self::Ready | Self::Corrected)
    }

    /// The value recorded in a `WorkerResult` (`corrected` folds into
    /// `ready`).
    pub fn as_result_str(self) -> &'static str {
        match self {
            Self::Corrected => "ready",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VERDICT_PREFIX: &str = "VERDICT:";

/// Marker line the assistant prints when it ran out of context and left a
/// continuation prompt behind.
pub const HANDOFF_MARKER: &str = "HANDOFF:";

/// Name of the continuation prompt file, relative to the worktree.
pub const CONTINUE_PROMPT_FILE: &str = ".claude/ll-continue-prompt.md";

/// Parse the verdict from probe stdout.
///
/// The last `VERDICT: <token>` occurrence wins, case-insensitively; anything
/// else (including an unrecognized token) is `Unknown`.
pub fn parse_verdict(stdout: &str) -> Verdict {
    let mut verdict = Verdict::Unknown;
    for line in stdout.lines() {
        let line = line.trim();
        let upper = line.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix(VERDICT_PREFIX) {
            verdict = match rest.trim() {
                "READY" => Verdict::Ready,
                "CORRECTED" => Verdict::Corrected,
                "NOT_READY" => Verdict::NotReady,
                "CLOSE" => Verdict::Close,
                _ => Verdict::Unknown,
            };
        }
    }
    verdict
}

/// Whether stdout carries the continuation handoff marker. The caller must
/// additionally confirm the continuation prompt file exists before resuming.
pub fn detect_handoff(stdout: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.trim_start().starts_with(HANDOFF_MARKER))
}
