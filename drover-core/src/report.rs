//! End-of-run report accumulation and rendering.

use std::time::Duration;

use crate::state::PendingWorktreeInfo;

#[derive(Debug, Clone)]
enum Outcome {
    Merged { issue_id: String },
    Closed { issue_id: String },
    NoChanges { issue_id: String, verdict: String },
    Failed { issue_id: String, reason: String },
    Skipped { issue_id: String, reason: String },
}

/// Accumulates per-issue outcomes during a run; rendered once at the end.
#[derive(Debug, Default)]
pub struct RunReport {
    outcomes: Vec<Outcome>,
    pending_worktrees: Vec<PendingWorktreeInfo>,
    interrupted: bool,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_merged(&mut self, issue_id: &str) {
        self.outcomes.push(Outcome::Merged {
            issue_id: issue_id.to_string(),
        });
    }

    pub fn record_closed(&mut self, issue_id: &str) {
        self.outcomes.push(Outcome::Closed {
            issue_id: issue_id.to_string(),
        });
    }

    pub fn record_no_changes(&mut self, issue_id: &str, verdict: &str) {
        self.outcomes.push(Outcome::NoChanges {
            issue_id: issue_id.to_string(),
            verdict: verdict.to_string(),
        });
    }

    pub fn record_failed(&mut self, issue_id: &str, reason: &str) {
        self.outcomes.push(Outcome::Failed {
            issue_id: issue_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn record_skipped(&mut self, issue_id: &str, reason: &str) {
        self.outcomes.push(Outcome::Skipped {
            issue_id: issue_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn record_pending_worktrees(&mut self, infos: Vec<PendingWorktreeInfo>) {
        self.pending_worktrees = infos;
    }

    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn merged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Merged { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Failed { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Render the report block printed at the end of a run.
    pub fn render(&self, elapsed: Duration) -> String {
        let mut out = String::new();
        out.push_str("=== Run report ===\n");
        if self.interrupted {
            out.push_str("Interrupted by user.\n");
        }
        if self.outcomes.is_empty() {
            out.push_str("No issues processed.\n");
        }
        for outcome in &self.outcomes {
            match outcome {
                Outcome::Merged { issue_id } => {
                    out.push_str(&format!("  merged   {issue_id}\n"));
                }
                Outcome::Closed { issue_id } => {
                    out.push_str(&format!("  closed   {issue_id} (no merge)\n"));
                }
                Outcome::NoChanges { issue_id, verdict } => {
                    out.push_str(&format!("  no-op    {issue_id} (verdict: {verdict})\n"));
                }
                Outcome::Failed { issue_id, reason } => {
                    out.push_str(&format!("  FAILED   {issue_id}: {reason}\n"));
                }
                Outcome::Skipped { issue_id, reason } => {
                    out.push_str(&format!("  skipped  {issue_id} ({reason})\n"));
                }
            }
        }
        if !self.pending_worktrees.is_empty() {
            out.push_str("Worktrees with pending work left on disk:\n");
            for info in &self.pending_worktrees {
                out.push_str(&format!(
                    "  {} at {} ({} commit(s) ahead{}): {}\n",
                    info.issue_id,
                    info.path.display(),
                    info.commits_ahead,
                    if info.has_uncommitted_changes {
                        ", uncommitted changes"
                    } else {
                        ""
                    },
                    info.reason,
                ));
            }
        }
        out.push_str(&format!(
            "{} merged, {} failed, {} total in {:.1}s\n",
            self.merged_count(),
            self.failed_count(),
            self.outcomes.len(),
            elapsed.as_secs_f64(),
        ));
        out
    }
}
