//! Durable orchestrator state for resume, plus the worker result and merge
//! request records that flow between components.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write as IoWrite};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::verdict::Verdict;

/// Return current UTC time as an ISO-8601 string.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// The outcome of one attempt on one issue, produced inside the worker pool
/// and transferred by value to the orchestrator and merge coordinator.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub issue_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub success: bool,
    pub verdict: Verdict,
    /// Wall-clock seconds for the whole pipeline.
    pub duration: f64,
    /// A meaningful file change landed in the worktree.
    pub work_done: bool,
    /// The verdict steered the pipeline away from code changes; the merge
    /// coordinator files the issue away instead of merging.
    pub should_close: bool,
    pub error: Option<String>,
    pub changed_files: Vec<PathBuf>,
}

/// Lifecycle of a merge request inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Pending,
    InProgress,
    Merged,
    Failed,
    Conflict,
    ClosedNoMerge,
}

impl MergeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
            Self::ClosedNoMerge => "closed_no_merge",
        }
    }

    /// Terminal states that settle the issue successfully.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Merged | Self::ClosedNoMerge)
    }
}

/// One branch queued for serialization into the main branch.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub issue_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Issue file path relative to the repository root (close path moves it).
    pub issue_path: PathBuf,
    pub result: WorkerResult,
    pub status: MergeStatus,
}

/// Snapshot of a worktree discovered at shutdown with work still in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingWorktreeInfo {
    pub issue_id: String,
    pub branch_name: String,
    pub path: PathBuf,
    pub commits_ahead: u64,
    pub has_uncommitted_changes: bool,
    pub reason: String,
}

impl PendingWorktreeInfo {
    pub fn has_pending_work(&self) -> bool {
        self.commits_ahead > 0 || self.has_uncommitted_changes
    }
}

/// Durable resume record, one JSON document at `.claude/ll-state.json`.
///
/// `attempted_issues` includes everything that left the queue, so a resume
/// skips those IDs regardless of outcome. Collections are ordered so that
/// serialize → deserialize → serialize is byte-stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorState {
    pub completed_issues: BTreeSet<String>,
    pub failed_issues: BTreeMap<String, String>,
    pub attempted_issues: BTreeSet<String>,
    pub start_time: String,
    pub last_update_time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_worktrees: Vec<PendingWorktreeInfo>,
}

impl OrchestratorState {
    pub fn fresh() -> Self {
        let now = utc_now();
        Self {
            start_time: now.clone(),
            last_update_time: now,
            ..Self::default()
        }
    }
}

/// Write `content` to `path` atomically using a temp file + rename.
///
/// `rename(2)` within one directory is atomic on POSIX, so readers always see
/// either the old complete file or the new complete file.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Filesystem store for [`OrchestratorState`] under `<repo_root>/.claude/`.
pub struct StateStore {
    path: PathBuf,
}

pub const STATE_FILE: &str = "ll-state.json";

impl StateStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join(".claude").join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load prior state; a missing file yields a fresh state. Unknown fields
    /// in the document are ignored for forward compatibility.
    pub fn load(&self) -> Result<OrchestratorState> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(OrchestratorState::fresh()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state: &OrchestratorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }
}
