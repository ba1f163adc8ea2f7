//! Run configuration.
//!
//! Resolution order: **CLI flag > config file > hardcoded default**. The file
//! is plain `key = value` lines with `#` comments. Sprint declarations use
//! `sprint.NAME = ID, ID, ...` keys.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// How a finished branch lands on the main branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Some(Self::Merge),
            "rebase" => Some(Self::Rebase),
            _ => None,
        }
    }
}

/// Plain options record for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Repository root; defaults to the current directory.
    pub repo_root: PathBuf,
    pub max_workers: usize,
    /// P0 issues are serialized, never parallel.
    pub p0_sequential: bool,
    pub worktree_base_dir: String,
    pub branch_prefix: String,
    pub main_branch: String,
    pub merge_strategy: MergeStrategy,
    /// Envelope around one issue's whole pipeline.
    pub timeout_per_issue: Duration,
    /// Assistant subprocess wall clock.
    pub claude_timeout: Duration,
    /// Assistant no-output inactivity cutoff.
    pub idle_timeout: Duration,
    /// 0 = unlimited.
    pub max_issues_per_run: usize,
    pub only_ids: BTreeSet<String>,
    pub skip_ids: BTreeSet<String>,
    pub category: Option<String>,
    pub dry_run: bool,
    pub merge_retry_attempts: u32,
    pub merge_retry_delay: Duration,
    pub issues_dir: String,
    pub completed_dir: String,
    pub assistant_cmd: String,
    /// Continuation handoffs honored per issue.
    pub max_continuations: u32,
    pub quiet: bool,
    /// Pre-declared ID sets for `sprint run NAME`.
    pub sprints: BTreeMap<String, Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            max_workers: 2,
            p0_sequential: true,
            worktree_base_dir: ".worktrees".to_string(),
            branch_prefix: "parallel/".to_string(),
            main_branch: "main".to_string(),
            merge_strategy: MergeStrategy::Merge,
            timeout_per_issue: Duration::from_secs(3600),
            claude_timeout: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(300),
            max_issues_per_run: 0,
            only_ids: BTreeSet::new(),
            skip_ids: BTreeSet::new(),
            category: None,
            dry_run: false,
            merge_retry_attempts: 3,
            merge_retry_delay: Duration::from_secs_f64(2.0),
            issues_dir: "issues".to_string(),
            completed_dir: "issues/completed".to_string(),
            assistant_cmd: "claude".to_string(),
            max_continuations: 3,
            quiet: false,
            sprints: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Defaults plus overrides from the config file at `path`, if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = path {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            for (lineno, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let Some((key, value)) = line.split_once('=') else {
                    log::warn!(
                        "{}:{}: ignoring malformed config line",
                        path.display(),
                        lineno + 1
                    );
                    continue;
                };
                cfg.apply_file_entry(key.trim(), value.trim());
            }
        }
        Ok(cfg)
    }

    fn apply_file_entry(&mut self, key: &str, value: &str) {
        match key {
            "max_workers" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.max_workers = n.max(1);
                }
            }
            "p0_sequential" => self.p0_sequential = value == "true",
            "worktree_base_dir" => self.worktree_base_dir = value.to_string(),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "main_branch" => self.main_branch = value.to_string(),
            "merge_strategy" => {
                if let Some(s) = MergeStrategy::parse(value) {
                    self.merge_strategy = s;
                }
            }
            "timeout_per_issue" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.timeout_per_issue = Duration::from_secs(n);
                }
            }
            "claude_timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.claude_timeout = Duration::from_secs(n);
                }
            }
            "idle_timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.idle_timeout = Duration::from_secs(n);
                }
            }
            "max_issues_per_run" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.max_issues_per_run = n;
                }
            }
            "only_ids" => self.only_ids = parse_id_list(value),
            "skip_ids" => self.skip_ids = parse_id_list(value),
            "category" => {
                self.category = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "merge_retry_attempts" => {
                if let Ok(n) = value.parse::<u32>() {
                    self.merge_retry_attempts = n;
                }
            }
            "merge_retry_delay" => {
                if let Ok(n) = value.parse::<f64>() {
                    self.merge_retry_delay = Duration::from_secs_f64(n);
                }
            }
            "issues_dir" => self.issues_dir = value.to_string(),
            "completed_dir" => self.completed_dir = value.to_string(),
            "assistant_cmd" => self.assistant_cmd = value.to_string(),
            "max_continuations" => {
                if let Ok(n) = value.parse::<u32>() {
                    self.max_continuations = n;
                }
            }
            _ => {
                if let Some(name) = key.strip_prefix("sprint.") {
                    let ids: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !ids.is_empty() {
                        self.sprints.insert(name.to_string(), ids);
                    }
                }
            }
        }
    }

    /// Absolute path of the worktree base directory.
    pub fn worktree_base(&self) -> PathBuf {
        self.repo_root.join(&self.worktree_base_dir)
    }

    /// Branch name for an issue: `<branch_prefix><issue_id>`.
    pub fn branch_for(&self, issue_id: &str) -> String {
        format!("{}{}", self.branch_prefix, issue_id)
    }

    /// Worktree path for an issue: `<worktree_base>/worker-<issue_id>`.
    pub fn worktree_for(&self, issue_id: &str) -> PathBuf {
        self.worktree_base().join(format!("worker-{issue_id}"))
    }

    /// Issue ID encoded in a `worker-*` directory name, if any.
    pub fn issue_id_from_worktree(dir_name: &str) -> Option<&str> {
        dir_name.strip_prefix("worker-").filter(|s| !s.is_empty())
    }
}

fn parse_id_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
