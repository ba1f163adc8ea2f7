use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use drover_core::config::RunConfig;
use drover_core::issue::Priority;

#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Drive a coding assistant across many issues in parallel git worktrees",
    long_about = "drover schedules issue files onto a worker pool, isolates each run in its \
                  own git worktree, and serializes finished branches back into the main branch."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process issues concurrently on a worker pool
    Parallel {
        #[command(flatten)]
        common: CommonFlags,

        /// Worker pool size
        #[arg(long, value_name = "N")]
        max_workers: Option<usize>,
    },

    /// Process issues one at a time
    Auto {
        #[command(flatten)]
        common: CommonFlags,
    },

    /// Run a pre-declared sprint
    Sprint {
        #[command(subcommand)]
        command: SprintCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum SprintCommands {
    /// Run the named sprint's issue set
    Run {
        /// Sprint name declared in the config file (`sprint.NAME = ...`)
        name: String,

        #[command(flatten)]
        common: CommonFlags,
    },
}

#[derive(Debug, Args)]
pub struct CommonFlags {
    /// Stop after admitting this many issues (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub max_issues: Option<usize>,

    /// Only process issues in this category directory
    #[arg(long, value_name = "NAME")]
    pub category: Option<String>,

    /// Print the plan without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Resume a prior interrupted run from its state file
    #[arg(long)]
    pub resume: bool,

    /// Only these issue IDs (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub only: Vec<String>,

    /// Skip these issue IDs (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Only these priorities (comma-separated, e.g. P0,P1)
    #[arg(long, value_name = "PRIOS", value_delimiter = ',')]
    pub priority: Vec<String>,

    /// Config file path (`key = value` lines)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress per-issue progress output
    #[arg(long)]
    pub quiet: bool,

    /// Per-issue pipeline envelope in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Assistant subprocess wall clock in seconds
    #[arg(long, value_name = "SECS")]
    pub claude_timeout: Option<u64>,

    /// Assistant no-output cutoff in seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,
}

impl CommonFlags {
    /// Fold these flags over a loaded config. CLI wins over file.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(n) = self.max_issues {
            config.max_issues_per_run = n;
        }
        if self.category.is_some() {
            config.category = self.category.clone();
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if !self.only.is_empty() {
            config.only_ids = to_id_set(&self.only);
        }
        if !self.skip.is_empty() {
            config.skip_ids = to_id_set(&self.skip);
        }
        if self.quiet {
            config.quiet = true;
        }
        if let Some(secs) = self.timeout {
            config.timeout_per_issue = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = self.claude_timeout {
            config.claude_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout = std::time::Duration::from_secs(secs);
        }
    }

    /// Parsed `--priority` filter, if any.
    pub fn priorities(&self) -> Option<BTreeSet<Priority>> {
        if self.priority.is_empty() {
            return None;
        }
        Some(
            self.priority
                .iter()
                .filter_map(|p| Priority::parse(p))
                .collect(),
        )
    }
}

fn to_id_set(ids: &[String]) -> BTreeSet<String> {
    ids.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
