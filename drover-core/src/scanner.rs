//! Issue scanner: walks the issues directory and parses Markdown issue files.
//!
//! An issue file is `<issues_dir>/<category>/<ISSUE-ID>.md` (category
//! optional) with optional `---`-delimited frontmatter:
//!
//! ```text
//! ---
//! priority: P1
//! type: BUG
//! blocked-by: BUG-3, FEAT-2
//! ---
//! # Fix the retry loop
//! ...body...
//! ```
//!
//! Parse failures skip the file with a warning; a scan never aborts the run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::warn;

use crate::issue::{Issue, IssueType, Priority};

/// Parse issue file content (pure, no I/O).
///
/// `issue_id` is the file stem; `category` the directory under the issues
/// root (empty for top-level files); `path` is recorded verbatim.
pub fn parse_issue_content(
    content: &str,
    issue_id: &str,
    category: &str,
    path: PathBuf,
) -> Issue {
    let mut priority = Priority::P2;
    let mut issue_type: Option<IssueType> = None;
    let mut blocked_by: Vec<String> = Vec::new();

    let lines: Vec<&str> = content.lines().collect();
    let n = lines.len();
    let mut i = 0;

    if n > 0 && lines[0].trim() == "---" {
        i = 1;
        while i < n {
            if lines[i].trim() == "---" {
                i += 1;
                break;
            }
            if let Some((key, val)) = lines[i].split_once(':') {
                let val = val.trim();
                match key.trim().to_ascii_lowercase().as_str() {
                    "priority" => {
                        if let Some(p) = Priority::parse(val) {
                            priority = p;
                        }
                    }
                    "type" => issue_type = IssueType::parse(val),
                    "blocked-by" | "blocked_by" => {
                        for id in val.split(',') {
                            let id = id.trim();
                            if !id.is_empty() && !blocked_by.iter().any(|b| b == id) {
                                blocked_by.push(id.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
    }

    // Title: first non-empty line after frontmatter, heading marker stripped.
    let mut title = String::new();
    while i < n {
        let line = lines[i].trim();
        if !line.is_empty() {
            title = line.trim_start_matches('#').trim().to_string();
            break;
        }
        i += 1;
    }
    if title.is_empty() {
        title = issue_id.to_string();
    }

    Issue {
        issue_id: issue_id.to_string(),
        priority,
        issue_type: issue_type.unwrap_or_else(|| IssueType::from_id(issue_id)),
        category: category.to_string(),
        path,
        title,
        blocked_by,
    }
}

/// Scan `<repo_root>/<issues_dir>` one level deep.
///
/// Files directly under the issues dir get an empty category; files in a
/// subdirectory get the directory name. The completed directory is skipped.
/// Results are sorted by ID for a deterministic seeding order.
pub fn scan_issues(repo_root: &Path, issues_dir: &str, completed_dir: &str) -> Result<Vec<Issue>> {
    let root = repo_root.join(issues_dir);
    let completed = repo_root.join(completed_dir);
    let mut issues = Vec::new();
    if !root.is_dir() {
        return Ok(issues);
    }

    let mut dirs = vec![(root.clone(), String::new())];
    for entry in fs::read_dir(&root)?.flatten() {
        let path = entry.path();
        if path.is_dir() && path != completed {
            let category = entry.file_name().to_string_lossy().to_string();
            dirs.push((path, category));
        }
    }

    for (dir, category) in dirs {
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "md"))
            .collect();
        files.sort();
        for file in files {
            let issue_id = file
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            let content = match fs::read_to_string(&file) {
                Ok(c) => c,
                Err(e) => {
                    warn!("skipping unreadable issue file {}: {e}", file.display());
                    continue;
                }
            };
            let rel = file
                .strip_prefix(repo_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| file.clone());
            issues.push(parse_issue_content(&content, &issue_id, &category, rel));
        }
    }

    issues.sort_by(|a, b| a.issue_id.cmp(&b.issue_id));
    Ok(issues)
}
