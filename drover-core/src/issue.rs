use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Priority class of an issue. Lower sorts first: `P0 < P1 < … < P5`.
///
/// P0 is the sequential class by default; see `RunConfig::p0_sequential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::P4 => "P4",
            Self::P5 => "P5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            "P4" => Some(Self::P4),
            "P5" => Some(Self::P5),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work an issue represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueType {
    Bug,
    Feat,
    Enh,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "BUG",
            Self::Feat => "FEAT",
            Self::Enh => "ENH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUG" => Some(Self::Bug),
            "FEAT" => Some(Self::Feat),
            "ENH" => Some(Self::Enh),
            _ => None,
        }
    }

    /// Infer the type from an issue ID prefix like `BUG-123`; `Enh` otherwise.
    pub fn from_id(issue_id: &str) -> Self {
        issue_id
            .split_once('-')
            .and_then(|(prefix, _)| Self::parse(prefix))
            .unwrap_or(Self::Enh)
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work as produced by the scanner.
///
/// The orchestrator treats this as an opaque record; only `issue_id`,
/// `priority`, `category`, and `blocked_by` drive scheduling.
#[derive(Debug, Clone)]
pub struct Issue {
    /// Globally unique ASCII identifier (`BUG-123`, `FEAT-7`, …).
    pub issue_id: String,
    pub priority: Priority,
    pub issue_type: IssueType,
    /// Directory name under the issues dir; empty for top-level issues.
    pub category: String,
    /// Path of the issue file, relative to the repository root.
    pub path: PathBuf,
    pub title: String,
    /// IDs this issue waits on, in file order, deduped.
    pub blocked_by: Vec<String>,
}

/// An issue paired with its enqueue sequence number.
///
/// The sequence counter is the monotonic enqueue timestamp: re-queueing a
/// deferred issue assigns a fresh, larger value, which is what pushes it to
/// the tail of its priority class.
#[derive(Debug, Clone)]
pub struct QueuedIssue {
    pub issue: Issue,
    pub seq: u64,
}

impl QueuedIssue {
    fn key(&self) -> (Priority, u64, &str) {
        (self.issue.priority, self.seq, self.issue.issue_id.as_str())
    }
}

impl PartialEq for QueuedIssue {
    fn eq(&self, other: &Self) -> bool {
        self.issue.issue_id == other.issue.issue_id
    }
}

impl Eq for QueuedIssue {}

impl Ord for QueuedIssue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for QueuedIssue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_issue(id: &str, priority: Priority) -> Issue {
        Issue {
            issue_id: id.to_string(),
            priority,
            issue_type: IssueType::from_id(id),
            category: String::new(),
            path: PathBuf::from(format!("issues/{id}.md")),
            title: format!("Issue {id}"),
            blocked_by: vec![],
        }
    }

    #[test]
    fn priority_orders_p0_first() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P5);
    }

    #[test]
    fn priority_parse_roundtrip() {
        for p in [
            Priority::P0,
            Priority::P1,
            Priority::P2,
            Priority::P3,
            Priority::P4,
            Priority::P5,
        ] {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::parse("p3"), Some(Priority::P3));
        assert_eq!(Priority::parse("P9"), None);
        assert_eq!(Priority::parse(""), None);
    }

    #[test]
    fn issue_type_from_id_prefix() {
        assert_eq!(IssueType::from_id("BUG-123"), IssueType::Bug);
        assert_eq!(IssueType::from_id("FEAT-7"), IssueType::Feat);
        assert_eq!(IssueType::from_id("ENH-1"), IssueType::Enh);
        assert_eq!(IssueType::from_id("MISC-9"), IssueType::Enh);
        assert_eq!(IssueType::from_id("noprefix"), IssueType::Enh);
    }

    #[test]
    fn queued_issue_orders_by_priority_then_seq() {
        let a = QueuedIssue {
            issue: make_issue("ENH-2", Priority::P3),
            seq: 1,
        };
        let b = QueuedIssue {
            issue: make_issue("BUG-1", Priority::P0),
            seq: 2,
        };
        // Lower priority value wins despite the later sequence number.
        assert!(b < a);

        let c = QueuedIssue {
            issue: make_issue("BUG-3", Priority::P0),
            seq: 5,
        };
        assert!(b < c);
    }

    #[test]
    fn queued_issue_equality_is_by_id_only() {
        let a = QueuedIssue {
            issue: make_issue("BUG-1", Priority::P0),
            seq: 1,
        };
        let b = QueuedIssue {
            issue: make_issue("BUG-1", Priority::P4),
            seq: 99,
        };
        assert_eq!(a, b);
    }
}
