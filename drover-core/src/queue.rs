//! Thread-safe priority + FIFO issue queue.
//!
//! Ordering is `(priority, enqueue sequence, issue_id)`; membership is
//! set-backed so every pending ID appears at most once. Extraction moves an
//! ID into the in-flight set; `mark_completed` / `mark_failed` move it to a
//! terminal set. The heap uses lazy deletion: the pending set is
//! authoritative and stale heap entries are skipped on pop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::issue::{Issue, QueuedIssue};

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<QueuedIssue>>,
    pending: HashSet<String>,
    in_flight: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
}

pub struct IssueQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    next_seq: AtomicU64,
}

impl Default for IssueQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IssueQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            available: Condvar::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Add an issue. Returns false (no-op) if the ID is already known to the
    /// queue in any state (pending, in-flight, or terminal).
    pub fn add(&self, issue: Issue) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let id = &issue.issue_id;
        if inner.pending.contains(id)
            || inner.in_flight.contains(id)
            || inner.completed.contains(id)
            || inner.failed.contains(id)
        {
            return false;
        }
        inner.pending.insert(id.clone());
        let seq = self.seq();
        inner.heap.push(Reverse(QueuedIssue { issue, seq }));
        self.available.notify_one();
        true
    }

    /// Return a deferred in-flight issue to the tail of its priority class.
    ///
    /// The fresh sequence number is the penalty timestamp: the issue sorts
    /// after everything currently pending at the same priority.
    pub fn requeue(&self, issue: Issue) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let id = issue.issue_id.clone();
        if !inner.in_flight.remove(&id) {
            return false;
        }
        inner.pending.insert(id);
        let seq = self.seq();
        inner.heap.push(Reverse(QueuedIssue { issue, seq }));
        self.available.notify_one();
        true
    }

    /// Pop the minimum `(priority, seq)` entry, moving its ID in-flight.
    ///
    /// With `block` set, waits on the internal condition variable up to
    /// `timeout` (forever if `None`). Non-blocking `get` returns `None`
    /// immediately on empty; only the empty condition is absorbed.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Option<QueuedIssue> {
        let mut inner = self.inner.lock().unwrap();
        if block {
            let deadline = timeout.map(|t| Instant::now() + t);
            while inner.pending.is_empty() {
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return None;
                        }
                        let (guard, _) = self.available.wait_timeout(inner, d - now).unwrap();
                        inner = guard;
                    }
                    None => {
                        inner = self.available.wait(inner).unwrap();
                    }
                }
            }
        }
        // Lazy deletion: skip heap entries whose ID is no longer pending.
        while let Some(Reverse(entry)) = inner.heap.pop() {
            if inner.pending.remove(&entry.issue.issue_id) {
                inner.in_flight.insert(entry.issue.issue_id.clone());
                return Some(entry);
            }
        }
        None
    }

    /// Move an ID to the completed set. Idempotent; may be called without a
    /// prior `get` (filter-admission fast path), in which case the pending
    /// entry is dropped. Does not clear a prior failure marker; the
    /// completed set stays authoritative for resume.
    pub fn mark_completed(&self, issue_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(issue_id);
        inner.in_flight.remove(issue_id);
        inner.completed.insert(issue_id.to_string());
    }

    /// Move an ID to the failed set. Same call rules as `mark_completed`.
    pub fn mark_failed(&self, issue_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(issue_id);
        inner.in_flight.remove(issue_id);
        inner.failed.insert(issue_id.to_string());
    }

    pub fn is_completed(&self, issue_id: &str) -> bool {
        self.inner.lock().unwrap().completed.contains(issue_id)
    }

    pub fn is_failed(&self, issue_id: &str) -> bool {
        self.inner.lock().unwrap().failed.contains(issue_id)
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().unwrap().completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.inner.lock().unwrap().failed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Number of IDs extracted by `get` but not yet marked terminal.
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// Snapshot of the pending issues in the order `get` would return them.
    pub fn get_all_pending(&self) -> Vec<Issue> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<&QueuedIssue> = inner
            .heap
            .iter()
            .map(|Reverse(e)| e)
            .filter(|e| inner.pending.contains(&e.issue.issue_id))
            .collect();
        entries.sort();
        let mut seen = HashSet::new();
        entries
            .into_iter()
            .filter(|e| seen.insert(e.issue.issue_id.clone()))
            .map(|e| e.issue.clone())
            .collect()
    }

    /// Remove a pending ID without tracking it. No-op returning false for
    /// unknown or already-extracted IDs.
    pub fn remove(&self, issue_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(issue_id)
    }

    /// Drop all pending entries. Terminal and in-flight sets are preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.clear();
        inner.pending.clear();
    }
}
