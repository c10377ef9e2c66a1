//! Per-path event coalescing.
//!
//! Editors and atomic writers emit bursts; a path's events that arrive
//! within the debounce window collapse to one. The merge rule is "last op
//! wins", with one exception: a `Create` followed by `Write` stays
//! `Create`, because the observable outcome is still a new file.
//! `Chmod`-only notifications never enter the pending set.

use crate::{WatchEvent, WatchOp};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

struct Pending {
    op: WatchOp,
    is_directory: bool,
    last_seen: Instant,
}

/// Debouncing event accumulator, shared between the notification callback
/// and the flush task.
#[derive(Default)]
pub struct Debouncer {
    pending: Mutex<HashMap<PathBuf, Pending>>,
}

impl Debouncer {
    /// Create an empty debouncer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw notification.
    pub fn record(&self, path: PathBuf, op: WatchOp, is_directory: bool) {
        if matches!(op, WatchOp::Chmod) {
            return;
        }

        let mut pending = self.pending.lock();
        let now = Instant::now();
        pending
            .entry(path)
            .and_modify(|slot| {
                slot.op = merge(slot.op, op);
                slot.is_directory = is_directory;
                slot.last_seen = now;
            })
            .or_insert(Pending { op, is_directory, last_seen: now });
    }

    /// Take every path whose quiet period has elapsed.
    pub fn drain_due(&self, window: Duration) -> Vec<WatchEvent> {
        let now = Instant::now();
        let timestamp = Utc::now();
        let mut pending = self.pending.lock();
        let mut due = Vec::new();

        pending.retain(|path, slot| {
            if now.duration_since(slot.last_seen) >= window {
                due.push(WatchEvent {
                    path: path.clone(),
                    op: slot.op,
                    is_directory: slot.is_directory,
                    timestamp,
                });
                false
            } else {
                true
            }
        });
        due
    }

    /// Number of paths still inside their window.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop everything; used on shutdown, where the next full scan is the
    /// recovery path.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

fn merge(previous: WatchOp, next: WatchOp) -> WatchOp {
    match (previous, next) {
        (WatchOp::Create, WatchOp::Write) => WatchOp::Create,
        (_, op) => op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn drain_all(debouncer: &Debouncer) -> Vec<WatchEvent> {
        debouncer.drain_due(Duration::ZERO)
    }

    #[test]
    fn test_same_path_collapses_to_one_event() {
        let debouncer = Debouncer::new();
        let path = PathBuf::from("/root/a.txt");
        debouncer.record(path.clone(), WatchOp::Write, false);
        debouncer.record(path.clone(), WatchOp::Write, false);
        debouncer.record(path, WatchOp::Write, false);

        let events = drain_all(&debouncer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, WatchOp::Write);
    }

    #[test]
    fn test_create_then_write_stays_create() {
        let debouncer = Debouncer::new();
        let path = PathBuf::from("/root/new.txt");
        debouncer.record(path.clone(), WatchOp::Create, false);
        debouncer.record(path, WatchOp::Write, false);

        let events = drain_all(&debouncer);
        assert_eq!(events[0].op, WatchOp::Create);
    }

    #[test]
    fn test_rename_then_remove_emits_remove() {
        let debouncer = Debouncer::new();
        let path = PathBuf::from("/root/x");
        debouncer.record(path.clone(), WatchOp::Rename, false);
        debouncer.record(path, WatchOp::Remove, false);

        let events = drain_all(&debouncer);
        assert_eq!(events[0].op, WatchOp::Remove);
    }

    #[test]
    fn test_chmod_suppressed() {
        let debouncer = Debouncer::new();
        debouncer.record(PathBuf::from("/root/a"), WatchOp::Chmod, false);
        assert_eq!(debouncer.pending_len(), 0);
        assert!(drain_all(&debouncer).is_empty());
    }

    #[test]
    fn test_window_holds_recent_events() {
        let debouncer = Debouncer::new();
        debouncer.record(PathBuf::from("/root/a"), WatchOp::Write, false);

        // Still inside a generous window: nothing due.
        assert!(debouncer.drain_due(Duration::from_secs(60)).is_empty());
        assert_eq!(debouncer.pending_len(), 1);

        // Window elapsed (zero window): due now.
        let events = drain_all(&debouncer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, Path::new("/root/a"));
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[test]
    fn test_distinct_paths_do_not_coalesce() {
        let debouncer = Debouncer::new();
        debouncer.record(PathBuf::from("/root/a"), WatchOp::Write, false);
        debouncer.record(PathBuf::from("/root/b"), WatchOp::Write, false);
        assert_eq!(drain_all(&debouncer).len(), 2);
    }

    #[test]
    fn test_clear_drops_pending() {
        let debouncer = Debouncer::new();
        debouncer.record(PathBuf::from("/root/a"), WatchOp::Write, false);
        debouncer.clear();
        assert!(drain_all(&debouncer).is_empty());
    }
}
