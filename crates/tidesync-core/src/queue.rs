//! Retry scheduling for the operation queue.

use crate::config::priority;
use chrono::Duration;
use tidesync_watch::WatchOp;

/// Delay before retry number `retry_count` (1-based):
/// `base × 2^(retry_count - 1)`, capped at `max`.
#[must_use]
pub fn backoff_delay(retry_count: i64, base_secs: u64, max_secs: u64) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, 32) as u32;
    let factor = 1u64 << exponent;
    let seconds = base_secs.saturating_mul(factor).min(max_secs);
    Duration::seconds(seconds as i64)
}

/// Queue priority for a local filesystem change.
#[must_use]
pub fn priority_for(op: WatchOp) -> i64 {
    match op {
        WatchOp::Remove => priority::DELETE,
        WatchOp::Rename => priority::RENAME,
        WatchOp::Create => priority::CREATE,
        WatchOp::Write | WatchOp::Chmod => priority::MODIFY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        // base 5 s: 5, 10, 20, 40 ...
        assert_eq!(backoff_delay(1, 5, 300).num_seconds(), 5);
        assert_eq!(backoff_delay(2, 5, 300).num_seconds(), 10);
        assert_eq!(backoff_delay(3, 5, 300).num_seconds(), 20);
        assert_eq!(backoff_delay(4, 5, 300).num_seconds(), 40);
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff_delay(10, 5, 300).num_seconds(), 300);
        assert_eq!(backoff_delay(60, 5, 300).num_seconds(), 300);
    }

    #[test]
    fn test_backoff_degenerate_counts() {
        assert_eq!(backoff_delay(0, 5, 300).num_seconds(), 5);
        assert_eq!(backoff_delay(-3, 5, 300).num_seconds(), 5);
    }

    #[test]
    fn test_priorities_follow_change_kind() {
        assert_eq!(priority_for(WatchOp::Remove), 100);
        assert_eq!(priority_for(WatchOp::Rename), 90);
        assert_eq!(priority_for(WatchOp::Create), 80);
        assert_eq!(priority_for(WatchOp::Write), 60);
    }
}
