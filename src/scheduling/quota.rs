//! Schedule-call rate limiting
//!
//! Persisted schedule() calls from an app for its own package are counted
//! against a sliding window; once the window fills, further calls are
//! rejected until old events age out. This is the crate's default
//! [`RateLimiter`] implementation; deployments with a platform-wide quota
//! service can substitute their own.

use super::external::RateLimiter;
use super::types::UserId;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Sliding-window counter keyed by (user, package, tag)
#[derive(Debug)]
pub struct ScheduleQuotaTracker {
    enabled: bool,
    max_count: usize,
    window_ms: i64,
    events: HashMap<(UserId, String, String), VecDeque<i64>>,
}

impl ScheduleQuotaTracker {
    pub fn new(enabled: bool, max_count: usize, window_ms: i64) -> Self {
        Self {
            enabled,
            max_count,
            window_ms,
            events: HashMap::new(),
        }
    }

    fn prune(window_ms: i64, now_ms: i64, events: &mut VecDeque<i64>) {
        while events.front().is_some_and(|&at| now_ms - at >= window_ms) {
            events.pop_front();
        }
    }
}

impl RateLimiter for ScheduleQuotaTracker {
    fn is_within_quota(&mut self, user_id: UserId, package: &str, tag: &str, now_ms: i64) -> bool {
        if !self.enabled {
            return true;
        }
        let key = (user_id, package.to_string(), tag.to_string());
        let Some(events) = self.events.get_mut(&key) else {
            return true;
        };
        Self::prune(self.window_ms, now_ms, events);
        if events.is_empty() {
            self.events.remove(&key);
            return true;
        }
        events.len() < self.max_count
    }

    fn note_event(&mut self, user_id: UserId, package: &str, tag: &str, now_ms: i64) {
        if !self.enabled {
            return;
        }
        let key = (user_id, package.to_string(), tag.to_string());
        let events = self.events.entry(key).or_default();
        Self::prune(self.window_ms, now_ms, events);
        events.push_back(now_ms);
        if events.len() == self.max_count {
            debug!(
                "schedule quota reached for user {} package {} tag {}",
                user_id, package, tag
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_fills_and_recovers() {
        let mut tracker = ScheduleQuotaTracker::new(true, 3, 60_000);
        for _ in 0..3 {
            assert!(tracker.is_within_quota(0, "com.example", "sync", 0));
            tracker.note_event(0, "com.example", "sync", 0);
        }
        assert!(!tracker.is_within_quota(0, "com.example", "sync", 0));
        // Events age out of the window.
        assert!(tracker.is_within_quota(0, "com.example", "sync", 60_000));
    }

    #[test]
    fn test_disabled_tracker_never_limits() {
        let mut tracker = ScheduleQuotaTracker::new(false, 1, 60_000);
        tracker.note_event(0, "com.example", "sync", 0);
        tracker.note_event(0, "com.example", "sync", 0);
        assert!(tracker.is_within_quota(0, "com.example", "sync", 0));
    }

    #[test]
    fn test_quota_is_keyed_per_tag() {
        let mut tracker = ScheduleQuotaTracker::new(true, 1, 60_000);
        tracker.note_event(0, "com.example", "sync", 0);
        assert!(!tracker.is_within_quota(0, "com.example", "sync", 0));
        assert!(tracker.is_within_quota(0, "com.example", "upload", 0));
        assert!(tracker.is_within_quota(1, "com.example", "sync", 0));
    }
}
