//! Grace-period tracking for user switches
//!
//! When the interactive user switches, jobs of the previous user keep
//! their foreground-user classification for a short window so in-flight
//! work is not immediately demoted to background-user accounting.

use super::types::UserId;
use tracing::debug;

/// The system owner user, always treated as foreground-equivalent
pub const PRIMARY_USER_ID: UserId = 0;

#[derive(Debug)]
pub struct GracePeriodTracker {
    current_user: UserId,
    /// Previous current user and the elapsed time of the switch away
    previous_user: Option<(UserId, i64)>,
    grace_period_ms: i64,
}

impl GracePeriodTracker {
    pub fn new(grace_period_ms: i64) -> Self {
        Self {
            current_user: PRIMARY_USER_ID,
            previous_user: None,
            grace_period_ms,
        }
    }

    pub fn current_user(&self) -> UserId {
        self.current_user
    }

    pub fn on_user_switch(&mut self, new_user_id: UserId, now_ms: i64) {
        if new_user_id == self.current_user {
            return;
        }
        debug!(
            "user switch {} -> {}, grace period {}ms",
            self.current_user, new_user_id, self.grace_period_ms
        );
        self.previous_user = Some((self.current_user, now_ms));
        self.current_user = new_user_id;
    }

    pub fn on_user_removed(&mut self, user_id: UserId) {
        if self
            .previous_user
            .is_some_and(|(prev, _)| prev == user_id)
        {
            self.previous_user = None;
        }
    }

    /// Whether jobs of this user currently classify as foreground-user
    /// work: the current user, the primary user, or the previous current
    /// user within the grace window after the switch.
    pub fn is_foreground_equivalent(&self, user_id: UserId, now_ms: i64) -> bool {
        if user_id == self.current_user || user_id == PRIMARY_USER_ID {
            return true;
        }
        self.previous_user
            .is_some_and(|(prev, switched_at)| {
                prev == user_id && now_ms - switched_at < self.grace_period_ms
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_and_primary_are_foreground() {
        let tracker = GracePeriodTracker::new(60_000);
        assert!(tracker.is_foreground_equivalent(PRIMARY_USER_ID, 0));
        let mut tracker = GracePeriodTracker::new(60_000);
        tracker.on_user_switch(10, 0);
        assert!(tracker.is_foreground_equivalent(10, 0));
        assert!(tracker.is_foreground_equivalent(PRIMARY_USER_ID, 0));
    }

    #[test]
    fn test_previous_user_keeps_grace_window() {
        let mut tracker = GracePeriodTracker::new(60_000);
        tracker.on_user_switch(10, 0);
        tracker.on_user_switch(11, 100_000);
        assert!(tracker.is_foreground_equivalent(10, 100_000 + 59_999));
        assert!(!tracker.is_foreground_equivalent(10, 100_000 + 60_000));
    }

    #[test]
    fn test_removed_user_loses_grace() {
        let mut tracker = GracePeriodTracker::new(60_000);
        tracker.on_user_switch(10, 0);
        tracker.on_user_switch(11, 1_000);
        tracker.on_user_removed(10);
        assert!(!tracker.is_foreground_equivalent(10, 1_001));
    }

    #[test]
    fn test_unrelated_user_is_background() {
        let mut tracker = GracePeriodTracker::new(60_000);
        tracker.on_user_switch(11, 0);
        assert!(!tracker.is_foreground_equivalent(12, 0));
    }
}
