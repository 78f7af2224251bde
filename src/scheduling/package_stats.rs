//! Per-package concurrency accounting
//!
//! Caps concurrent running+staged jobs per (user, package), separately for
//! expedited and regular work, so a single app cannot monopolize the slot
//! pool. Entries are created lazily on the first stage or start and
//! deleted once every counter returns to zero.

use super::types::{Bias, Job, UserId};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Running/staged counts for one (user, package)
#[derive(Debug, Default, Clone)]
pub struct PackageStats {
    pub num_running_ej: usize,
    pub num_running_regular: usize,
    pub num_staged_ej: usize,
    pub num_staged_regular: usize,
}

impl PackageStats {
    fn adjust_running(&mut self, for_ej: bool, increment: bool) {
        let counter = if for_ej {
            &mut self.num_running_ej
        } else {
            &mut self.num_running_regular
        };
        if increment {
            *counter += 1;
        } else if *counter == 0 {
            warn!("package running count already 0 on decrement (ej={for_ej})");
        } else {
            *counter -= 1;
        }
    }

    fn adjust_staged(&mut self, for_ej: bool, increment: bool) {
        let counter = if for_ej {
            &mut self.num_staged_ej
        } else {
            &mut self.num_staged_regular
        };
        if increment {
            *counter += 1;
        } else if *counter == 0 {
            warn!("package staged count already 0 on decrement (ej={for_ej})");
        } else {
            *counter -= 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.num_running_ej == 0
            && self.num_running_regular == 0
            && self.num_staged_ej == 0
            && self.num_staged_regular == 0
    }
}

/// Map of live [`PackageStats`] plus the per-package limits
#[derive(Debug)]
pub struct PackageStatsTracker {
    stats: HashMap<(UserId, String), PackageStats>,
    limit_ej: usize,
    limit_regular: usize,
}

impl PackageStatsTracker {
    pub fn new(limit_ej: usize, limit_regular: usize) -> Self {
        Self {
            stats: HashMap::new(),
            limit_ej,
            limit_regular,
        }
    }

    pub fn set_limits(&mut self, limit_ej: usize, limit_regular: usize) {
        self.limit_ej = limit_ej;
        self.limit_regular = limit_regular;
    }

    pub fn adjust_staged(&mut self, user_id: UserId, package: &str, for_ej: bool, increment: bool) {
        if increment {
            self.entry(user_id, package).adjust_staged(for_ej, true);
        } else if let Some(stats) = self.stats.get_mut(&(user_id, package.to_string())) {
            stats.adjust_staged(for_ej, false);
            self.maybe_remove(user_id, package);
        }
    }

    pub fn adjust_running(&mut self, user_id: UserId, package: &str, for_ej: bool, increment: bool) {
        if increment {
            self.entry(user_id, package).adjust_running(for_ej, true);
        } else if let Some(stats) = self.stats.get_mut(&(user_id, package.to_string())) {
            stats.adjust_running(for_ej, false);
            self.maybe_remove(user_id, package);
        }
    }

    /// A staged job was confirmed started by the runner
    pub fn on_job_started(&mut self, user_id: UserId, package: &str, for_ej: bool) {
        let stats = self.entry(user_id, package);
        stats.adjust_staged(for_ej, false);
        stats.adjust_running(for_ej, true);
    }

    /// Decide whether one more job of this app may occupy a slot.
    ///
    /// `load` is the current pending+running total; the cap only engages
    /// once the pool as a whole is contended, and never applies to apps
    /// evaluated at TOP bias.
    pub fn is_package_limited(&self, job: &Job, load: usize, cfg_max_total: usize) -> bool {
        if job.last_evaluated_bias >= Bias::TopApp {
            return false;
        }
        if load < cfg_max_total {
            return false;
        }
        let Some(stats) = self
            .stats
            .get(&(job.source_user_id, job.source_package.clone()))
        else {
            return false;
        };
        if job.should_treat_as_expedited() {
            stats.num_running_ej + stats.num_staged_ej >= self.limit_ej
        } else {
            stats.num_running_regular + stats.num_staged_regular >= self.limit_regular
        }
    }

    /// Drop all staged counts after an assignment pass has settled
    pub fn reset_staging(&mut self) {
        for stats in self.stats.values_mut() {
            if stats.num_staged_ej > 0 || stats.num_staged_regular > 0 {
                debug!("clearing leftover staged counts after assignment pass");
            }
            stats.num_staged_ej = 0;
            stats.num_staged_regular = 0;
        }
        self.stats.retain(|_, s| !s.is_empty());
    }

    pub fn get(&self, user_id: UserId, package: &str) -> Option<&PackageStats> {
        self.stats.get(&(user_id, package.to_string()))
    }

    fn entry(&mut self, user_id: UserId, package: &str) -> &mut PackageStats {
        self.stats
            .entry((user_id, package.to_string()))
            .or_default()
    }

    fn maybe_remove(&mut self, user_id: UserId, package: &str) {
        let key = (user_id, package.to_string());
        if self.stats.get(&key).is_some_and(|s| s.is_empty()) {
            self.stats.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::types::JobInfo;

    fn job(uid: i32, user_id: i32, package: &str, expedited: bool) -> Job {
        let mut info = JobInfo::new(1, "com.example/.Service");
        info.expedited = expedited;
        Job::new(info, uid, user_id, package, None, 0)
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut tracker = PackageStatsTracker::new(3, 8);
        tracker.adjust_staged(0, "com.example", false, true);
        assert!(tracker.get(0, "com.example").is_some());
        tracker.on_job_started(0, "com.example", false);
        tracker.adjust_running(0, "com.example", false, false);
        assert!(
            tracker.get(0, "com.example").is_none(),
            "entry must be removed once all counters are zero"
        );
    }

    #[test]
    fn test_limit_requires_pool_contention() {
        let mut tracker = PackageStatsTracker::new(1, 1);
        tracker.adjust_staged(0, "com.example", true, true);
        let j = job(10_001, 0, "com.example", true);
        // Plenty of global headroom: never limited.
        assert!(!tracker.is_package_limited(&j, 3, 16));
        // Pool contended: the single staged EJ hits the cap.
        assert!(tracker.is_package_limited(&j, 16, 16));
    }

    #[test]
    fn test_top_bias_never_limited() {
        let mut tracker = PackageStatsTracker::new(1, 1);
        tracker.adjust_staged(0, "com.example", true, true);
        let mut j = job(10_001, 0, "com.example", true);
        j.last_evaluated_bias = Bias::TopApp;
        assert!(!tracker.is_package_limited(&j, 16, 16));
    }

    #[test]
    fn test_ej_and_regular_tracked_separately() {
        let mut tracker = PackageStatsTracker::new(1, 8);
        tracker.adjust_running(0, "com.example", true, true);
        let ej = job(10_001, 0, "com.example", true);
        let regular = job(10_001, 0, "com.example", false);
        assert!(tracker.is_package_limited(&ej, 16, 16));
        assert!(!tracker.is_package_limited(&regular, 16, 16));
    }

    #[test]
    fn test_unknown_package_never_limited() {
        let tracker = PackageStatsTracker::new(1, 1);
        let j = job(10_001, 0, "com.example", false);
        assert!(!tracker.is_package_limited(&j, 16, 16));
    }

    #[test]
    fn test_reset_staging_drops_empty_entries() {
        let mut tracker = PackageStatsTracker::new(3, 8);
        tracker.adjust_staged(0, "com.a", false, true);
        tracker.adjust_staged(0, "com.b", true, true);
        tracker.adjust_running(0, "com.b", false, true);
        tracker.reset_staging();
        assert!(tracker.get(0, "com.a").is_none());
        let b = tracker.get(0, "com.b").unwrap();
        assert_eq!(b.num_staged_ej, 0);
        assert_eq!(b.num_running_regular, 1);
    }
}
