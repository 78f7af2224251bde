//! External collaborator seams
//!
//! The core never evaluates constraints, binds to application services or
//! persists jobs itself; those concerns are injected through the traits
//! here. All trait calls happen on the scheduler task, so the traits are
//! synchronous; asynchronous collaborators complete by posting events back
//! through the service handle.

use super::types::{InternalStopReason, Job, JobKey, StopReason, Uid, UserId, WorkType};
use std::collections::HashMap;

/// Executes jobs on behalf of the scheduler.
///
/// `start` returns whether the runner accepted the job; a refusal is a
/// transient failure and leaves the job pending. Completion is *not*
/// signalled through this trait: the runner posts a job-finished event
/// back to the scheduler when the work ends or a requested cancel takes
/// effect.
pub trait JobRunner {
    fn start(&mut self, job: &Job, work_type: WorkType) -> bool;

    fn cancel(
        &mut self,
        job: &Job,
        reason: StopReason,
        internal_reason: InternalStopReason,
        debug_reason: &str,
    );
}

/// Evaluates the constraints attached to a job (network, charging, idle,
/// storage, time, content observers).
pub trait ConstraintEvaluator {
    fn is_ready(&self, job: &Job, now_ms: i64) -> bool;

    /// Called immediately before the runner is asked to start the job
    fn prepare(&mut self, job: &Job);

    /// Inverse of `prepare`, called when a staged start is abandoned or
    /// the job finishes
    fn unprepare(&mut self, job: &Job);

    /// Execution-time quota remaining for this job, if the evaluator
    /// tracks one. Bounds the maximum runtime together with the global
    /// free-quota ceiling.
    fn max_runtime_ms(&self, _job: &Job) -> Option<i64> {
        None
    }
}

/// Storage of scheduled jobs. The core only needs list/add/remove; the
/// persistence format is entirely the implementation's business.
pub trait JobStore {
    fn add(&mut self, job: Job);
    fn remove(&mut self, key: &JobKey) -> Option<Job>;
    fn get(&self, key: &JobKey) -> Option<&Job>;
    fn get_mut(&mut self, key: &JobKey) -> Option<&mut Job>;
    fn for_each(&self, f: &mut dyn FnMut(&Job));
    fn count_for_uid(&self, uid: Uid) -> usize;
}

/// Rate limiter for schedule() API calls
pub trait RateLimiter {
    fn is_within_quota(&mut self, user_id: UserId, package: &str, tag: &str, now_ms: i64)
        -> bool;
    fn note_event(&mut self, user_id: UserId, package: &str, tag: &str, now_ms: i64);
}

/// Hash-map backed [`JobStore`] used by tests and the demo binary
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: HashMap<JobKey, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobStore for InMemoryJobStore {
    fn add(&mut self, job: Job) {
        self.jobs.insert(job.key(), job);
    }

    fn remove(&mut self, key: &JobKey) -> Option<Job> {
        self.jobs.remove(key)
    }

    fn get(&self, key: &JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    fn get_mut(&mut self, key: &JobKey) -> Option<&mut Job> {
        self.jobs.get_mut(key)
    }

    fn for_each(&self, f: &mut dyn FnMut(&Job)) {
        for job in self.jobs.values() {
            f(job);
        }
    }

    fn count_for_uid(&self, uid: Uid) -> usize {
        self.jobs.keys().filter(|k| k.uid == uid).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::types::JobInfo;

    #[test]
    fn test_in_memory_store_replaces_on_same_key() {
        let mut store = InMemoryJobStore::new();
        let first = Job::new(JobInfo::new(1, "com.example/.A"), 10_001, 0, "com.example", None, 0);
        let mut second_info = JobInfo::new(1, "com.example/.B");
        second_info.expedited = true;
        let second = Job::new(second_info, 10_001, 0, "com.example", None, 5);
        store.add(first);
        store.add(second);
        assert_eq!(store.len(), 1);
        let stored = store.get(&JobKey::new(10_001, 1)).unwrap();
        assert!(stored.info.expedited);
    }

    #[test]
    fn test_count_for_uid() {
        let mut store = InMemoryJobStore::new();
        for job_id in 0..3 {
            store.add(Job::new(
                JobInfo::new(job_id, "com.example/.A"),
                10_001,
                0,
                "com.example",
                None,
                0,
            ));
        }
        store.add(Job::new(
            JobInfo::new(0, "com.other/.A"),
            10_002,
            0,
            "com.other",
            None,
            0,
        ));
        assert_eq!(store.count_for_uid(10_001), 3);
        assert_eq!(store.count_for_uid(10_002), 1);
        assert_eq!(store.count_for_uid(10_003), 0);
    }
}
