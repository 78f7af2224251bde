//! Readiness and admission checks
//!
//! Decides whether a scheduled job may enter the pending queue. Constraint
//! evaluation is external; this layer coordinates it with user state,
//! backup state, restriction policies and queue membership.

use super::scheduler::Scheduler;
use super::types::{Bias, Job};
use tracing::trace;

/// A policy that can hold back jobs of low-importance apps (thermal
/// throttling and the like). Restrictions never apply to jobs whose
/// evaluated bias is at foreground-service level or above.
pub trait JobRestriction {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn would_restrict(&self, job: &Job) -> bool;
}

impl Scheduler {
    /// Whether a job is currently allowed to move toward execution.
    ///
    /// With `reject_active` set, jobs already pending or running fail the
    /// check; the readiness sweep clears it so pending jobs keep their
    /// queue position across sweeps.
    pub(crate) fn is_ready_to_be_executed(
        &self,
        job: &Job,
        reject_active: bool,
        now_ms: i64,
    ) -> bool {
        let key = job.key();
        if !self.constraints.is_ready(job, now_ms) {
            trace!("job {} constraints not satisfied", key);
            return false;
        }
        if self.store.get(&key).is_none() {
            return false;
        }
        if !self.started_users.contains(&job.source_user_id) {
            trace!("job {} source user {} not started", key, job.source_user_id);
            return false;
        }
        if self.backing_up.contains(&job.source_uid) {
            trace!("job {} uid is backing up", key);
            return false;
        }
        if self.check_restricted(job).is_some() {
            return false;
        }
        if reject_active && (self.pending.contains(&key) || self.concurrency.is_running(&key)) {
            return false;
        }
        if job.info.service.is_empty() || self.bad_uids.contains(&job.source_uid) {
            trace!("job {} target component unavailable", key);
            return false;
        }
        true
    }

    /// First restriction holding this job back, if any. Foreground-service
    /// bias and above short-circuits: restrictions never apply there.
    pub(crate) fn check_restricted(&self, job: &Job) -> Option<&'static str> {
        if self.evaluate_bias(job.source_uid) >= Bias::FgService {
            return None;
        }
        self.restrictions
            .iter()
            .find(|r| r.would_restrict(job))
            .map(|r| r.name())
    }
}
