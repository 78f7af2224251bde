//! Scheduler core: job lifecycle, event sinks and rescheduling
//!
//! The scheduler owns the job store, the pending queue and the
//! recently-completed history, receives every external event, and drives
//! the concurrency manager. All state is mutated on a single task; every
//! entry point takes the current elapsed time as a parameter so the core
//! stays deterministic and clock-free.

use super::concurrency::ConcurrencyManager;
use super::events::{DeviceEvent, TimerRequest};
use super::external::{ConstraintEvaluator, JobRunner, JobStore, RateLimiter};
use super::grace_period::GracePeriodTracker;
use super::pending_queue::PendingQueue;
use super::readiness::JobRestriction;
use super::types::{
    BackoffPolicy, Bias, Bucket, InternalStopReason, Job, JobInfo, JobKey, JobPriority, StopReason,
    Uid, UserId, WorkType, NO_LATEST_RUN_TIME,
};
use crate::config::defaults::{
    COMPLETED_HISTORY_SIZE, MAX_JOBS_PER_APP, MAX_PERIOD_MS, MIN_FLEX_MS, MIN_PERIOD_MS,
    PERIODIC_WINDOW_BUFFER_MS, RESTRICTED_BUCKET_EJ_GUARANTEE_CAP_MS,
};
use crate::config::SchedulerSettings;
use crate::errors::{ScheduleError, ScheduleResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

/// Read-only view of a scheduled job, for API callers and dumps
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub uid: Uid,
    pub job_id: i32,
    pub user_id: UserId,
    pub package: String,
    pub tag: Option<String>,
    pub periodic: bool,
    pub expedited: bool,
    pub earliest_run_time_ms: i64,
    pub latest_run_time_ms: i64,
    pub num_failures: u32,
    pub bias: Bias,
}

impl JobSnapshot {
    fn from_job(job: &Job) -> Self {
        Self {
            uid: job.source_uid,
            job_id: job.info.job_id,
            user_id: job.source_user_id,
            package: job.source_package.clone(),
            tag: job.tag.clone(),
            periodic: job.info.periodic,
            expedited: job.info.expedited,
            earliest_run_time_ms: job.earliest_run_time_ms,
            latest_run_time_ms: job.latest_run_time_ms,
            num_failures: job.num_failures,
            bias: job.last_evaluated_bias,
        }
    }
}

/// One entry of the completed-history ring
#[derive(Debug, Clone, Serialize)]
pub struct CompletedJobRecord {
    pub uid: Uid,
    pub job_id: i32,
    pub package: String,
    pub work_type: WorkType,
    pub completed_at_ms: i64,
}

/// Fixed-size ring of the most recently completed jobs, purely for
/// introspection
#[derive(Debug, Default)]
pub struct CompletedHistory {
    ring: VecDeque<CompletedJobRecord>,
}

impl CompletedHistory {
    pub fn push(&mut self, record: CompletedJobRecord) {
        if self.ring.len() == COMPLETED_HISTORY_SIZE {
            self.ring.pop_front();
        }
        self.ring.push_back(record);
    }

    pub fn entries(&self) -> impl Iterator<Item = &CompletedJobRecord> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Introspection snapshot, produced on the scheduler task
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub generated_at: DateTime<Utc>,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub running_by_type: HashMap<String, usize>,
    pub num_dropped_contexts: u64,
    pub recently_completed: Vec<CompletedJobRecord>,
}

/// The scheduler core. See the module docs for the threading model.
pub struct Scheduler {
    pub(crate) settings: SchedulerSettings,
    pub(crate) store: Box<dyn JobStore + Send>,
    pub(crate) runner: Box<dyn JobRunner + Send>,
    pub(crate) constraints: Box<dyn ConstraintEvaluator + Send>,
    pub(crate) rate_limiter: Box<dyn RateLimiter + Send>,
    pub(crate) pending: PendingQueue,
    pub(crate) concurrency: ConcurrencyManager,
    pub(crate) grace: GracePeriodTracker,
    pub(crate) restrictions: Vec<Box<dyn JobRestriction + Send>>,
    pub(crate) uid_bias: HashMap<Uid, Bias>,
    pub(crate) backing_up: HashSet<Uid>,
    pub(crate) started_users: HashSet<UserId>,
    pub(crate) bad_uids: HashSet<Uid>,
    pub(crate) history: CompletedHistory,
    pub(crate) timer_requests: Vec<TimerRequest>,
    next_instance_id: u64,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        store: Box<dyn JobStore + Send>,
        runner: Box<dyn JobRunner + Send>,
        constraints: Box<dyn ConstraintEvaluator + Send>,
        rate_limiter: Box<dyn RateLimiter + Send>,
    ) -> Self {
        let concurrency = ConcurrencyManager::new(&settings);
        let grace = GracePeriodTracker::new(settings.user_grace_period_ms);
        let mut started_users = HashSet::new();
        started_users.insert(super::grace_period::PRIMARY_USER_ID);
        Self {
            settings,
            store,
            runner,
            constraints,
            rate_limiter,
            pending: PendingQueue::new(),
            concurrency,
            grace,
            restrictions: Vec::new(),
            uid_bias: HashMap::new(),
            backing_up: HashSet::new(),
            started_users,
            bad_uids: HashSet::new(),
            history: CompletedHistory::default(),
            timer_requests: Vec::new(),
            next_instance_id: 1,
        }
    }

    fn next_instance(&mut self) -> u64 {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        id
    }

    /// Install a job restriction (thermal and the like); consulted by the
    /// readiness check for jobs below foreground-service bias.
    pub fn add_restriction(&mut self, restriction: Box<dyn JobRestriction + Send>) {
        self.restrictions.push(restriction);
    }

    /// Timers the core wants armed; the caller owns the clock
    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timer_requests)
    }

    // ------------------------------------------------------------------
    // Inbound API
    // ------------------------------------------------------------------

    /// Schedule a job, atomically replacing any existing job with the same
    /// `(uid, job_id)`.
    pub fn schedule(
        &mut self,
        info: JobInfo,
        uid: Uid,
        package: impl Into<String>,
        user_id: UserId,
        tag: Option<String>,
        now_ms: i64,
    ) -> ScheduleResult<()> {
        let package = package.into();
        if info.service.is_empty() {
            return Err(ScheduleError::invalid("no target component"));
        }
        if uid < 0 {
            return Err(ScheduleError::invalid("invalid calling uid"));
        }
        if self.bad_uids.contains(&uid) {
            return Err(ScheduleError::invalid("app is not permitted to start"));
        }

        if info.persisted {
            let tag_str = tag.as_deref().unwrap_or("");
            if !self
                .rate_limiter
                .is_within_quota(user_id, &package, tag_str, now_ms)
            {
                if info.debuggable {
                    error!(
                        "schedule() call quota exceeded for {} (user {}), rejecting job {}",
                        package, user_id, info.job_id
                    );
                } else {
                    debug!(
                        "schedule() call quota exceeded for {} (user {}), rejecting job {}",
                        package, user_id, info.job_id
                    );
                }
                return Err(ScheduleError::QuotaExceeded { user_id, package });
            }
            self.rate_limiter
                .note_event(user_id, &package, tag_str, now_ms);
        }

        let key = JobKey::new(uid, info.job_id);
        let replacing = self.store.get(&key).is_some();
        if !replacing {
            let count = self.store.count_for_uid(uid);
            if count >= MAX_JOBS_PER_APP {
                return Err(ScheduleError::TooManyJobs {
                    uid,
                    count,
                    max: MAX_JOBS_PER_APP,
                });
            }
        }

        if replacing {
            // Atomic replace: cancel then insert.
            self.cancel_job_internal(
                key,
                StopReason::Cancelled,
                InternalStopReason::CancelledByApp,
                "job rescheduled by app",
            );
        }
        let mut job = Job::new(info, uid, user_id, package, tag, now_ms);
        job.instance_id = self.next_instance();
        info!("scheduled job {} ({})", key, job.source_package);
        self.store.add(job);

        self.maybe_enqueue_job(key, now_ms);
        Ok(())
    }

    /// Enqueue work against a job. If the job already exists it is kept
    /// as-is (its failure history survives) and only re-evaluated for
    /// readiness; otherwise this behaves like an unthrottled schedule().
    pub fn enqueue(
        &mut self,
        info: JobInfo,
        uid: Uid,
        package: impl Into<String>,
        user_id: UserId,
        tag: Option<String>,
        now_ms: i64,
    ) -> ScheduleResult<()> {
        let package = package.into();
        if info.service.is_empty() {
            return Err(ScheduleError::invalid("no target component"));
        }
        let key = JobKey::new(uid, info.job_id);
        if self.store.get(&key).is_none() {
            let count = self.store.count_for_uid(uid);
            if count >= MAX_JOBS_PER_APP {
                return Err(ScheduleError::TooManyJobs {
                    uid,
                    count,
                    max: MAX_JOBS_PER_APP,
                });
            }
            let mut job = Job::new(info, uid, user_id, package, tag, now_ms);
            job.instance_id = self.next_instance();
            debug!("enqueue created job {}", key);
            self.store.add(job);
        } else {
            debug!("enqueue refreshed existing job {}", key);
        }
        self.maybe_enqueue_job(key, now_ms);
        Ok(())
    }

    /// Cancel one job
    pub fn cancel(&mut self, uid: Uid, job_id: i32, debug_reason: &str, now_ms: i64) {
        let key = JobKey::new(uid, job_id);
        self.cancel_job_internal(
            key,
            StopReason::Cancelled,
            InternalStopReason::CancelledByApp,
            debug_reason,
        );
        self.assign_jobs_to_contexts(now_ms);
    }

    /// Cancel every job belonging to a uid
    pub fn cancel_for_uid(&mut self, uid: Uid, debug_reason: &str, now_ms: i64) {
        for key in self.keys_matching(|job| job.source_uid == uid) {
            self.cancel_job_internal(
                key,
                StopReason::Cancelled,
                InternalStopReason::CancelledByApp,
                debug_reason,
            );
        }
        self.assign_jobs_to_contexts(now_ms);
    }

    /// Cancel every job belonging to a (uid, package)
    pub fn cancel_for_package(&mut self, uid: Uid, package: &str, debug_reason: &str, now_ms: i64) {
        for key in
            self.keys_matching(|job| job.source_uid == uid && job.source_package == package)
        {
            self.cancel_job_internal(
                key,
                StopReason::User,
                InternalStopReason::PackageRemoved,
                debug_reason,
            );
        }
        self.assign_jobs_to_contexts(now_ms);
    }

    /// Cancel every job belonging to a user
    pub fn cancel_for_user(&mut self, user_id: UserId, now_ms: i64) {
        for key in self.keys_matching(|job| job.source_user_id == user_id) {
            self.cancel_job_internal(
                key,
                StopReason::User,
                InternalStopReason::UserStopped,
                "user removed",
            );
        }
        self.assign_jobs_to_contexts(now_ms);
    }

    /// All scheduled jobs of a uid
    pub fn get_pending_jobs(&self, uid: Uid) -> Vec<JobSnapshot> {
        let mut snapshots = Vec::new();
        self.store.for_each(&mut |job| {
            if job.source_uid == uid {
                snapshots.push(JobSnapshot::from_job(job));
            }
        });
        snapshots.sort_by_key(|s| s.job_id);
        snapshots
    }

    pub fn get_pending_job(&self, uid: Uid, job_id: i32) -> Option<JobSnapshot> {
        self.store
            .get(&JobKey::new(uid, job_id))
            .map(JobSnapshot::from_job)
    }

    /// Currently executing jobs (system callers only)
    pub fn get_started_jobs(&self) -> Vec<JobSnapshot> {
        self.concurrency
            .running_keys()
            .iter()
            .filter_map(|key| self.store.get(key).map(JobSnapshot::from_job))
            .collect()
    }

    /// Introspection snapshot
    pub fn stats(&self) -> SchedulerStats {
        let mut running_by_type = HashMap::new();
        for wt in WorkType::iter() {
            let count = self.concurrency.tracker.running_count(wt);
            if count > 0 {
                running_by_type.insert(wt.to_string(), count);
            }
        }
        SchedulerStats {
            generated_at: Utc::now(),
            pending_jobs: self.pending.len(),
            running_jobs: self.concurrency.running_count(),
            running_by_type,
            num_dropped_contexts: self.concurrency.num_dropped_contexts(),
            recently_completed: self.history.entries().cloned().collect(),
        }
    }

    // ------------------------------------------------------------------
    // Event sinks
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: DeviceEvent, now_ms: i64) {
        debug!("handling event {:?}", event);
        match event {
            DeviceEvent::Interactive(on) => self.on_interactive_changed(on, now_ms),
            DeviceEvent::MemoryTrim(level) => {
                self.concurrency.set_memory_trim(level);
                self.assign_jobs_to_contexts(now_ms);
            }
            DeviceEvent::DeviceIdle(idle) => self.on_device_idle_changed(idle, now_ms),
            DeviceEvent::PowerSave(enabled) => self.on_power_save_changed(enabled, now_ms),
            DeviceEvent::UidProcState { uid, state } => {
                let bias = state.bias();
                let previous = self.uid_bias.insert(uid, bias);
                if previous != Some(bias) {
                    self.assign_jobs_to_contexts(now_ms);
                }
            }
            DeviceEvent::UidActive { .. } | DeviceEvent::UidIdle { .. } => {
                // Active/idle transitions feed the external batching
                // pipeline; the core only re-evaluates readiness.
                self.check_jobs(now_ms);
            }
            DeviceEvent::UidGone { uid, disabled } => {
                self.uid_bias.remove(&uid);
                if disabled {
                    self.bad_uids.insert(uid);
                    self.cancel_for_uid(uid, "app disabled", now_ms);
                } else {
                    self.check_jobs(now_ms);
                }
            }
            DeviceEvent::UserStarted { user_id } => {
                self.started_users.insert(user_id);
                self.check_jobs(now_ms);
            }
            DeviceEvent::UserStopped { user_id } => {
                self.started_users.remove(&user_id);
                self.cancel_for_user(user_id, now_ms);
            }
            DeviceEvent::UserSwitched { user_id } => {
                self.grace.on_user_switch(user_id, now_ms);
                self.timer_requests.push(TimerRequest::GraceExpiry {
                    fire_at_ms: now_ms + self.settings.user_grace_period_ms,
                });
                self.assign_jobs_to_contexts(now_ms);
            }
            DeviceEvent::UserRemoved { user_id } => {
                self.grace.on_user_removed(user_id);
                self.started_users.remove(&user_id);
                self.cancel_for_user(user_id, now_ms);
            }
            DeviceEvent::PackageAdded { uid, .. } => {
                self.bad_uids.remove(&uid);
                self.check_jobs(now_ms);
            }
            DeviceEvent::PackageChanged { .. } => self.check_jobs(now_ms),
            DeviceEvent::PackageRemoved { package, uid } => {
                self.cancel_for_package(uid, &package, "package removed", now_ms);
            }
            DeviceEvent::PackageRestarted { package, uid } => {
                self.cancel_for_package(uid, &package, "package force-stopped", now_ms);
            }
            DeviceEvent::BackingUp { uid, active } => {
                if active {
                    self.backing_up.insert(uid);
                } else {
                    self.backing_up.remove(&uid);
                }
                self.check_jobs(now_ms);
            }
        }
    }

    /// A previously armed timer fired
    pub fn on_timer(&mut self, request: TimerRequest, now_ms: i64) {
        match request {
            TimerRequest::ScreenOffRamp { .. } => {
                if self.concurrency.screen_off_ramp_fired(now_ms, &self.settings) {
                    info!("screen-off adjustment delay elapsed, relaxing to screen-off config");
                    self.assign_jobs_to_contexts(now_ms);
                }
            }
            TimerRequest::MaxRuntime {
                key, started_at_ms, ..
            } => {
                self.on_max_runtime_elapsed(key, started_at_ms, now_ms);
            }
            TimerRequest::GraceExpiry { .. } => {
                self.assign_jobs_to_contexts(now_ms);
            }
        }
    }

    /// Sweep readiness and run an assignment pass. This is the CHECK_JOB
    /// control path every state-affecting event funnels into.
    pub fn check_jobs(&mut self, now_ms: i64) {
        self.maybe_queue_ready_jobs(now_ms);
        self.assign_jobs_to_contexts(now_ms);
    }

    /// The runner reported that a job finished (or a requested cancel took
    /// effect). `needs_reschedule` marks a failed run subject to backoff.
    pub fn on_job_finished(&mut self, key: JobKey, needs_reschedule: bool, now_ms: i64) {
        let Some(finished) = self.release_finished_slot(key, now_ms) else {
            warn!("finished callback for unknown job {}", key);
            return;
        };
        self.constraints_unprepare(key);
        self.history.push(CompletedJobRecord {
            uid: key.uid,
            job_id: key.job_id,
            package: finished.package.clone(),
            work_type: finished.work_type,
            completed_at_ms: now_ms,
        });

        // A job cancelled through the API has already left the store, and
        // an atomically replaced one left a *different* instance behind;
        // neither may be rescheduled off this completion.
        let stored = self
            .store
            .get(&key)
            .filter(|job| job.instance_id == finished.instance_id)
            .cloned();
        if let Some(job) = stored {
            if needs_reschedule {
                let mut next = reschedule_for_failure(&job, &self.settings, now_ms);
                next.instance_id = self.next_instance();
                debug!(
                    "job {} failed (attempt {}), next earliest run in {}ms",
                    key,
                    next.num_failures,
                    next.earliest_run_time_ms - now_ms
                );
                self.store.add(next);
            } else if job.info.periodic {
                let mut next = reschedule_for_periodic(&job, &self.settings, now_ms);
                next.instance_id = self.next_instance();
                debug!(
                    "periodic job {} re-windowed to [{}, {}]",
                    key, next.earliest_run_time_ms, next.latest_run_time_ms
                );
                self.store.add(next);
            } else {
                self.store.remove(&key);
            }
        }

        self.assign_on_completion(finished, now_ms);
        self.check_jobs(now_ms);
    }

    // ------------------------------------------------------------------
    // Readiness sweep
    // ------------------------------------------------------------------

    /// Move ready jobs into the pending queue and drop pending jobs that
    /// are no longer ready. Newly ready jobs append in sweep order.
    pub(crate) fn maybe_queue_ready_jobs(&mut self, now_ms: i64) {
        let mut keys: Vec<JobKey> = Vec::new();
        self.store.for_each(&mut |job| keys.push(job.key()));
        // The store iteration order is arbitrary; sweep oldest-first so
        // queue order is deterministic.
        keys.sort_by_key(|key| {
            let job = self.store.get(key);
            (job.map_or(i64::MAX, |j| j.enqueue_time_ms), key.uid, key.job_id)
        });

        for key in keys {
            if self.concurrency.is_running(&key) {
                continue;
            }
            let ready = self
                .store
                .get(&key)
                .is_some_and(|job| self.is_ready_to_be_executed(job, false, now_ms));
            if ready {
                if !self.pending.contains(&key) {
                    self.pending.add(key);
                }
            } else {
                self.pending.remove(&key);
            }
        }
    }

    /// Push a single job to the pending queue if it is ready, then run an
    /// assignment pass.
    fn maybe_enqueue_job(&mut self, key: JobKey, now_ms: i64) {
        let ready = self
            .store
            .get(&key)
            .is_some_and(|job| self.is_ready_to_be_executed(job, true, now_ms));
        if ready {
            self.pending.add(key);
            self.assign_jobs_to_contexts(now_ms);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn evaluate_bias(&self, uid: Uid) -> Bias {
        self.uid_bias.get(&uid).copied().unwrap_or(Bias::Default)
    }

    /// Minimum time a started job is guaranteed to run before policy may
    /// stop it
    pub(crate) fn min_execution_guarantee_ms(&self, job: &Job) -> i64 {
        if job.should_treat_as_expedited() {
            let guarantee = self.settings.runtime_min_ej_guarantee_ms;
            if job.info.bucket == Bucket::Restricted {
                guarantee.min(RESTRICTED_BUCKET_EJ_GUARANTEE_CAP_MS)
            } else {
                guarantee
            }
        } else if job.info.priority == JobPriority::High {
            self.settings.runtime_min_high_priority_guarantee_ms
        } else {
            self.settings.runtime_min_guarantee_ms
        }
    }

    /// Ceiling on a single run's execution time
    pub(crate) fn max_execution_time_ms(&self, job: &Job) -> i64 {
        let quota = self.constraints.max_runtime_ms(job).unwrap_or(i64::MAX);
        self.settings.runtime_free_quota_max_limit_ms.min(quota)
    }

    fn keys_matching(&self, mut predicate: impl FnMut(&Job) -> bool) -> Vec<JobKey> {
        let mut keys = Vec::new();
        self.store.for_each(&mut |job| {
            if predicate(job) {
                keys.push(job.key());
            }
        });
        keys
    }

    /// Remove a job everywhere: pending queue, runner (if running) and
    /// store. The job stays in the running set until the runner confirms
    /// the stop.
    pub(crate) fn cancel_job_internal(
        &mut self,
        key: JobKey,
        reason: StopReason,
        internal: InternalStopReason,
        debug_reason: &str,
    ) {
        self.pending.remove(&key);
        if self.concurrency.is_running(&key) {
            self.request_stop_running_job(key, reason, internal, debug_reason);
        }
        if self.store.remove(&key).is_some() {
            debug!("cancelled job {}: {}", key, debug_reason);
        }
    }

    fn constraints_unprepare(&mut self, key: JobKey) {
        if let Some(job) = self.store.get(&key) {
            let job = job.clone();
            self.constraints.unprepare(&job);
        }
    }
}

// ----------------------------------------------------------------------
// Reschedule derivations
// ----------------------------------------------------------------------

/// Derive the replacement for a failed job, applying its backoff policy
pub(crate) fn reschedule_for_failure(
    job: &Job,
    settings: &SchedulerSettings,
    now_ms: i64,
) -> Job {
    let attempts = job.num_failures + 1;
    let base = match job.info.backoff_policy {
        BackoffPolicy::Linear => {
            let initial = job.info.initial_backoff_ms.max(settings.min_linear_backoff_ms);
            initial.saturating_mul(attempts as i64)
        }
        BackoffPolicy::Exponential => {
            let initial = job.info.initial_backoff_ms.max(settings.min_exp_backoff_ms);
            let shift = (attempts - 1).min(31);
            initial.saturating_mul(1i64 << shift)
        }
    };
    let delay = base.min(settings.max_backoff_delay_ms);

    let mut next = job.clone();
    next.enqueue_time_ms = now_ms;
    next.earliest_run_time_ms = now_ms + delay;
    next.latest_run_time_ms = NO_LATEST_RUN_TIME;
    next.num_failures = attempts;
    next.last_failed_run_time_ms = now_ms;
    next.started_as_expedited = false;
    next.first_force_batched_time_ms = 0;
    next
}

/// Derive the next window for a completed periodic job
pub(crate) fn reschedule_for_periodic(
    job: &Job,
    _settings: &SchedulerSettings,
    now_ms: i64,
) -> Job {
    let period = job.info.period_ms.clamp(MIN_PERIOD_MS, MAX_PERIOD_MS);
    let flex = job.info.flex_ms.clamp(MIN_FLEX_MS, period);
    let lrt = job.original_latest_run_time_ms;
    let diff = (now_ms - lrt).abs();

    let (mut new_latest, head_buffer) = if now_ms > lrt {
        // The window was overrun; skip whole periods, plus one more when
        // the next window would open almost immediately.
        let mut skipped = diff / period + 1;
        if period != flex && period - flex - (diff % period) <= flex / 6 {
            skipped += 1;
        }
        (lrt.saturating_add(period.saturating_mul(skipped)), 0)
    } else {
        let mut buffer = 0;
        if period != flex && diff < PERIODIC_WINDOW_BUFFER_MS && diff < period / 6 {
            buffer = PERIODIC_WINDOW_BUFFER_MS.min(period / 6 - diff);
        }
        (lrt + period, buffer)
    };

    let new_earliest = if new_latest < now_ms {
        warn!(
            "periodic job {} derived a window in the past, falling back to one period from now",
            job.key()
        );
        new_latest = now_ms + period;
        now_ms + period - flex
    } else {
        new_latest - flex.min(period - head_buffer)
    };

    let mut next = job.clone();
    next.enqueue_time_ms = now_ms;
    next.earliest_run_time_ms = new_earliest;
    next.latest_run_time_ms = new_latest;
    next.original_latest_run_time_ms = new_latest;
    next.num_failures = 0;
    next.last_successful_run_time_ms = now_ms;
    next.started_as_expedited = false;
    next.first_force_batched_time_ms = 0;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::types::JobInfo;

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default()
    }

    fn periodic_job(period_ms: i64, flex_ms: i64, scheduled_at: i64) -> Job {
        let mut info = JobInfo::new(1, "com.example/.Periodic");
        info.periodic = true;
        info.period_ms = period_ms;
        info.flex_ms = flex_ms;
        Job::new(info, 10_001, 0, "com.example", None, scheduled_at)
    }

    #[test]
    fn test_exponential_backoff_third_attempt() {
        let mut info = JobInfo::new(1, "com.example/.Sync");
        info.backoff_policy = BackoffPolicy::Exponential;
        info.initial_backoff_ms = 30_000;
        let mut job = Job::new(info, 10_001, 0, "com.example", None, 0);
        job.num_failures = 2;
        let now = 1_000_000;
        let next = reschedule_for_failure(&job, &settings(), now);
        assert_eq!(next.num_failures, 3);
        assert_eq!(next.earliest_run_time_ms, now + 120_000);
        assert_eq!(next.latest_run_time_ms, NO_LATEST_RUN_TIME);
    }

    #[test]
    fn test_linear_backoff_scales_with_attempts() {
        let mut info = JobInfo::new(1, "com.example/.Sync");
        info.backoff_policy = BackoffPolicy::Linear;
        info.initial_backoff_ms = 5_000; // below the floor
        let mut job = Job::new(info, 10_001, 0, "com.example", None, 0);
        job.num_failures = 3;
        let s = settings();
        let next = reschedule_for_failure(&job, &s, 0);
        assert_eq!(
            next.earliest_run_time_ms,
            s.min_linear_backoff_ms * 4
        );
    }

    #[test]
    fn test_backoff_monotonic_in_attempts() {
        for policy in [BackoffPolicy::Linear, BackoffPolicy::Exponential] {
            let mut info = JobInfo::new(1, "com.example/.Sync");
            info.backoff_policy = policy;
            info.initial_backoff_ms = 30_000;
            let mut previous = 0;
            for failures in 0..20 {
                let mut job = Job::new(info.clone(), 10_001, 0, "com.example", None, 0);
                job.num_failures = failures;
                let next = reschedule_for_failure(&job, &settings(), 0);
                let delay = next.earliest_run_time_ms;
                assert!(
                    delay >= previous,
                    "{policy} backoff shrank at attempt {failures}"
                );
                previous = delay;
            }
        }
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let mut info = JobInfo::new(1, "com.example/.Sync");
        info.backoff_policy = BackoffPolicy::Exponential;
        info.initial_backoff_ms = 30_000;
        let mut job = Job::new(info, 10_001, 0, "com.example", None, 0);
        job.num_failures = 40;
        let s = settings();
        let next = reschedule_for_failure(&job, &s, 0);
        assert_eq!(next.earliest_run_time_ms, s.max_backoff_delay_ms);
    }

    #[test]
    fn test_periodic_rewindow_on_time_full_flex() {
        // period == flex disables the head-buffer path entirely.
        let period = 900_000;
        let job = periodic_job(period, period, 0);
        let lrt = job.original_latest_run_time_ms;
        let next = reschedule_for_periodic(&job, &settings(), lrt);
        assert_eq!(next.latest_run_time_ms, lrt + period);
        assert_eq!(next.earliest_run_time_ms, lrt);
        assert_eq!(next.num_failures, 0);
    }

    #[test]
    fn test_periodic_rewindow_round_trip() {
        let period = 3_600_000;
        let flex = 900_000;
        let job = periodic_job(period, flex, 0);
        let lrt = job.original_latest_run_time_ms;
        // Completing exactly at the deadline: the fresh window is one
        // period out with the same flex.
        let next = reschedule_for_periodic(&job, &settings(), lrt);
        assert_eq!(next.latest_run_time_ms, lrt + period);
        assert_eq!(next.earliest_run_time_ms, lrt + period - flex);
    }

    #[test]
    fn test_periodic_rewindow_early_finish_gets_head_buffer() {
        let period = 3_600_000;
        let flex = 900_000;
        let job = periodic_job(period, flex, 0);
        let lrt = job.original_latest_run_time_ms;
        // Finished well before the deadline.
        let now = lrt - period + 60_000;
        let next = reschedule_for_periodic(&job, &settings(), now);
        assert_eq!(next.latest_run_time_ms, lrt + period);
        // diff is nearly a full period, far over period/6: no buffer.
        assert_eq!(next.earliest_run_time_ms, lrt + period - flex);

        // Wide-flex job finishing just before the deadline: the head
        // buffer keeps the next window from opening immediately.
        let wide_flex = 3_300_000;
        let job = periodic_job(period, wide_flex, 0);
        let lrt = job.original_latest_run_time_ms;
        let now = lrt - 60_000;
        let next = reschedule_for_periodic(&job, &settings(), now);
        let buffer = PERIODIC_WINDOW_BUFFER_MS.min(period / 6 - 60_000);
        assert_eq!(next.latest_run_time_ms, lrt + period);
        assert_eq!(
            next.earliest_run_time_ms,
            lrt + period - wide_flex.min(period - buffer)
        );
        assert!(next.earliest_run_time_ms > now);
    }

    #[test]
    fn test_periodic_rewindow_overrun_skips_windows() {
        let period = 3_600_000;
        let flex = 900_000;
        let job = periodic_job(period, flex, 0);
        let lrt = job.original_latest_run_time_ms;
        // Two and a half periods late: skips floor(2.5) + 1 = 3 windows.
        let now = lrt + period * 2 + period / 2;
        let next = reschedule_for_periodic(&job, &settings(), now);
        assert_eq!(next.latest_run_time_ms, lrt + period * 3);
        assert!(next.latest_run_time_ms > now);
        assert_eq!(next.earliest_run_time_ms, next.latest_run_time_ms - flex);
    }

    #[test]
    fn test_periodic_rewindow_clamps_tiny_period() {
        let job = periodic_job(1_000, 100, 0);
        let next = reschedule_for_periodic(&job, &settings(), 0);
        // Clamped up to the minimum period and flex.
        assert_eq!(
            next.latest_run_time_ms - next.earliest_run_time_ms,
            MIN_FLEX_MS
        );
    }
}
