//! End-to-end scheduler tests against the public API
//!
//! Drives the synchronous core directly with a recording runner and a
//! window-only constraint evaluator, covering the full job lifecycle:
//! admission, execution, failure backoff, periodic re-windowing,
//! cancellation and quota enforcement.

use jobsched::config::{Config, SchedulerSettings};
use jobsched::scheduling::{
    ConstraintEvaluator, DeviceEvent, InMemoryJobStore, InternalStopReason, Job, JobInfo, JobKey,
    JobRestriction, JobRunner, ProcessState, RateLimiter, ScheduleQuotaTracker, Scheduler,
    StopReason, WorkType,
};
use std::sync::{Arc, Mutex};

const SVC: &str = "com.example/.WorkService";

#[derive(Default)]
struct RunnerLog {
    started: Vec<(JobKey, WorkType)>,
    cancelled: Vec<(JobKey, StopReason, String)>,
}

struct RecordingRunner {
    log: Arc<Mutex<RunnerLog>>,
}

impl JobRunner for RecordingRunner {
    fn start(&mut self, job: &Job, work_type: WorkType) -> bool {
        self.log.lock().unwrap().started.push((job.key(), work_type));
        true
    }

    fn cancel(
        &mut self,
        job: &Job,
        reason: StopReason,
        _internal: InternalStopReason,
        debug_reason: &str,
    ) {
        self.log
            .lock()
            .unwrap()
            .cancelled
            .push((job.key(), reason, debug_reason.to_string()));
    }
}

/// Only the timing window gates readiness
struct WindowConstraints;

impl ConstraintEvaluator for WindowConstraints {
    fn is_ready(&self, job: &Job, now_ms: i64) -> bool {
        now_ms >= job.earliest_run_time_ms
    }
    fn prepare(&mut self, _job: &Job) {}
    fn unprepare(&mut self, _job: &Job) {}
}

struct NoQuota;

impl RateLimiter for NoQuota {
    fn is_within_quota(&mut self, _u: i32, _p: &str, _t: &str, _n: i64) -> bool {
        true
    }
    fn note_event(&mut self, _u: i32, _p: &str, _t: &str, _n: i64) {}
}

fn scheduler() -> (Scheduler, Arc<Mutex<RunnerLog>>) {
    scheduler_with_limiter(Box::new(NoQuota))
}

fn scheduler_with_limiter(
    limiter: Box<dyn RateLimiter + Send>,
) -> (Scheduler, Arc<Mutex<RunnerLog>>) {
    let settings = SchedulerSettings::default();
    let log = Arc::new(Mutex::new(RunnerLog::default()));
    let runner = RecordingRunner { log: log.clone() };
    let scheduler = Scheduler::new(
        settings,
        Box::new(InMemoryJobStore::new()),
        Box::new(runner),
        Box::new(WindowConstraints),
        limiter,
    );
    (scheduler, log)
}

fn starts(log: &Arc<Mutex<RunnerLog>>) -> Vec<(JobKey, WorkType)> {
    log.lock().unwrap().started.clone()
}

fn cancels(log: &Arc<Mutex<RunnerLog>>) -> Vec<(JobKey, StopReason, String)> {
    log.lock().unwrap().cancelled.clone()
}

#[test]
fn one_off_job_runs_once_and_leaves_the_store() {
    let (mut s, log) = scheduler();
    s.schedule(JobInfo::new(1, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
    assert_eq!(starts(&log).len(), 1);
    assert_eq!(s.stats().running_jobs, 1);

    s.on_job_finished(JobKey::new(10_001, 1), false, 5_000);
    assert_eq!(s.stats().running_jobs, 0);
    assert!(s.get_pending_job(10_001, 1).is_none());
    let stats = s.stats();
    assert_eq!(stats.recently_completed.len(), 1);
    assert_eq!(stats.recently_completed[0].completed_at_ms, 5_000);
    s.check_invariants();
}

#[test]
fn failed_job_backs_off_before_retrying() {
    let (mut s, log) = scheduler();
    let mut info = JobInfo::new(1, SVC);
    info.initial_backoff_ms = 30_000;
    s.schedule(info, 10_001, "com.example", 0, None, 0).unwrap();
    assert_eq!(starts(&log).len(), 1);

    s.on_job_finished(JobKey::new(10_001, 1), true, 10_000);
    let snapshot = s.get_pending_job(10_001, 1).expect("failed job is rescheduled");
    assert_eq!(snapshot.num_failures, 1);
    assert_eq!(snapshot.earliest_run_time_ms, 40_000);

    // Still backing off: no new start.
    s.check_jobs(20_000);
    assert_eq!(starts(&log).len(), 1);

    // Past the backoff window: the retry starts.
    s.check_jobs(40_000);
    assert_eq!(starts(&log).len(), 2);
    s.check_invariants();
}

#[test]
fn periodic_job_is_rewindowed_after_success() {
    let (mut s, log) = scheduler();
    let mut info = JobInfo::new(7, SVC);
    info.periodic = true;
    info.period_ms = 1_800_000;
    info.flex_ms = 1_800_000;
    s.schedule(info, 10_001, "com.example", 0, None, 0).unwrap();

    // Window is [0, period]; with flex == period the job is immediately
    // eligible.
    assert_eq!(starts(&log).len(), 1);
    s.on_job_finished(JobKey::new(10_001, 7), false, 60_000);

    let snapshot = s.get_pending_job(10_001, 7).expect("periodic job persists");
    assert_eq!(snapshot.num_failures, 0);
    assert_eq!(snapshot.latest_run_time_ms, 1_800_000 + 1_800_000);
    assert_eq!(snapshot.earliest_run_time_ms, 1_800_000);
    // Not eligible again until the new window opens.
    s.check_jobs(60_001);
    assert_eq!(starts(&log).len(), 1);
    s.check_jobs(1_800_000);
    assert_eq!(starts(&log).len(), 2);
    s.check_invariants();
}

#[test]
fn schedule_replaces_existing_job_atomically() {
    let (mut s, log) = scheduler();
    s.schedule(JobInfo::new(1, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
    assert_eq!(s.stats().running_jobs, 1);

    // Re-scheduling the same (uid, job id) cancels the running instance.
    let mut replacement = JobInfo::new(1, SVC);
    replacement.min_latency_ms = 60_000;
    s.schedule(replacement, 10_001, "com.example", 0, None, 1_000)
        .unwrap();
    let stops = cancels(&log);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1, StopReason::Cancelled);
    assert_eq!(s.get_pending_jobs(10_001).len(), 1);

    // The old instance's stop confirmation must not resurrect anything.
    s.on_job_finished(JobKey::new(10_001, 1), false, 2_000);
    let snapshot = s.get_pending_job(10_001, 1).unwrap();
    assert_eq!(snapshot.earliest_run_time_ms, 61_000);
    s.check_invariants();
}

#[test]
fn cancelled_running_job_is_not_rescheduled() {
    let (mut s, log) = scheduler();
    let mut info = JobInfo::new(3, SVC);
    info.periodic = true;
    info.period_ms = 1_800_000;
    info.flex_ms = 1_800_000;
    s.schedule(info, 10_001, "com.example", 0, None, 0).unwrap();
    assert_eq!(s.stats().running_jobs, 1);

    s.cancel(10_001, 3, "test cancel", 1_000);
    assert_eq!(cancels(&log).len(), 1);
    // Still occupying its slot until the runner confirms.
    assert_eq!(s.stats().running_jobs, 1);

    s.on_job_finished(JobKey::new(10_001, 3), false, 2_000);
    assert_eq!(s.stats().running_jobs, 0);
    assert!(s.get_pending_job(10_001, 3).is_none());
    s.check_invariants();
}

#[test]
fn persisted_schedule_calls_are_rate_limited() {
    let limiter = ScheduleQuotaTracker::new(true, 2, 60_000);
    let (mut s, _log) = scheduler_with_limiter(Box::new(limiter));
    for job_id in 0..2 {
        let mut info = JobInfo::new(job_id, SVC);
        info.persisted = true;
        s.schedule(info, 10_001, "com.example", 0, None, 0).unwrap();
    }
    let mut info = JobInfo::new(99, SVC);
    info.persisted = true;
    let err = s
        .schedule(info, 10_001, "com.example", 0, None, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        jobsched::errors::ScheduleError::QuotaExceeded { .. }
    ));
    // Non-persisted calls are never throttled.
    s.schedule(JobInfo::new(100, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
}

#[test]
fn per_uid_job_count_is_capped() {
    let (mut s, _log) = scheduler();
    for job_id in 0..150 {
        let mut info = JobInfo::new(job_id, SVC);
        info.min_latency_ms = 3_600_000; // keep them out of the way
        s.schedule(info, 10_001, "com.example", 0, None, 0).unwrap();
    }
    let err = s
        .schedule(JobInfo::new(150, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        jobsched::errors::ScheduleError::TooManyJobs { count: 150, .. }
    ));
    // Replacing an existing job is still allowed at the cap.
    s.schedule(JobInfo::new(0, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
}

#[test]
fn missing_component_is_rejected() {
    let (mut s, _log) = scheduler();
    let err = s
        .schedule(JobInfo::new(1, ""), 10_001, "com.example", 0, None, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        jobsched::errors::ScheduleError::InvalidRequest { .. }
    ));
    assert!(s.get_pending_jobs(10_001).is_empty());
}

struct PackageFreeze(&'static str);

impl JobRestriction for PackageFreeze {
    fn name(&self) -> &'static str {
        "package freeze"
    }
    fn would_restrict(&self, job: &Job) -> bool {
        job.source_package == self.0
    }
}

#[test]
fn restrictions_hold_back_low_bias_jobs_only() {
    let (mut s, log) = scheduler();
    s.add_restriction(Box::new(PackageFreeze("com.cold")));

    s.schedule(JobInfo::new(1, SVC), 10_001, "com.cold", 0, None, 0)
        .unwrap();
    assert!(starts(&log).is_empty(), "restricted job must not start");

    // Foreground-service bias bypasses restrictions.
    s.handle_event(
        DeviceEvent::UidProcState {
            uid: 10_001,
            state: ProcessState::FgService,
        },
        1_000,
    );
    s.check_jobs(1_000);
    assert_eq!(starts(&log).len(), 1);
    s.check_invariants();
}

#[test]
fn backing_up_uid_is_held_back() {
    let (mut s, log) = scheduler();
    s.handle_event(
        DeviceEvent::BackingUp {
            uid: 10_001,
            active: true,
        },
        0,
    );
    s.schedule(JobInfo::new(1, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
    assert!(starts(&log).is_empty());

    s.handle_event(
        DeviceEvent::BackingUp {
            uid: 10_001,
            active: false,
        },
        1_000,
    );
    assert_eq!(starts(&log).len(), 1);
    s.check_invariants();
}

#[test]
fn stopping_a_user_cancels_its_jobs() {
    let (mut s, log) = scheduler();
    s.handle_event(DeviceEvent::UserStarted { user_id: 10 }, 0);
    s.schedule(JobInfo::new(1, SVC), 1_010_001, "com.example", 10, None, 100)
        .unwrap();
    assert_eq!(starts(&log).len(), 1);

    s.handle_event(DeviceEvent::UserStopped { user_id: 10 }, 1_000);
    let stops = cancels(&log);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1, StopReason::User);
    s.on_job_finished(JobKey::new(1_010_001, 1), false, 1_100);
    assert!(s.get_pending_jobs(1_010_001).is_empty());
    s.check_invariants();
}

#[test]
fn background_user_jobs_run_with_bguser_accounting() {
    let (mut s, log) = scheduler();
    s.handle_event(DeviceEvent::UserStarted { user_id: 10 }, 0);
    // User 10 is started but not current and past any grace period.
    s.schedule(JobInfo::new(1, SVC), 1_010_001, "com.example", 10, None, 100)
        .unwrap();
    let started = starts(&log);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].1, WorkType::BgUser);
    s.check_invariants();
}

#[test]
fn completed_history_ring_is_bounded() {
    let (mut s, _log) = scheduler();
    for job_id in 0..25 {
        s.schedule(JobInfo::new(job_id, SVC), 10_001, "com.example", 0, None, 0)
            .unwrap();
        s.on_job_finished(JobKey::new(10_001, job_id), false, 100 + job_id as i64);
    }
    let stats = s.stats();
    assert_eq!(stats.recently_completed.len(), 20);
    assert_eq!(stats.recently_completed[0].job_id, 5);
    assert_eq!(stats.recently_completed[19].job_id, 24);
}

#[test]
fn max_runtime_timer_forces_a_timeout_stop() {
    let (mut s, log) = scheduler();
    s.schedule(JobInfo::new(1, SVC), 10_001, "com.example", 0, None, 0)
        .unwrap();
    let timers = s.take_timer_requests();
    let max_runtime = timers
        .iter()
        .find_map(|t| match t {
            jobsched::scheduling::TimerRequest::MaxRuntime {
                key,
                started_at_ms,
                fire_at_ms,
            } => Some((*key, *started_at_ms, *fire_at_ms)),
            _ => None,
        })
        .expect("a max-runtime timer is armed on start");
    assert_eq!(max_runtime.2, 30 * 60_000);

    s.on_timer(
        jobsched::scheduling::TimerRequest::MaxRuntime {
            key: max_runtime.0,
            started_at_ms: max_runtime.1,
            fire_at_ms: max_runtime.2,
        },
        max_runtime.2,
    );
    let stops = cancels(&log);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1, StopReason::TimedOut);
    s.check_invariants();
}

#[test]
fn default_config_limits_saturate_at_sixteen() {
    let (mut s, log) = scheduler();
    // Default on_normal allows 10 concurrent BG jobs; the rest wait.
    for i in 0..20 {
        s.schedule(
            JobInfo::new(1, SVC),
            20_001 + i,
            format!("com.app{i}"),
            0,
            None,
            0,
        )
        .unwrap();
    }
    assert_eq!(starts(&log).len(), 10);
    let stats = s.stats();
    assert_eq!(stats.running_jobs, 10);
    assert_eq!(stats.pending_jobs, 10);
    s.check_invariants();
}

#[test]
fn overridden_limits_change_throughput() {
    let mut config = Config::default();
    config
        .concurrency
        .limits
        .insert("on_normal".to_string(), {
            let mut limits = jobsched::config::WorkTypeLimits::default();
            limits.max.insert("bg".to_string(), 2);
            limits
        });
    let settings = config.to_settings().unwrap();
    let log = Arc::new(Mutex::new(RunnerLog::default()));
    let mut s = Scheduler::new(
        settings,
        Box::new(InMemoryJobStore::new()),
        Box::new(RecordingRunner { log: log.clone() }),
        Box::new(WindowConstraints),
        Box::new(NoQuota),
    );
    for i in 0..5 {
        s.schedule(
            JobInfo::new(1, SVC),
            20_001 + i,
            format!("com.app{i}"),
            0,
            None,
            0,
        )
        .unwrap();
    }
    assert_eq!(starts(&log).len(), 2);
    s.check_invariants();
}
