//! Scheduling type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{EnumIter, IntoEnumIterator};

/// User handle, as assigned by the platform
pub type UserId = i32;
/// Application uid, unique per (user, package) install
pub type Uid = i32;

/// Sentinel for "this job has no deadline"
pub const NO_LATEST_RUN_TIME: i64 = i64::MAX;
/// Sentinel for "this job may run immediately"
pub const NO_EARLIEST_RUN_TIME: i64 = 0;

/// Identity of a job within the scheduler.
///
/// At most one job per `(uid, job_id)` exists in the store at any time;
/// scheduling the same pair again atomically replaces the previous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub uid: Uid,
    pub job_id: i32,
}

impl JobKey {
    pub fn new(uid: Uid, job_id: i32) -> Self {
        Self { uid, job_id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.job_id)
    }
}

/// Importance level derived from the owning app's process state.
///
/// Evaluated at (and cached until) assignment; orders preemption. The
/// numeric values are for log readability only, comparisons rely purely on
/// the ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Bias {
    #[default]
    Default = 0,
    BoundFgService = 30,
    FgService = 35,
    TopApp = 40,
}

/// Coarse app-standby bucket used to gate eligibility
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Bucket {
    Exempted = 0,
    #[default]
    Active = 1,
    Working = 2,
    Frequent = 3,
    Rare = 4,
    Restricted = 5,
    Never = 6,
}

/// Backoff policy applied when a failed job is rescheduled
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum BackoffPolicy {
    Linear,
    #[default]
    Exponential,
}

/// Priority class affecting the minimum execution guarantee
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum JobPriority {
    #[default]
    Default,
    High,
}

/// Work-type tag consumed by the slot accounting.
///
/// Derived at assignment time from (bias, expedited flag, foreground-user
/// status) and fixed for the duration of that run. Declaration order is
/// importance order; every iteration over work types uses it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum WorkType {
    Top = 0,
    Fgs = 1,
    Ej = 2,
    Bg = 3,
    BgUserImportant = 4,
    BgUser = 5,
}

impl WorkType {
    /// Number of work types (array dimension for per-type counters)
    pub const COUNT: usize = 6;

    /// Stable array index of this work type
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A set of acceptable work types, represented as a fixed-width bitmask.
///
/// A job may run as any member of its set; the work-count tracker picks
/// one at the moment of start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WorkTypeSet(u8);

impl WorkTypeSet {
    pub const EMPTY: WorkTypeSet = WorkTypeSet(0);

    pub fn of(types: &[WorkType]) -> Self {
        let mut set = Self::EMPTY;
        for &wt in types {
            set.insert(wt);
        }
        set
    }

    pub fn insert(&mut self, wt: WorkType) {
        self.0 |= 1 << wt.index();
    }

    pub fn remove(&mut self, wt: WorkType) {
        self.0 &= !(1 << wt.index());
    }

    pub fn contains(self, wt: WorkType) -> bool {
        self.0 & (1 << wt.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: WorkTypeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn subtract(&mut self, other: WorkTypeSet) {
        self.0 &= !other.0;
    }

    /// Iterate members in importance order (TOP first)
    pub fn iter(self) -> impl Iterator<Item = WorkType> {
        WorkType::iter().filter(move |wt| self.contains(*wt))
    }

    /// The most important member, if any
    pub fn first(self) -> Option<WorkType> {
        self.iter().next()
    }
}

impl fmt::Display for WorkTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        write!(f, "{{")?;
        for wt in self.iter() {
            write!(f, "{sep}{wt}")?;
            sep = "|";
        }
        write!(f, "}}")
    }
}

impl FromIterator<WorkType> for WorkTypeSet {
    fn from_iter<I: IntoIterator<Item = WorkType>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for wt in iter {
            set.insert(wt);
        }
        set
    }
}

/// Caller-visible reason a running job was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// Cancelled through the scheduling API
    Cancelled,
    /// Replaced by a more important job
    Preempt,
    /// Device state changed (doze, battery saver, memory pressure)
    DeviceState,
    /// Maximum execution time elapsed
    TimedOut,
    /// The owning user or package went away
    User,
}

/// Internal stop reason, recorded alongside [`StopReason`] for debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum InternalStopReason {
    CancelledByApp,
    Preempt,
    DeviceIdle,
    BatterySaver,
    MemoryPressure,
    TimedOut,
    UserStopped,
    PackageRemoved,
    Unknown,
}

/// The submitted description of a job, as provided by the scheduling
/// caller. Everything the scheduler derives at runtime lives on [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Caller-chosen id, unique within the calling uid
    pub job_id: i32,
    /// Target service component within the source package
    pub service: String,
    /// Whether this job repeats on a (period, flex) window
    pub periodic: bool,
    pub period_ms: i64,
    pub flex_ms: i64,
    /// Prefetch jobs load content the user is expected to want soon
    pub prefetch: bool,
    /// Expedited jobs are a priority class, not a work type
    pub expedited: bool,
    pub priority: JobPriority,
    /// Persisted jobs survive reboots; persisted schedule() calls are
    /// subject to the API rate limiter
    pub persisted: bool,
    /// Whether the job may keep running while the device is dozing
    pub can_run_in_doze: bool,
    pub backoff_policy: BackoffPolicy,
    pub initial_backoff_ms: i64,
    /// Delay before a one-off job becomes eligible
    pub min_latency_ms: i64,
    /// Deadline for a one-off job, relative to schedule time
    pub override_deadline_ms: Option<i64>,
    /// App-standby bucket of the owning app at schedule time
    pub bucket: Bucket,
    /// Debuggable apps get loud quota rejections instead of silent ones
    pub debuggable: bool,
}

impl JobInfo {
    /// Create a one-off job description with defaults for everything but
    /// identity
    pub fn new(job_id: i32, service: impl Into<String>) -> Self {
        Self {
            job_id,
            service: service.into(),
            periodic: false,
            period_ms: 0,
            flex_ms: 0,
            prefetch: false,
            expedited: false,
            priority: JobPriority::Default,
            persisted: false,
            can_run_in_doze: false,
            backoff_policy: BackoffPolicy::Exponential,
            initial_backoff_ms: crate::config::defaults::DEFAULT_INITIAL_BACKOFF_MS,
            min_latency_ms: 0,
            override_deadline_ms: None,
            bucket: Bucket::Active,
            debuggable: false,
        }
    }
}

/// A job as tracked by the scheduler: identity, submitted parameters,
/// timing window and runtime scratch state.
#[derive(Debug, Clone)]
pub struct Job {
    pub source_uid: Uid,
    pub source_user_id: UserId,
    pub source_package: String,
    pub tag: Option<String>,
    pub info: JobInfo,
    /// Distinguishes instances sharing a key across atomic replacement
    /// and rescheduling; assigned by the scheduler on store insert.
    pub instance_id: u64,

    /// When the job was (re)inserted into the store, elapsed ms
    pub enqueue_time_ms: i64,
    pub earliest_run_time_ms: i64,
    pub latest_run_time_ms: i64,
    /// Pre-reschedule deadline, kept for periodic re-windowing
    pub original_latest_run_time_ms: i64,
    pub num_failures: u32,
    pub last_successful_run_time_ms: i64,
    pub last_failed_run_time_ms: i64,

    /// Bias observed at the last assignment pass
    pub last_evaluated_bias: Bias,
    /// When the readiness pipeline first held this job back for batching
    pub first_force_batched_time_ms: i64,
    /// Set when the job began execution under the expedited quota
    pub started_as_expedited: bool,
}

impl Job {
    /// Build a fresh job from a schedule request, deriving its timing
    /// window from `now`.
    pub fn new(
        info: JobInfo,
        source_uid: Uid,
        source_user_id: UserId,
        source_package: impl Into<String>,
        tag: Option<String>,
        now_ms: i64,
    ) -> Self {
        let (earliest, latest) = if info.periodic {
            let latest = now_ms + info.period_ms;
            (latest - info.flex_ms, latest)
        } else {
            let earliest = if info.min_latency_ms > 0 {
                now_ms + info.min_latency_ms
            } else {
                NO_EARLIEST_RUN_TIME
            };
            let latest = info
                .override_deadline_ms
                .map(|d| now_ms + d)
                .unwrap_or(NO_LATEST_RUN_TIME);
            (earliest, latest)
        };

        Self {
            source_uid,
            source_user_id,
            source_package: source_package.into(),
            tag,
            info,
            instance_id: 0,
            enqueue_time_ms: now_ms,
            earliest_run_time_ms: earliest,
            latest_run_time_ms: latest,
            original_latest_run_time_ms: latest,
            num_failures: 0,
            last_successful_run_time_ms: 0,
            last_failed_run_time_ms: 0,
            last_evaluated_bias: Bias::Default,
            first_force_batched_time_ms: 0,
            started_as_expedited: false,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.source_uid, self.info.job_id)
    }

    /// Expedited treatment applies while the job holds or started under
    /// the expedited quota.
    pub fn should_treat_as_expedited(&self) -> bool {
        self.info.expedited || self.started_as_expedited
    }

    pub fn has_deadline(&self) -> bool {
        self.latest_run_time_ms != NO_LATEST_RUN_TIME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_ordering() {
        assert!(Bias::Default < Bias::BoundFgService);
        assert!(Bias::BoundFgService < Bias::FgService);
        assert!(Bias::FgService < Bias::TopApp);
    }

    #[test]
    fn test_work_type_set_importance_order() {
        let set = WorkTypeSet::of(&[WorkType::BgUser, WorkType::Bg, WorkType::Top]);
        let order: Vec<WorkType> = set.iter().collect();
        assert_eq!(order, vec![WorkType::Top, WorkType::Bg, WorkType::BgUser]);
        assert_eq!(set.first(), Some(WorkType::Top));
    }

    #[test]
    fn test_work_type_set_membership() {
        let mut set = WorkTypeSet::EMPTY;
        assert!(set.is_empty());
        set.insert(WorkType::Ej);
        assert!(set.contains(WorkType::Ej));
        assert!(!set.contains(WorkType::Bg));
        set.remove(WorkType::Ej);
        assert!(set.is_empty());
    }

    #[test]
    fn test_one_off_job_window() {
        let mut info = JobInfo::new(1, "com.example/.SyncService");
        info.min_latency_ms = 5_000;
        info.override_deadline_ms = Some(60_000);
        let job = Job::new(info, 10_001, 0, "com.example", None, 1_000);
        assert_eq!(job.earliest_run_time_ms, 6_000);
        assert_eq!(job.latest_run_time_ms, 61_000);
        assert!(job.has_deadline());
    }

    #[test]
    fn test_periodic_job_window() {
        let mut info = JobInfo::new(2, "com.example/.PollService");
        info.periodic = true;
        info.period_ms = 900_000;
        info.flex_ms = 300_000;
        let job = Job::new(info, 10_001, 0, "com.example", None, 0);
        assert_eq!(job.latest_run_time_ms, 900_000);
        assert_eq!(job.earliest_run_time_ms, 600_000);
    }

    #[test]
    fn test_no_deadline_sentinel() {
        let job = Job::new(
            JobInfo::new(3, "com.example/.OneShot"),
            10_001,
            0,
            "com.example",
            None,
            0,
        );
        assert_eq!(job.latest_run_time_ms, NO_LATEST_RUN_TIME);
        assert!(!job.has_deadline());
    }
}
