//! Deferred-work scheduling core
//!
//! The subsystem decides which scheduled jobs run when, on which execution
//! slot, and when a running job is preempted for a more important one.
//! It is built from six pieces:
//! - `WorkCountTracker`: per-work-type slot accounting and reservations
//! - `PackageStatsTracker`: per-(user, package) concurrency caps
//! - `GracePeriodTracker`: foreground treatment across user switches
//! - `ConcurrencyManager`: the slot table, assignment and preemption
//! - readiness checks coordinating constraints and restrictions
//! - `Scheduler`: the single-task core receiving all events
//!
//! `SchedulerService` wraps the core in a tokio task with an ordered
//! command queue and a timer wheel.

pub mod concurrency;
pub mod events;
pub mod external;
pub mod grace_period;
pub mod package_stats;
pub mod pending_queue;
pub mod quota;
pub mod readiness;
pub mod scheduler;
pub mod service;
pub mod types;
pub mod work_count_tracker;

pub use concurrency::{ConcurrencyManager, MAX_RETAINED_OBJECTS, STANDARD_CONCURRENCY_LIMIT};
pub use events::{DeviceEvent, MemoryTrimLevel, ProcessState, TimerRequest};
pub use external::{ConstraintEvaluator, InMemoryJobStore, JobRunner, JobStore, RateLimiter};
pub use grace_period::GracePeriodTracker;
pub use package_stats::{PackageStats, PackageStatsTracker};
pub use pending_queue::PendingQueue;
pub use quota::ScheduleQuotaTracker;
pub use readiness::JobRestriction;
pub use scheduler::{CompletedJobRecord, JobSnapshot, Scheduler, SchedulerStats};
pub use service::{SchedulerHandle, SchedulerService};
pub use types::*;
pub use work_count_tracker::{WorkCountTracker, WorkTypeConfig};
