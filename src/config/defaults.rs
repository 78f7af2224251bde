//! Configuration default values
//!
//! All defaults and clamping floors live here so the tuning surface is
//! changeable in one central location.

// Concurrency defaults
pub const DEFAULT_SCREEN_OFF_ADJUSTMENT_DELAY_MS: i64 = 30_000;
pub const DEFAULT_PKG_CONCURRENCY_LIMIT_EJ: usize = 3;
pub const DEFAULT_PKG_CONCURRENCY_LIMIT_REGULAR: usize = 8;
pub const DEFAULT_USER_GRACE_PERIOD_MS: i64 = 60_000;

// Execution runtime guarantees
pub const DEFAULT_RUNTIME_MIN_GUARANTEE_MS: i64 = 10 * 60_000;
pub const MIN_RUNTIME_MIN_GUARANTEE_MS: i64 = 10 * 60_000;
pub const DEFAULT_RUNTIME_MIN_EJ_GUARANTEE_MS: i64 = 3 * 60_000;
pub const MIN_RUNTIME_MIN_EJ_GUARANTEE_MS: i64 = 60_000;
pub const DEFAULT_RUNTIME_MIN_HIGH_PRIORITY_GUARANTEE_MS: i64 = 5 * 60_000;
pub const MIN_RUNTIME_MIN_HIGH_PRIORITY_GUARANTEE_MS: i64 = 4 * 60_000;
pub const DEFAULT_RUNTIME_FREE_QUOTA_MAX_LIMIT_MS: i64 = 30 * 60_000;
/// RESTRICTED-bucket apps never get more than this as an EJ guarantee
pub const RESTRICTED_BUCKET_EJ_GUARANTEE_CAP_MS: i64 = 5 * 60_000;

// Failure backoff
pub const DEFAULT_INITIAL_BACKOFF_MS: i64 = 30_000;
pub const DEFAULT_MIN_LINEAR_BACKOFF_MS: i64 = 10_000;
pub const DEFAULT_MIN_EXP_BACKOFF_MS: i64 = 10_000;
pub const DEFAULT_MAX_BACKOFF_DELAY_MS: i64 = 5 * 60 * 60 * 1_000;

// Periodic re-windowing
pub const MIN_PERIOD_MS: i64 = 15 * 60_000;
pub const MAX_PERIOD_MS: i64 = 365 * 24 * 60 * 60_000;
pub const MIN_FLEX_MS: i64 = 5 * 60_000;
pub const PERIODIC_WINDOW_BUFFER_MS: i64 = 30 * 60_000;

// schedule() API quotas
pub const DEFAULT_ENABLE_API_QUOTAS: bool = true;
pub const DEFAULT_AQ_SCHEDULE_COUNT: usize = 250;
pub const DEFAULT_AQ_SCHEDULE_WINDOW_MS: i64 = 60_000;

// Store limits
pub const MAX_JOBS_PER_APP: usize = 150;

// Introspection
pub const COMPLETED_HISTORY_SIZE: usize = 20;
