//! Centralized error handling for the scheduler core.
//!
//! Errors fall into two families: rejections returned to callers of the
//! scheduling API (`ScheduleError`) and configuration load/validation
//! failures (`ConfigError`). Whatever happens after a job is admitted
//! (forced stops, invariant drift, transient runner failures) is not an
//! error type: it is logged, counted and recovered from without
//! surfacing to the caller.

pub mod types;

pub use types::*;

/// Convenience type alias for results of scheduling API calls
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Convenience type alias for configuration loading results
pub type ConfigResult<T> = Result<T, ConfigError>;
