//! Error type definitions for the scheduler core
//!
//! Uses `thiserror` for automatic trait implementations and error
//! chaining. Scheduling rejections deliberately carry enough context to be
//! actionable in logs without another store lookup.

use thiserror::Error;

/// Rejections returned from the scheduling API.
///
/// Each variant maps to a caller-visible failure: the request is refused
/// and no scheduler state changes.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The request itself is malformed (bad component, bad uid, app not
    /// permitted to start).
    #[error("invalid schedule request: {reason}")]
    InvalidRequest { reason: String },

    /// The per-app schedule-call rate limiter rejected a persisted
    /// schedule request.
    #[error("schedule() call quota exceeded for {package} (user {user_id})")]
    QuotaExceeded { user_id: i32, package: String },

    /// The uid already has the maximum number of jobs in the store.
    #[error("uid {uid} has {count} jobs scheduled, max is {max}")]
    TooManyJobs { uid: i32, count: usize, max: usize },
}

impl ScheduleError {
    /// Create an invalid-request rejection with a custom reason
    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Configuration load and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Figment failed to read or deserialize the configuration sources
    #[error("configuration load failed: {0}")]
    Load(#[from] figment::Error),

    /// A configuration value survived clamping in an unusable state
    #[error("invalid configuration: {key} - {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    /// Create an invalid-configuration error for a specific key
    pub fn invalid<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}
