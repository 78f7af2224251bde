//! Event and timer definitions
//!
//! Every external signal enters the core as an explicitly tagged event;
//! timed behavior (screen-off ramp, grace expiry, max-runtime stops) is
//! delivered as delayed events armed through [`TimerRequest`]s the core
//! emits and the service layer schedules.

use super::types::{JobKey, Uid, UserId};
use serde::{Deserialize, Serialize};

/// Memory pressure level reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemoryTrimLevel {
    #[default]
    Normal,
    Moderate,
    Low,
    Critical,
}

impl MemoryTrimLevel {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Process state of an application uid, as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Top,
    FgService,
    BoundFgService,
    Background,
}

impl ProcessState {
    pub fn bias(self) -> super::types::Bias {
        use super::types::Bias;
        match self {
            ProcessState::Top => Bias::TopApp,
            ProcessState::FgService => Bias::FgService,
            ProcessState::BoundFgService => Bias::BoundFgService,
            ProcessState::Background => Bias::Default,
        }
    }
}

/// Device and app signals delivered into the scheduler core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    Interactive(bool),
    MemoryTrim(MemoryTrimLevel),
    DeviceIdle(bool),
    PowerSave(bool),
    UidProcState { uid: Uid, state: ProcessState },
    UidActive { uid: Uid },
    UidIdle { uid: Uid },
    UidGone { uid: Uid, disabled: bool },
    UserStarted { user_id: UserId },
    UserStopped { user_id: UserId },
    UserSwitched { user_id: UserId },
    UserRemoved { user_id: UserId },
    PackageAdded { package: String, uid: Uid },
    PackageChanged { package: String, uid: Uid },
    PackageRemoved { package: String, uid: Uid },
    PackageRestarted { package: String, uid: Uid },
    BackingUp { uid: Uid, active: bool },
}

/// A delayed event the core wants delivered back to itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    /// Re-check the screen state once the off-ramp delay has elapsed
    ScreenOffRamp { fire_at_ms: i64 },
    /// Force-stop a job that reaches its maximum execution time
    MaxRuntime {
        key: JobKey,
        started_at_ms: i64,
        fire_at_ms: i64,
    },
    /// Re-evaluate classifications once a user-switch grace period ends
    GraceExpiry { fire_at_ms: i64 },
}

impl TimerRequest {
    pub fn fire_at_ms(&self) -> i64 {
        match self {
            TimerRequest::ScreenOffRamp { fire_at_ms }
            | TimerRequest::MaxRuntime { fire_at_ms, .. }
            | TimerRequest::GraceExpiry { fire_at_ms } => *fire_at_ms,
        }
    }
}
