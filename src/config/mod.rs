//! Configuration loading and validation
//!
//! Configuration is read once at startup (TOML file plus `JOBSCHED_*`
//! environment overrides via figment) and turned into an immutable
//! [`SchedulerSettings`] snapshot. Every recognized key has a default and
//! is clamped into a sane range on load; the running scheduler never sees
//! a raw, unvalidated value.

use crate::errors::{ConfigError, ConfigResult};
use crate::scheduling::concurrency::STANDARD_CONCURRENCY_LIMIT;
use crate::scheduling::events::MemoryTrimLevel;
use crate::scheduling::types::WorkType;
use crate::scheduling::work_count_tracker::WorkTypeConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use strum::IntoEnumIterator;

pub mod defaults;

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_screen_off_adjustment_delay_ms")]
    pub screen_off_adjustment_delay_ms: i64,
    #[serde(default = "default_pkg_concurrency_limit_ej")]
    pub pkg_concurrency_limit_ej: usize,
    #[serde(default = "default_pkg_concurrency_limit_regular")]
    pub pkg_concurrency_limit_regular: usize,
    #[serde(default = "default_user_grace_period_ms")]
    pub user_grace_period_ms: i64,
    /// Per-(screen, memory) slot table overrides, keyed by config id
    /// (`on_normal`, `off_critical`, ...)
    #[serde(default)]
    pub limits: HashMap<String, WorkTypeLimits>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            screen_off_adjustment_delay_ms: DEFAULT_SCREEN_OFF_ADJUSTMENT_DELAY_MS,
            pkg_concurrency_limit_ej: DEFAULT_PKG_CONCURRENCY_LIMIT_EJ,
            pkg_concurrency_limit_regular: DEFAULT_PKG_CONCURRENCY_LIMIT_REGULAR,
            user_grace_period_ms: DEFAULT_USER_GRACE_PERIOD_MS,
            limits: HashMap::new(),
        }
    }
}

/// Overrides for one device-state slot table. Work types are keyed by
/// their snake_case names (`top`, `fgs`, `ej`, `bg`, `bg_user_important`,
/// `bg_user`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkTypeLimits {
    #[serde(default)]
    pub max_total: Option<usize>,
    #[serde(default)]
    pub min: HashMap<String, usize>,
    #[serde(default)]
    pub max: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_min_guarantee_ms")]
    pub runtime_min_guarantee_ms: i64,
    #[serde(default = "default_runtime_min_ej_guarantee_ms")]
    pub runtime_min_ej_guarantee_ms: i64,
    #[serde(default = "default_runtime_min_high_priority_guarantee_ms")]
    pub runtime_min_high_priority_guarantee_ms: i64,
    #[serde(default = "default_runtime_free_quota_max_limit_ms")]
    pub runtime_free_quota_max_limit_ms: i64,
    #[serde(default = "default_min_linear_backoff_ms")]
    pub min_linear_backoff_ms: i64,
    #[serde(default = "default_min_exp_backoff_ms")]
    pub min_exp_backoff_ms: i64,
    #[serde(default = "default_max_backoff_delay_ms")]
    pub max_backoff_delay_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_min_guarantee_ms: DEFAULT_RUNTIME_MIN_GUARANTEE_MS,
            runtime_min_ej_guarantee_ms: DEFAULT_RUNTIME_MIN_EJ_GUARANTEE_MS,
            runtime_min_high_priority_guarantee_ms: DEFAULT_RUNTIME_MIN_HIGH_PRIORITY_GUARANTEE_MS,
            runtime_free_quota_max_limit_ms: DEFAULT_RUNTIME_FREE_QUOTA_MAX_LIMIT_MS,
            min_linear_backoff_ms: DEFAULT_MIN_LINEAR_BACKOFF_MS,
            min_exp_backoff_ms: DEFAULT_MIN_EXP_BACKOFF_MS,
            max_backoff_delay_ms: DEFAULT_MAX_BACKOFF_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_enable_api_quotas")]
    pub enable_api_quotas: bool,
    #[serde(default = "default_aq_schedule_count")]
    pub aq_schedule_count: usize,
    #[serde(default = "default_aq_schedule_window_ms")]
    pub aq_schedule_window_ms: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enable_api_quotas: DEFAULT_ENABLE_API_QUOTAS,
            aq_schedule_count: DEFAULT_AQ_SCHEDULE_COUNT,
            aq_schedule_window_ms: DEFAULT_AQ_SCHEDULE_WINDOW_MS,
        }
    }
}

// serde default fns (serde wants functions, not consts)
fn default_screen_off_adjustment_delay_ms() -> i64 {
    DEFAULT_SCREEN_OFF_ADJUSTMENT_DELAY_MS
}
fn default_pkg_concurrency_limit_ej() -> usize {
    DEFAULT_PKG_CONCURRENCY_LIMIT_EJ
}
fn default_pkg_concurrency_limit_regular() -> usize {
    DEFAULT_PKG_CONCURRENCY_LIMIT_REGULAR
}
fn default_user_grace_period_ms() -> i64 {
    DEFAULT_USER_GRACE_PERIOD_MS
}
fn default_runtime_min_guarantee_ms() -> i64 {
    DEFAULT_RUNTIME_MIN_GUARANTEE_MS
}
fn default_runtime_min_ej_guarantee_ms() -> i64 {
    DEFAULT_RUNTIME_MIN_EJ_GUARANTEE_MS
}
fn default_runtime_min_high_priority_guarantee_ms() -> i64 {
    DEFAULT_RUNTIME_MIN_HIGH_PRIORITY_GUARANTEE_MS
}
fn default_runtime_free_quota_max_limit_ms() -> i64 {
    DEFAULT_RUNTIME_FREE_QUOTA_MAX_LIMIT_MS
}
fn default_min_linear_backoff_ms() -> i64 {
    DEFAULT_MIN_LINEAR_BACKOFF_MS
}
fn default_min_exp_backoff_ms() -> i64 {
    DEFAULT_MIN_EXP_BACKOFF_MS
}
fn default_max_backoff_delay_ms() -> i64 {
    DEFAULT_MAX_BACKOFF_DELAY_MS
}
fn default_enable_api_quotas() -> bool {
    DEFAULT_ENABLE_API_QUOTAS
}
fn default_aq_schedule_count() -> usize {
    DEFAULT_AQ_SCHEDULE_COUNT
}
fn default_aq_schedule_window_ms() -> i64 {
    DEFAULT_AQ_SCHEDULE_WINDOW_MS
}

impl Config {
    /// Load configuration from a TOML file (if present) with `JOBSCHED_*`
    /// environment overrides layered on top.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("JOBSCHED_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate, clamp and freeze into the settings snapshot the scheduler
    /// runs on.
    pub fn to_settings(&self) -> ConfigResult<SchedulerSettings> {
        for id in self.concurrency.limits.keys() {
            if !CONFIG_IDS.contains(&id.as_str()) {
                return Err(ConfigError::invalid(
                    format!("concurrency.limits.{id}"),
                    "unknown config id",
                ));
            }
        }

        let mut work_type_configs = Vec::with_capacity(2 * MemoryTrimLevel::COUNT);
        for screen_on in [true, false] {
            for trim in [
                MemoryTrimLevel::Normal,
                MemoryTrimLevel::Moderate,
                MemoryTrimLevel::Low,
                MemoryTrimLevel::Critical,
            ] {
                work_type_configs.push(self.build_work_type_config(screen_on, trim));
            }
        }

        let runtime_min_guarantee_ms = self
            .runtime
            .runtime_min_guarantee_ms
            .max(MIN_RUNTIME_MIN_GUARANTEE_MS);
        Ok(SchedulerSettings {
            work_type_configs,
            screen_off_adjustment_delay_ms: self.concurrency.screen_off_adjustment_delay_ms.max(0),
            pkg_concurrency_limit_ej: self
                .concurrency
                .pkg_concurrency_limit_ej
                .clamp(1, STANDARD_CONCURRENCY_LIMIT),
            pkg_concurrency_limit_regular: self
                .concurrency
                .pkg_concurrency_limit_regular
                .clamp(1, STANDARD_CONCURRENCY_LIMIT),
            user_grace_period_ms: self.concurrency.user_grace_period_ms.max(0),
            runtime_min_guarantee_ms,
            runtime_min_ej_guarantee_ms: self
                .runtime
                .runtime_min_ej_guarantee_ms
                .max(MIN_RUNTIME_MIN_EJ_GUARANTEE_MS),
            runtime_min_high_priority_guarantee_ms: self
                .runtime
                .runtime_min_high_priority_guarantee_ms
                .max(MIN_RUNTIME_MIN_HIGH_PRIORITY_GUARANTEE_MS),
            runtime_free_quota_max_limit_ms: self
                .runtime
                .runtime_free_quota_max_limit_ms
                .max(runtime_min_guarantee_ms),
            min_linear_backoff_ms: self.runtime.min_linear_backoff_ms.max(1_000),
            min_exp_backoff_ms: self.runtime.min_exp_backoff_ms.max(1_000),
            max_backoff_delay_ms: self.runtime.max_backoff_delay_ms.max(60_000),
            enable_api_quotas: self.quota.enable_api_quotas,
            aq_schedule_count: self.quota.aq_schedule_count.max(1),
            aq_schedule_window_ms: self.quota.aq_schedule_window_ms.max(1_000),
        })
    }

    fn build_work_type_config(&self, screen_on: bool, trim: MemoryTrimLevel) -> WorkTypeConfig {
        let id = config_id(screen_on, trim);
        let (mut max_total, mut min_reserved, mut max_allowed) = default_limits(screen_on, trim);
        if let Some(overrides) = self.concurrency.limits.get(id) {
            if let Some(total) = overrides.max_total {
                max_total = total;
            }
            for wt in WorkType::iter() {
                let name = wt.to_string();
                if let Some(&v) = overrides.min.get(&name) {
                    min_reserved[wt.index()] = v;
                }
                if let Some(&v) = overrides.max.get(&name) {
                    max_allowed[wt.index()] = v;
                }
            }
        }
        WorkTypeConfig::new(
            id,
            STANDARD_CONCURRENCY_LIMIT,
            max_total,
            min_reserved,
            max_allowed,
        )
    }
}

const CONFIG_IDS: [&str; 8] = [
    "on_normal",
    "on_moderate",
    "on_low",
    "on_critical",
    "off_normal",
    "off_moderate",
    "off_low",
    "off_critical",
];

/// Config id for a (screen, memory trim) combination
pub fn config_id(screen_on: bool, trim: MemoryTrimLevel) -> &'static str {
    match (screen_on, trim) {
        (true, MemoryTrimLevel::Normal) => "on_normal",
        (true, MemoryTrimLevel::Moderate) => "on_moderate",
        (true, MemoryTrimLevel::Low) => "on_low",
        (true, MemoryTrimLevel::Critical) => "on_critical",
        (false, MemoryTrimLevel::Normal) => "off_normal",
        (false, MemoryTrimLevel::Moderate) => "off_moderate",
        (false, MemoryTrimLevel::Low) => "off_low",
        (false, MemoryTrimLevel::Critical) => "off_critical",
    }
}

/// Built-in slot tables per device state. Screen-on favors interactive
/// work; screen-off opens up background throughput. Memory pressure
/// shrinks the pool as a whole.
fn default_limits(
    screen_on: bool,
    trim: MemoryTrimLevel,
) -> (usize, [usize; WorkType::COUNT], [usize; WorkType::COUNT]) {
    // Arrays are indexed [top, fgs, ej, bg, bg_user_important, bg_user].
    match (screen_on, trim) {
        (true, MemoryTrimLevel::Normal) => (16, [4, 2, 3, 2, 0, 0], [16, 16, 16, 10, 4, 2]),
        (true, MemoryTrimLevel::Moderate) => (12, [4, 2, 3, 1, 0, 0], [12, 12, 12, 6, 3, 1]),
        (true, MemoryTrimLevel::Low) => (9, [4, 1, 2, 1, 0, 0], [9, 9, 9, 3, 1, 1]),
        (true, MemoryTrimLevel::Critical) => (6, [4, 1, 1, 0, 0, 0], [6, 6, 6, 1, 1, 1]),
        (false, MemoryTrimLevel::Normal) => (16, [2, 1, 6, 2, 0, 0], [16, 16, 16, 10, 4, 3]),
        (false, MemoryTrimLevel::Moderate) => (12, [2, 1, 4, 1, 0, 0], [12, 12, 12, 6, 3, 2]),
        (false, MemoryTrimLevel::Low) => (9, [2, 1, 3, 1, 0, 0], [9, 9, 9, 4, 2, 1]),
        (false, MemoryTrimLevel::Critical) => (6, [2, 1, 2, 0, 0, 0], [6, 6, 6, 1, 1, 1]),
    }
}

/// Immutable, validated settings snapshot the scheduler core runs on
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Eight slot tables, ordered (screen on, screen off) x (normal,
    /// moderate, low, critical); index via [`SchedulerSettings::work_type_config`]
    pub work_type_configs: Vec<WorkTypeConfig>,
    pub screen_off_adjustment_delay_ms: i64,
    pub pkg_concurrency_limit_ej: usize,
    pub pkg_concurrency_limit_regular: usize,
    pub user_grace_period_ms: i64,
    pub runtime_min_guarantee_ms: i64,
    pub runtime_min_ej_guarantee_ms: i64,
    pub runtime_min_high_priority_guarantee_ms: i64,
    pub runtime_free_quota_max_limit_ms: i64,
    pub min_linear_backoff_ms: i64,
    pub min_exp_backoff_ms: i64,
    pub max_backoff_delay_ms: i64,
    pub enable_api_quotas: bool,
    pub aq_schedule_count: usize,
    pub aq_schedule_window_ms: i64,
}

impl SchedulerSettings {
    pub fn work_type_config(&self, screen_on: bool, trim: MemoryTrimLevel) -> &WorkTypeConfig {
        let screen_index = if screen_on { 0 } else { 1 };
        &self.work_type_configs[screen_index * MemoryTrimLevel::COUNT + trim.index()]
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Config::default()
            .to_settings()
            .expect("default configuration must validate")
    }
}
