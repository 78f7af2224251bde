//! Concurrency manager: the slot table and the assignment pass
//!
//! Owns the bounded pool of execution slots, decides which pending job
//! gets which slot, when a running job is preempted to make room, and how
//! device state (screen, memory pressure, doze, battery saver) reshapes
//! the per-work-type thresholds. Everything here runs under the scheduler
//! task; the only outward calls are to the injected [`JobRunner`].
//!
//! [`JobRunner`]: super::external::JobRunner

use super::package_stats::PackageStatsTracker;
use super::scheduler::Scheduler;
use super::types::{
    Bias, InternalStopReason, Job, JobKey, StopReason, Uid, UserId, WorkType, WorkTypeSet,
};
use super::work_count_tracker::WorkCountTracker;
use crate::config::SchedulerSettings;
use crate::scheduling::events::{MemoryTrimLevel, TimerRequest};
use std::collections::HashSet;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

/// Hard cap on concurrently running jobs
pub const STANDARD_CONCURRENCY_LIMIT: usize = 16;
/// Slot objects retained between assignment passes
pub const MAX_RETAINED_OBJECTS: usize = STANDARD_CONCURRENCY_LIMIT + STANDARD_CONCURRENCY_LIMIT / 2;
/// Throttle on config/memory re-evaluation during assignment
const CONFIG_REFRESH_INTERVAL_MS: i64 = 1_000;

/// Snapshot of the job occupying a slot, fixed at start time
#[derive(Debug, Clone)]
pub(crate) struct RunningJob {
    pub key: JobKey,
    pub instance_id: u64,
    pub user_id: UserId,
    pub package: String,
    pub work_type: WorkType,
    pub start_time_ms: i64,
    pub min_guarantee_ms: i64,
    /// Whether the job held expedited treatment when it started
    pub expedited: bool,
    pub can_run_in_doze: bool,
    pub bias_at_start: Bias,
    /// Set once a stop has been requested; the slot is not reassigned
    /// until the runner confirms the job finished.
    pub pending_stop: Option<StopReason>,
}

impl RunningJob {
    fn within_guarantee(&self, now_ms: i64) -> bool {
        now_ms - self.start_time_ms < self.min_guarantee_ms
    }

    fn is_top_ej(&self) -> bool {
        self.expedited && self.bias_at_start == Bias::TopApp
    }
}

/// One execution context. Idle or running exactly one job; `preferred_uid`
/// sticks after a preemption so the freed slot favors same-uid work.
#[derive(Debug)]
pub(crate) struct ExecutionSlot {
    pub id: u32,
    pub preferred_uid: Option<Uid>,
    pub job: Option<RunningJob>,
}

/// Slot table, work-count tracker, package stats and device state
pub struct ConcurrencyManager {
    pub(crate) slots: Vec<ExecutionSlot>,
    next_slot_id: u32,
    pub(crate) tracker: WorkCountTracker,
    pub(crate) pkg_stats: PackageStatsTracker,
    running: HashSet<JobKey>,
    num_dropped_contexts: u64,

    current_interactive: bool,
    effective_interactive: bool,
    screen_off_since_ms: Option<i64>,
    pub(crate) device_idle: bool,
    pub(crate) power_save: bool,
    memory_trim: MemoryTrimLevel,
    current_config_id: String,
    last_config_refresh_ms: i64,
    config_dirty: bool,
}

impl ConcurrencyManager {
    pub fn new(settings: &SchedulerSettings) -> Self {
        let mut manager = Self {
            slots: Vec::new(),
            next_slot_id: 0,
            tracker: WorkCountTracker::new(),
            pkg_stats: PackageStatsTracker::new(
                settings.pkg_concurrency_limit_ej,
                settings.pkg_concurrency_limit_regular,
            ),
            running: HashSet::new(),
            num_dropped_contexts: 0,
            current_interactive: true,
            effective_interactive: true,
            screen_off_since_ms: None,
            device_idle: false,
            power_save: false,
            memory_trim: MemoryTrimLevel::Normal,
            current_config_id: String::new(),
            last_config_refresh_ms: i64::MIN,
            config_dirty: true,
        };
        manager.refresh_config(0, settings);
        manager
    }

    /// Re-select the work type config for the current device state,
    /// throttled to once per second unless a state change forced it.
    pub(crate) fn refresh_config(&mut self, now_ms: i64, settings: &SchedulerSettings) {
        if !self.config_dirty
            && now_ms.saturating_sub(self.last_config_refresh_ms) < CONFIG_REFRESH_INTERVAL_MS
        {
            return;
        }
        self.last_config_refresh_ms = now_ms;
        self.config_dirty = false;
        let cfg = settings.work_type_config(self.effective_interactive, self.memory_trim);
        if cfg.id != self.current_config_id {
            info!("switching work type config to {}", cfg.id);
            self.current_config_id = cfg.id.clone();
        }
        self.tracker.set_config(cfg);
        self.pkg_stats.set_limits(
            settings.pkg_concurrency_limit_ej,
            settings.pkg_concurrency_limit_regular,
        );
    }

    pub fn is_running(&self, key: &JobKey) -> bool {
        self.running.contains(key)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_keys(&self) -> Vec<JobKey> {
        self.running.iter().copied().collect()
    }

    pub fn num_dropped_contexts(&self) -> u64 {
        self.num_dropped_contexts
    }

    pub fn effective_interactive(&self) -> bool {
        self.effective_interactive
    }

    pub fn current_config_id(&self) -> &str {
        &self.current_config_id
    }

    pub(crate) fn set_memory_trim(&mut self, level: MemoryTrimLevel) {
        if level != self.memory_trim {
            self.memory_trim = level;
            self.config_dirty = true;
        }
    }

    pub(crate) fn on_screen_on(&mut self) {
        self.current_interactive = true;
        self.screen_off_since_ms = None;
        if !self.effective_interactive {
            self.effective_interactive = true;
            self.config_dirty = true;
        }
    }

    /// Returns whether this is a fresh on→off transition
    pub(crate) fn on_screen_off(&mut self, now_ms: i64) -> bool {
        if !self.current_interactive {
            return false;
        }
        self.current_interactive = false;
        self.screen_off_since_ms = Some(now_ms);
        true
    }

    /// The screen-off adjustment timer fired. Returns whether the
    /// effective state flipped (the screen really stayed off that long).
    pub(crate) fn screen_off_ramp_fired(&mut self, now_ms: i64, settings: &SchedulerSettings) -> bool {
        if self.current_interactive || !self.effective_interactive {
            return false;
        }
        let Some(off_since) = self.screen_off_since_ms else {
            return false;
        };
        if now_ms - off_since >= settings.screen_off_adjustment_delay_ms {
            self.effective_interactive = false;
            self.config_dirty = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.job.is_some()).count()
    }

    pub(crate) fn count_top_ej_running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.job.as_ref().is_some_and(|rj| rj.is_top_ej()))
            .count()
    }

    pub(crate) fn ensure_slot_count(&mut self, count: usize) {
        while self.slots.len() < count {
            self.materialize_slot();
        }
    }

    pub(crate) fn materialize_slot(&mut self) -> usize {
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        self.slots.push(ExecutionSlot {
            id,
            preferred_uid: None,
            job: None,
        });
        self.slots.len() - 1
    }

    /// Drop idle slots beyond the retention cap after a pass settles
    pub(crate) fn trim_idle_slots(&mut self) {
        let mut index = self.slots.len();
        while self.slots.len() > MAX_RETAINED_OBJECTS && index > 0 {
            index -= 1;
            if self.slots[index].job.is_none() {
                self.slots.remove(index);
                self.num_dropped_contexts += 1;
            }
        }
    }

    pub(crate) fn running_insert(&mut self, key: JobKey) {
        self.running.insert(key);
    }

    pub(crate) fn running_remove(&mut self, key: &JobKey) {
        self.running.remove(key);
    }
}

/// The set of work types a job may run as, given its evaluated bias and
/// whether its user currently counts as foreground.
pub(crate) fn work_types_for(job: &Job, foreground_user: bool) -> WorkTypeSet {
    let mut types = WorkTypeSet::EMPTY;
    if foreground_user {
        if job.last_evaluated_bias >= Bias::TopApp {
            types.insert(WorkType::Top);
        } else if job.last_evaluated_bias >= Bias::FgService {
            types.insert(WorkType::Fgs);
        } else {
            types.insert(WorkType::Bg);
        }
        if job.should_treat_as_expedited() {
            types.insert(WorkType::Ej);
        }
    } else {
        if job.last_evaluated_bias >= Bias::FgService || job.should_treat_as_expedited() {
            types.insert(WorkType::BgUserImportant);
        }
        types.insert(WorkType::BgUser);
    }
    types
}

/// Bookkeeping handed back when a finished job's slot is released
pub(crate) struct FinishedSlot {
    pub slot_index: usize,
    pub instance_id: u64,
    pub work_type: WorkType,
    pub package: String,
    pub preferred_uid: Option<Uid>,
    pub prev_bias: Bias,
}

struct PlannedStop {
    slot_index: usize,
    reason: StopReason,
    internal: InternalStopReason,
    debug_reason: String,
    new_preferred_uid: Option<Uid>,
}

struct PlannedStart {
    slot_index: usize,
    key: JobKey,
    work_type: WorkType,
    for_ej: bool,
    user_id: UserId,
    package: String,
}

impl Scheduler {
    // ------------------------------------------------------------------
    // Device state transitions
    // ------------------------------------------------------------------

    pub(crate) fn on_interactive_changed(&mut self, on: bool, now_ms: i64) {
        if on {
            self.concurrency.on_screen_on();
            self.assign_jobs_to_contexts(now_ms);
        } else if self.concurrency.on_screen_off(now_ms) {
            self.timer_requests.push(TimerRequest::ScreenOffRamp {
                fire_at_ms: now_ms + self.settings.screen_off_adjustment_delay_ms,
            });
        }
    }

    pub(crate) fn on_device_idle_changed(&mut self, idle: bool, now_ms: i64) {
        self.concurrency.device_idle = idle;
        if idle {
            let mut victims: Vec<(JobKey, &'static str)> = Vec::new();
            for slot in &self.concurrency.slots {
                let Some(rj) = &slot.job else { continue };
                if rj.pending_stop.is_some() {
                    continue;
                }
                if !rj.can_run_in_doze {
                    victims.push((rj.key, "deep doze"));
                } else if !rj.within_guarantee(now_ms) {
                    victims.push((rj.key, "ran long enough before doze"));
                }
            }
            for (key, debug_reason) in victims {
                self.request_stop_running_job(
                    key,
                    StopReason::DeviceState,
                    InternalStopReason::DeviceIdle,
                    debug_reason,
                );
            }
        }
        self.check_jobs(now_ms);
    }

    pub(crate) fn on_power_save_changed(&mut self, enabled: bool, now_ms: i64) {
        self.concurrency.power_save = enabled;
        if enabled {
            let victims: Vec<JobKey> = self
                .concurrency
                .slots
                .iter()
                .filter_map(|slot| slot.job.as_ref())
                .filter(|rj| rj.pending_stop.is_none() && !rj.within_guarantee(now_ms))
                .map(|rj| rj.key)
                .collect();
            for key in victims {
                self.request_stop_running_job(
                    key,
                    StopReason::DeviceState,
                    InternalStopReason::BatterySaver,
                    "battery saver",
                );
            }
        }
        self.check_jobs(now_ms);
    }

    /// A max-runtime timer fired; stop the job if that same run is still
    /// going.
    pub(crate) fn on_max_runtime_elapsed(&mut self, key: JobKey, started_at_ms: i64, _now_ms: i64) {
        let still_running = self.concurrency.slots.iter().any(|s| {
            s.job.as_ref().is_some_and(|rj| {
                rj.key == key && rj.start_time_ms == started_at_ms && rj.pending_stop.is_none()
            })
        });
        if still_running {
            self.request_stop_running_job(
                key,
                StopReason::TimedOut,
                InternalStopReason::TimedOut,
                "maximum execution time elapsed",
            );
        }
    }

    /// Ask the runner to stop a running job. The job keeps its slot and
    /// its running-set membership until the runner's finished callback.
    pub(crate) fn request_stop_running_job(
        &mut self,
        key: JobKey,
        reason: StopReason,
        internal: InternalStopReason,
        debug_reason: &str,
    ) {
        let Some(index) = self
            .concurrency
            .slots
            .iter()
            .position(|s| s.job.as_ref().is_some_and(|rj| rj.key == key))
        else {
            warn!("stop requested for job {} not found in any slot", key);
            return;
        };
        let rj = self.concurrency.slots[index].job.as_mut().unwrap();
        if rj.pending_stop.is_some() {
            return;
        }
        rj.pending_stop = Some(reason);
        let Some(job) = self.store.get(&key).cloned() else {
            warn!("stopping job {} with no store entry", key);
            return;
        };
        info!("stopping job {}: {} ({})", key, debug_reason, reason);
        self.runner.cancel(&job, reason, internal, debug_reason);
    }

    // ------------------------------------------------------------------
    // The assignment pass
    // ------------------------------------------------------------------

    /// Assign pending jobs to execution slots, preempting running jobs
    /// where policy allows. Idempotent: re-running with unchanged state
    /// makes no runner calls and no state changes.
    pub(crate) fn assign_jobs_to_contexts(&mut self, now_ms: i64) {
        if self.pending.is_empty() {
            return;
        }
        self.concurrency.refresh_config(now_ms, &self.settings);

        // Refresh evaluated biases and the per-type pending counts.
        self.concurrency.tracker.reset_counts();
        let pending_keys = self.pending.snapshot();
        for key in &pending_keys {
            let bias = self.evaluate_bias(key.uid);
            let fg = self
                .store
                .get(key)
                .map(|j| j.source_user_id)
                .is_some_and(|u| self.grace.is_foreground_equivalent(u, now_ms));
            if let Some(job) = self.store.get_mut(key) {
                job.last_evaluated_bias = bias;
                let types = work_types_for(job, fg);
                self.concurrency.tracker.increment_pending(types);
            }
        }

        // Rebuild the running counts from the slot table (recovers any
        // transient counter drift) and assign reservations.
        self.concurrency.ensure_slot_count(STANDARD_CONCURRENCY_LIMIT);
        self.concurrency.tracker.reset_running_counts();
        let slot_jobs: Vec<(usize, Option<RunningJob>)> = self
            .concurrency
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.job.clone()))
            .collect();
        for (_, job) in &slot_jobs {
            if let Some(rj) = job {
                self.concurrency.tracker.increment_running(rj.work_type);
            }
        }
        self.concurrency.tracker.on_count_done();

        // Classify the slot table.
        let mut idle: Vec<usize> = Vec::new();
        let mut stoppable: Vec<(usize, String)> = Vec::new();
        let mut preferred_only: Vec<usize> = Vec::new();
        for (index, job) in &slot_jobs {
            match job {
                None => idle.push(*index),
                Some(rj) if rj.pending_stop.is_some() => preferred_only.push(*index),
                Some(rj) => match self.should_stop_running_job(rj, now_ms) {
                    Some(reason) => stoppable.push((*index, reason)),
                    None => preferred_only.push(*index),
                },
            }
        }

        // Preemption preference: contexts without a job last, non-TOP
        // before TOP, longest-running first.
        let determination_key = |index: usize, slots: &[ExecutionSlot]| -> (u8, u8, i64) {
            match &slots[index].job {
                None => (1, 0, i64::MAX),
                Some(rj) => (
                    0,
                    (rj.bias_at_start >= Bias::TopApp) as u8,
                    rj.start_time_ms,
                ),
            }
        };
        stoppable.sort_by_key(|(i, _)| determination_key(*i, &self.concurrency.slots));
        preferred_only.sort_by_key(|i| determination_key(*i, &self.concurrency.slots));

        let mut planned_stops: Vec<PlannedStop> = Vec::new();
        let mut planned_starts: Vec<PlannedStart> = Vec::new();
        let mut stopping_slots: HashSet<usize> = HashSet::new();
        let mut projected_running = self.concurrency.occupied_count();

        for key in &pending_keys {
            if self.concurrency.is_running(key) {
                error!(
                    "invariant violation: pending queue contains running job {}, dropping entry",
                    key
                );
                self.pending.remove(key);
                continue;
            }
            let Some(job) = self.store.get(key).cloned() else {
                self.pending.remove(key);
                continue;
            };
            let fg = self
                .grace
                .is_foreground_equivalent(job.source_user_id, now_ms);
            let types = work_types_for(&job, fg);
            let for_ej = job.should_treat_as_expedited();
            let is_top_ej = for_ej && job.last_evaluated_bias == Bias::TopApp;
            let load = self.pending.len() + self.concurrency.running_count();
            let pkg_ok = !self.concurrency.pkg_stats.is_package_limited(
                &job,
                load,
                self.concurrency.tracker.max_total(),
            );
            let is_overage = projected_running > STANDARD_CONCURRENCY_LIMIT;

            // Try an idle slot first.
            let mut assigned = false;
            if pkg_ok {
                let idle_pos = idle.iter().position(|&i| {
                    let pref = self.concurrency.slots[i].preferred_uid;
                    pref.is_none() || pref == Some(job.source_uid)
                });
                if let Some(pos) = idle_pos {
                    if let Some(wt) = self.concurrency.tracker.can_job_start(types) {
                        let slot_index = idle.remove(pos);
                        self.stage_start(&mut planned_starts, slot_index, &job, wt, types, for_ej);
                        projected_running += 1;
                        assigned = true;
                    }
                }
            }

            // Try stopping a stoppable context to make room.
            let mut marked_stop = false;
            if !assigned && pkg_ok && !stoppable.is_empty() {
                let top_ej_count = self.concurrency.count_top_ej_running();
                let mut chosen: Option<usize> = None;
                for (pos, (slot_index, _)) in stoppable.iter().enumerate() {
                    let Some(rj) = self.concurrency.slots[*slot_index].job.clone() else {
                        continue;
                    };
                    let victim_fell_below_top = self.evaluate_bias(rj.key.uid) < Bias::TopApp;
                    let allowed = is_top_ej
                        || (!is_overage
                            && (rj.bias_at_start < Bias::TopApp
                                || victim_fell_below_top
                                || 2 * top_ej_count > self.concurrency.tracker.max_total()));
                    if !allowed {
                        continue;
                    }
                    if self
                        .concurrency
                        .tracker
                        .can_job_start_replacing(types, rj.work_type)
                        .is_some()
                    {
                        chosen = Some(pos);
                        break;
                    }
                }
                if let Some(pos) = chosen {
                    let (slot_index, reason) = stoppable.remove(pos);
                    stopping_slots.insert(slot_index);
                    planned_stops.push(PlannedStop {
                        slot_index,
                        reason: StopReason::DeviceState,
                        internal: InternalStopReason::Preempt,
                        debug_reason: reason,
                        new_preferred_uid: Some(job.source_uid),
                    });
                    marked_stop = true;
                }
            }
            if marked_stop && !is_top_ej {
                // The job comes back around once the stop completes.
                continue;
            }

            // Replace a same-uid lower-bias job that is otherwise kept.
            if !assigned && !marked_stop && !is_top_ej && !is_overage && pkg_ok {
                let mut lowest: Option<(usize, Bias)> = None;
                for (pos, &slot_index) in preferred_only.iter().enumerate() {
                    let Some(rj) = &self.concurrency.slots[slot_index].job else {
                        continue;
                    };
                    if rj.pending_stop.is_some() || stopping_slots.contains(&slot_index) {
                        continue;
                    }
                    if rj.key.uid == job.source_uid
                        && rj.bias_at_start < job.last_evaluated_bias
                        && lowest.is_none_or(|(_, bias)| rj.bias_at_start < bias)
                    {
                        lowest = Some((pos, rj.bias_at_start));
                    }
                }
                if let Some((pos, _)) = lowest {
                    let slot_index = preferred_only.remove(pos);
                    stopping_slots.insert(slot_index);
                    planned_stops.push(PlannedStop {
                        slot_index,
                        reason: StopReason::DeviceState,
                        internal: InternalStopReason::Preempt,
                        debug_reason: "higher bias job found".to_string(),
                        new_preferred_uid: Some(job.source_uid),
                    });
                    continue;
                }
            }

            // A top-app expedited job gets a slot no matter what.
            if !assigned && is_top_ej {
                let slot_index = if let Some(pos) = idle.iter().position(|&i| {
                    let pref = self.concurrency.slots[i].preferred_uid;
                    pref.is_none() || pref == Some(job.source_uid)
                }) {
                    idle.remove(pos)
                } else {
                    self.concurrency.materialize_slot()
                };
                let wt = self
                    .concurrency
                    .tracker
                    .can_job_start(types)
                    .unwrap_or(WorkType::Top);
                self.stage_start(&mut planned_starts, slot_index, &job, wt, types, for_ej);
                projected_running += 1;
            }
        }

        // Carry out the changes: cancellations first, then starts.
        for stop in planned_stops {
            let slot = &mut self.concurrency.slots[stop.slot_index];
            slot.preferred_uid = stop.new_preferred_uid;
            let Some(rj) = slot.job.as_mut() else { continue };
            if rj.pending_stop.is_some() {
                continue;
            }
            rj.pending_stop = Some(stop.reason);
            let key = rj.key;
            let Some(job) = self.store.get(&key).cloned() else {
                continue;
            };
            info!("preempting job {}: {}", key, stop.debug_reason);
            self.runner
                .cancel(&job, stop.reason, stop.internal, &stop.debug_reason);
        }
        for start in planned_starts {
            self.execute_start(start, now_ms);
        }

        self.concurrency.trim_idle_slots();
        self.concurrency.tracker.reset_staging_counts();
        self.concurrency.pkg_stats.reset_staging();
    }

    /// Record a staged assignment during the determination loop
    fn stage_start(
        &mut self,
        planned: &mut Vec<PlannedStart>,
        slot_index: usize,
        job: &Job,
        work_type: WorkType,
        all_types: WorkTypeSet,
        for_ej: bool,
    ) {
        self.concurrency.tracker.stage_job(work_type, all_types);
        self.concurrency.pkg_stats.adjust_staged(
            job.source_user_id,
            &job.source_package,
            for_ej,
            true,
        );
        planned.push(PlannedStart {
            slot_index,
            key: job.key(),
            work_type,
            for_ej,
            user_id: job.source_user_id,
            package: job.source_package.clone(),
        });
    }

    /// Hand a staged job to the runner and finalize the bookkeeping
    fn execute_start(&mut self, start: PlannedStart, now_ms: i64) {
        let Some(job) = self.store.get(&start.key).cloned() else {
            self.concurrency.tracker.on_staged_job_failed(start.work_type);
            self.concurrency
                .pkg_stats
                .adjust_staged(start.user_id, &start.package, start.for_ej, false);
            return;
        };
        self.constraints.prepare(&job);
        if self.runner.start(&job, start.work_type) {
            self.pending.remove(&start.key);
            let running = RunningJob {
                key: start.key,
                instance_id: job.instance_id,
                user_id: start.user_id,
                package: start.package.clone(),
                work_type: start.work_type,
                start_time_ms: now_ms,
                min_guarantee_ms: self.min_execution_guarantee_ms(&job),
                expedited: job.should_treat_as_expedited(),
                can_run_in_doze: job.info.can_run_in_doze,
                bias_at_start: job.last_evaluated_bias,
                pending_stop: None,
            };
            let slot = &mut self.concurrency.slots[start.slot_index];
            info!(
                "started job {} as {} on slot {}",
                start.key, start.work_type, slot.id
            );
            slot.job = Some(running);
            self.concurrency.running_insert(start.key);
            self.concurrency.tracker.on_job_started(start.work_type);
            self.concurrency
                .pkg_stats
                .on_job_started(start.user_id, &start.package, start.for_ej);
            if let Some(stored) = self.store.get_mut(&start.key) {
                stored.started_as_expedited = stored.should_treat_as_expedited();
            }
            let max_runtime = self.max_execution_time_ms(&job);
            if max_runtime < i64::MAX {
                self.timer_requests.push(TimerRequest::MaxRuntime {
                    key: start.key,
                    started_at_ms: now_ms,
                    fire_at_ms: now_ms + max_runtime,
                });
            }
        } else {
            warn!("runner refused job {}, leaving it pending", start.key);
            self.concurrency.tracker.on_staged_job_failed(start.work_type);
            self.concurrency
                .pkg_stats
                .adjust_staged(start.user_id, &start.package, start.for_ej, false);
            self.constraints.unprepare(&job);
        }
    }

    // ------------------------------------------------------------------
    // Stop determination
    // ------------------------------------------------------------------

    /// Whether a running job may be stopped to free its slot. Returns the
    /// reason string recorded in logs, or `None` to keep the job running.
    pub(crate) fn should_stop_running_job(
        &mut self,
        rj: &RunningJob,
        now_ms: i64,
    ) -> Option<String> {
        if rj.within_guarantee(now_ms) {
            return None;
        }
        if self.concurrency.power_save {
            return Some("battery saver".to_string());
        }
        if self.concurrency.device_idle {
            return Some("deep doze".to_string());
        }
        self.concurrency.refresh_config(now_ms, &self.settings);
        if self.concurrency.occupied_count() > self.concurrency.tracker.max_total()
            || self.concurrency.tracker.is_over_type_limit(rj.work_type)
        {
            return Some("too many jobs running".to_string());
        }
        if self.pending.is_empty() {
            return None;
        }

        if rj.expedited {
            // Expedited jobs yield only to the queues they block.
            if matches!(rj.work_type, WorkType::BgUserImportant | WorkType::BgUser) {
                if self
                    .concurrency
                    .tracker
                    .pending_count(WorkType::BgUserImportant)
                    > 0
                {
                    return Some(format!("blocking {} queue", WorkType::BgUserImportant));
                }
                if self.concurrency.tracker.pending_count(WorkType::Ej) > 0
                    && self
                        .concurrency
                        .tracker
                        .can_job_start_replacing(
                            WorkTypeSet::of(&[WorkType::Ej]),
                            rj.work_type,
                        )
                        .is_some()
                {
                    return Some(format!("blocking {} queue", WorkType::Ej));
                }
            } else if self.concurrency.tracker.pending_count(WorkType::Ej) > 0 {
                return Some(format!("blocking {} queue", WorkType::Ej));
            } else if rj.bias_at_start == Bias::TopApp {
                let top_ej = self.concurrency.count_top_ej_running();
                if 2 * top_ej > self.concurrency.tracker.max_total() {
                    return Some("prevent top EJ dominance".to_string());
                }
            }
            return None;
        }

        if self.concurrency.tracker.pending_count(rj.work_type) > 0 {
            return Some(format!("blocking {} queue", rj.work_type));
        }

        // Would stopping this job let any pending job start?
        let mut remaining: WorkTypeSet = WorkType::iter().collect();
        for key in self.pending.snapshot() {
            let Some(job) = self.store.get(&key) else { continue };
            let fg = self
                .grace
                .is_foreground_equivalent(job.source_user_id, now_ms);
            let types = work_types_for(job, fg);
            if !types.intersects(remaining) {
                continue;
            }
            if self
                .concurrency
                .tracker
                .can_job_start_replacing(types, rj.work_type)
                .is_some()
            {
                return Some("blocking other pending jobs".to_string());
            }
            remaining.subtract(types);
            if remaining.is_empty() {
                break;
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Completion hand-off
    // ------------------------------------------------------------------

    /// Release the slot of a finished job and settle the counters
    pub(crate) fn release_finished_slot(
        &mut self,
        key: JobKey,
        _now_ms: i64,
    ) -> Option<FinishedSlot> {
        let index = self
            .concurrency
            .slots
            .iter()
            .position(|s| s.job.as_ref().is_some_and(|rj| rj.key == key))?;
        let rj = self.concurrency.slots[index].job.take().unwrap();
        self.concurrency.running_remove(&key);
        self.concurrency.tracker.on_job_finished(rj.work_type);
        self.concurrency
            .pkg_stats
            .adjust_running(rj.user_id, &rj.package, rj.expedited, false);
        debug!("job {} released slot {}", key, self.concurrency.slots[index].id);
        Some(FinishedSlot {
            slot_index: index,
            instance_id: rj.instance_id,
            work_type: rj.work_type,
            package: rj.package,
            preferred_uid: self.concurrency.slots[index].preferred_uid,
            prev_bias: rj.bias_at_start,
        })
    }

    /// Refill a freed slot. A slot holding a preferred uid favors the
    /// highest-bias same-uid pending job (package caps waived only above
    /// the previous occupant's bias); otherwise the highest-bias pending
    /// job that passes caps and counts starts.
    pub(crate) fn assign_on_completion(&mut self, finished: FinishedSlot, now_ms: i64) {
        let slot_index = finished.slot_index;
        let load = self.pending.len() + self.concurrency.running_count();
        let max_total = self.concurrency.tracker.max_total();

        if let Some(pref_uid) = finished.preferred_uid {
            let mut winner: Option<(JobKey, Bias)> = None;
            let mut backup: Option<JobKey> = None;
            for key in self.pending.snapshot() {
                let Some(job) = self.store.get(&key) else { continue };
                let fg = self
                    .grace
                    .is_foreground_equivalent(job.source_user_id, now_ms);
                let types = work_types_for(job, fg);
                let limited =
                    self.concurrency
                        .pkg_stats
                        .is_package_limited(job, load, max_total);
                if key.uid == pref_uid {
                    if limited && job.last_evaluated_bias <= finished.prev_bias {
                        continue;
                    }
                    if winner.is_none_or(|(_, bias)| job.last_evaluated_bias > bias) {
                        winner = Some((key, job.last_evaluated_bias));
                    }
                } else if backup.is_none()
                    && !limited
                    && self.concurrency.tracker.can_job_start(types).is_some()
                {
                    backup = Some(key);
                }
            }
            if let Some((key, _)) = winner {
                self.start_pending_on_slot(slot_index, key, now_ms, true);
            } else if let Some(key) = backup {
                self.concurrency.slots[slot_index].preferred_uid = None;
                self.start_pending_on_slot(slot_index, key, now_ms, false);
            } else {
                self.concurrency.slots[slot_index].preferred_uid = None;
            }
        } else {
            let mut best: Option<(JobKey, Bias)> = None;
            for key in self.pending.snapshot() {
                let Some(job) = self.store.get(&key) else { continue };
                let fg = self
                    .grace
                    .is_foreground_equivalent(job.source_user_id, now_ms);
                let types = work_types_for(job, fg);
                let limited =
                    self.concurrency
                        .pkg_stats
                        .is_package_limited(job, load, max_total);
                if limited || self.concurrency.tracker.can_job_start(types).is_none() {
                    continue;
                }
                if best.is_none_or(|(_, bias)| job.last_evaluated_bias > bias) {
                    best = Some((key, job.last_evaluated_bias));
                }
            }
            if let Some((key, _)) = best {
                self.start_pending_on_slot(slot_index, key, now_ms, false);
            }
        }
    }

    /// Start a single pending job on a specific freed slot, outside a full
    /// assignment pass. With `forced`, the slot was reserved for this uid
    /// and the start proceeds even when the tracker has no headroom.
    fn start_pending_on_slot(&mut self, slot_index: usize, key: JobKey, now_ms: i64, forced: bool) {
        let Some(job) = self.store.get(&key).cloned() else {
            self.pending.remove(&key);
            return;
        };
        let fg = self
            .grace
            .is_foreground_equivalent(job.source_user_id, now_ms);
        let types = work_types_for(&job, fg);
        let for_ej = job.should_treat_as_expedited();
        let work_type = match self.concurrency.tracker.can_job_start(types) {
            Some(wt) => wt,
            None if forced => types.first().unwrap_or(WorkType::Top),
            None => return,
        };
        self.concurrency.tracker.stage_job(work_type, types);
        self.concurrency
            .pkg_stats
            .adjust_staged(job.source_user_id, &job.source_package, for_ej, true);
        let start = PlannedStart {
            slot_index,
            key,
            work_type,
            for_ej,
            user_id: job.source_user_id,
            package: job.source_package.clone(),
        };
        self.execute_start(start, now_ms);
    }

    // ------------------------------------------------------------------
    // Invariant checks (debugging aid; exercised heavily by tests)
    // ------------------------------------------------------------------

    /// Verify the cross-component bookkeeping invariants. Panics on
    /// violation; intended for tests and debug builds.
    pub fn check_invariants(&self) {
        let running = self.concurrency.running_keys();
        for key in &running {
            assert!(
                !self.pending.contains(key),
                "job {key} is both running and pending"
            );
        }
        let occupied = self.concurrency.occupied_count();
        assert_eq!(
            occupied,
            running.len(),
            "slot occupancy and running set disagree"
        );
        for wt in WorkType::iter() {
            let in_slots = self
                .concurrency
                .slots
                .iter()
                .filter(|s| s.job.as_ref().is_some_and(|rj| rj.work_type == wt))
                .count();
            assert_eq!(
                self.concurrency.tracker.running_count(wt),
                in_slots,
                "tracker running count for {wt} out of sync"
            );
        }
    }
}
