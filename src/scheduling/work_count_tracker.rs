//! Work-count tracker: per-work-type slot accounting
//!
//! Given the active [`WorkTypeConfig`] and the observed counts of running,
//! pending and staged (assigned but not yet confirmed started) jobs per
//! work type, the tracker answers "may one more job of this type start
//! now?" and records every decision. All operations are deterministic
//! under a fixed input; counter underflow is floor-clamped and logged, and
//! the periodic [`WorkCountTracker::on_count_done`] rebuild reconverges the
//! state after any transient drift.

use super::types::{WorkType, WorkTypeSet};
use strum::IntoEnumIterator;
use tracing::{debug, error};

/// Slot thresholds for one (screen state, memory trim level) combination
#[derive(Debug, Clone)]
pub struct WorkTypeConfig {
    /// Identifier used in logs and config keys, e.g. `on_normal`
    pub id: String,
    /// Total number of slots this device state may use
    pub max_total: usize,
    /// Slots held back for each work type even when others have demand
    pub min_reserved: [usize; WorkType::COUNT],
    /// Hard per-type ceiling
    pub max_allowed: [usize; WorkType::COUNT],
}

impl WorkTypeConfig {
    /// Build a config, clamping every threshold into its documented range:
    /// `max_total` in `[1, limit]`, each `max_allowed` in `[1, max_total]`,
    /// `min_reserved[TOP] >= 1`, and `sum(min_reserved) <= max_total`
    /// (excess trimmed from the least important types first).
    pub fn new(
        id: impl Into<String>,
        limit: usize,
        max_total: usize,
        mut min_reserved: [usize; WorkType::COUNT],
        mut max_allowed: [usize; WorkType::COUNT],
    ) -> Self {
        let id = id.into();
        let max_total = max_total.clamp(1, limit);
        min_reserved[WorkType::Top.index()] = min_reserved[WorkType::Top.index()].max(1);
        for wt in WorkType::iter() {
            max_allowed[wt.index()] = max_allowed[wt.index()].clamp(1, max_total);
            min_reserved[wt.index()] = min_reserved[wt.index()].min(max_allowed[wt.index()]);
        }
        let mut reserved_total: usize = min_reserved.iter().sum();
        if reserved_total > max_total {
            debug!(
                "config {}: reserved slot total {} exceeds max_total {}, trimming",
                id, reserved_total, max_total
            );
            for wt in WorkType::iter().rev() {
                let idx = wt.index();
                let floor = if wt == WorkType::Top { 1 } else { 0 };
                while reserved_total > max_total && min_reserved[idx] > floor {
                    min_reserved[idx] -= 1;
                    reserved_total -= 1;
                }
            }
        }
        Self {
            id,
            max_total,
            min_reserved,
            max_allowed,
        }
    }
}

/// Per-work-type counters and reservation state
#[derive(Debug, Default)]
pub struct WorkCountTracker {
    cfg_max_total: usize,
    cfg_min_reserved: [usize; WorkType::COUNT],
    cfg_max_allowed: [usize; WorkType::COUNT],

    running: [usize; WorkType::COUNT],
    pending: [usize; WorkType::COUNT],
    staging: [usize; WorkType::COUNT],

    actually_reserved: [usize; WorkType::COUNT],
    /// Slots not committed to any specific work type. May go negative
    /// while the slot table is transiently over capacity.
    unspecialized_remaining: i32,
}

impl WorkCountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the thresholds with a new device-state config
    pub fn set_config(&mut self, cfg: &WorkTypeConfig) {
        self.cfg_max_total = cfg.max_total;
        self.cfg_min_reserved = cfg.min_reserved;
        self.cfg_max_allowed = cfg.max_allowed;
        self.unspecialized_remaining = cfg.max_total as i32;
        for wt in WorkType::iter() {
            let idx = wt.index();
            self.unspecialized_remaining -=
                self.running[idx].max(self.cfg_min_reserved[idx]) as i32;
        }
    }

    /// Zero the pending counts and reservations ahead of a recount.
    /// Staging counts survive; they are reset separately after the
    /// assignment pass completes.
    pub fn reset_counts(&mut self) {
        self.pending = [0; WorkType::COUNT];
        self.actually_reserved = [0; WorkType::COUNT];
    }

    /// Clear staging counts after an assignment pass has dispatched all
    /// starts
    pub fn reset_staging_counts(&mut self) {
        self.staging = [0; WorkType::COUNT];
    }

    /// Zero the running counts ahead of a rebuild from the slot table.
    /// Together with [`Self::increment_running`] this re-establishes
    /// consistency even after a transient counter drift.
    pub fn reset_running_counts(&mut self) {
        self.running = [0; WorkType::COUNT];
    }

    pub fn increment_running(&mut self, work_type: WorkType) {
        self.running[work_type.index()] += 1;
    }

    pub fn increment_pending(&mut self, types: WorkTypeSet) {
        for wt in types.iter() {
            self.pending[wt.index()] += 1;
        }
    }

    pub fn decrement_pending(&mut self, types: WorkTypeSet) {
        let mut members = 0;
        for wt in types.iter() {
            members += 1;
            let idx = wt.index();
            if self.pending[idx] == 0 {
                debug!("pending count for {} already 0 on decrement", wt);
            } else {
                self.pending[idx] -= 1;
            }
        }
        if members > 1 {
            for wt in types.iter() {
                self.maybe_adjust_reservations(wt);
            }
        }
    }

    /// Record that a job was handed to a slot as `work_type` but has not
    /// been confirmed started by the runner yet.
    pub fn stage_job(&mut self, work_type: WorkType, all_types: WorkTypeSet) {
        let idx = work_type.index();
        self.staging[idx] += 1;
        self.decrement_pending(all_types);
        if self.staging[idx] + self.running[idx] > self.actually_reserved[idx] {
            self.unspecialized_remaining -= 1;
        }
    }

    pub fn on_job_started(&mut self, work_type: WorkType) {
        let idx = work_type.index();
        self.running[idx] += 1;
        if self.staging[idx] == 0 {
            error!("staging count for {} already 0 when job started", work_type);
        } else {
            self.staging[idx] -= 1;
        }
    }

    pub fn on_job_finished(&mut self, work_type: WorkType) {
        let idx = work_type.index();
        if self.running[idx] == 0 {
            error!("running count for {} already 0 when job finished", work_type);
        } else {
            self.running[idx] -= 1;
        }
        self.maybe_adjust_reservations(work_type);
    }

    /// A staged job never started (the runner refused it)
    pub fn on_staged_job_failed(&mut self, work_type: WorkType) {
        let idx = work_type.index();
        if self.staging[idx] == 0 {
            error!(
                "staging count for {} already 0 when staged job failed",
                work_type
            );
        } else {
            self.staging[idx] -= 1;
        }
        self.maybe_adjust_reservations(work_type);
    }

    /// Assign reservations once the pending counts have been refreshed.
    ///
    /// Three passes over the types in importance order: account for what
    /// is already running, fill toward each type's minimum reservation,
    /// then fill toward each type's cap. Fills are bounded by that type's
    /// observed demand and by the unspecialized slots remaining.
    pub fn on_count_done(&mut self) {
        self.unspecialized_remaining = self.cfg_max_total as i32;
        for wt in WorkType::iter() {
            let idx = wt.index();
            self.actually_reserved[idx] = self.running[idx];
            self.unspecialized_remaining -= self.running[idx] as i32;
        }
        for wt in WorkType::iter() {
            let idx = wt.index();
            let demand = self.running[idx] + self.pending[idx];
            let target = self.cfg_min_reserved[idx].min(demand);
            let fill = (target as i32 - self.actually_reserved[idx] as i32)
                .clamp(0, self.unspecialized_remaining.max(0));
            self.actually_reserved[idx] += fill as usize;
            self.unspecialized_remaining -= fill;
        }
        for wt in WorkType::iter() {
            let idx = wt.index();
            let demand = self.running[idx] + self.pending[idx];
            let target = self.cfg_max_allowed[idx].min(demand);
            let fill = (target as i32 - self.actually_reserved[idx] as i32)
                .clamp(0, self.unspecialized_remaining.max(0));
            self.actually_reserved[idx] += fill as usize;
            self.unspecialized_remaining -= fill;
        }
    }

    /// Pick the first acceptable work type that may start one more job,
    /// in importance order.
    pub fn can_job_start(&self, types: WorkTypeSet) -> Option<WorkType> {
        for wt in types.iter() {
            let idx = wt.index();
            let max_allowed = self.cfg_max_allowed[idx].min(self.cfg_max_total) as i32;
            let available =
                max_allowed.min(self.actually_reserved[idx] as i32 + self.unspecialized_remaining);
            if ((self.running[idx] + self.staging[idx]) as i32) < available {
                return Some(wt);
            }
        }
        None
    }

    /// [`Self::can_job_start`] under the assumption that one currently
    /// running job of `replacing` ends first.
    pub fn can_job_start_replacing(
        &mut self,
        types: WorkTypeSet,
        replacing: WorkType,
    ) -> Option<WorkType> {
        let idx = replacing.index();
        if self.running[idx] == 0 {
            return self.can_job_start(types);
        }
        self.running[idx] -= 1;
        self.unspecialized_remaining += 1;
        let result = self.can_job_start(types);
        self.running[idx] += 1;
        self.unspecialized_remaining -= 1;
        result
    }

    pub fn is_over_type_limit(&self, work_type: WorkType) -> bool {
        self.running[work_type.index()] > self.cfg_max_allowed[work_type.index()]
    }

    /// Shrink an over-sized reservation down to current demand, donating
    /// freed slots to the most important type still short of its cap, and
    /// returning any leftover to the unspecialized pool.
    pub fn maybe_adjust_reservations(&mut self, work_type: WorkType) {
        let idx = work_type.index();
        let demand = self.cfg_min_reserved[idx]
            .max(self.running[idx] + self.staging[idx] + self.pending[idx]);
        if demand >= self.actually_reserved[idx] {
            return;
        }
        let mut extra = self.actually_reserved[idx] - demand;
        self.actually_reserved[idx] = demand;
        for other in WorkType::iter() {
            if other == work_type || extra == 0 {
                continue;
            }
            let oidx = other.index();
            let other_demand = self.running[oidx] + self.staging[oidx] + self.pending[oidx];
            let cap = self.cfg_max_allowed[oidx].min(other_demand);
            if self.actually_reserved[oidx] < cap {
                let give = extra.min(cap - self.actually_reserved[oidx]);
                self.actually_reserved[oidx] += give;
                extra -= give;
            }
        }
        self.unspecialized_remaining += extra as i32;
    }

    pub fn running_count(&self, work_type: WorkType) -> usize {
        self.running[work_type.index()]
    }

    pub fn pending_count(&self, work_type: WorkType) -> usize {
        self.pending[work_type.index()]
    }

    pub fn staging_count(&self, work_type: WorkType) -> usize {
        self.staging[work_type.index()]
    }

    pub fn total_running(&self) -> usize {
        self.running.iter().sum()
    }

    pub fn max_total(&self) -> usize {
        self.cfg_max_total
    }

    #[cfg(test)]
    fn reserved_plus_unspecialized(&self) -> i32 {
        self.actually_reserved.iter().sum::<usize>() as i32 + self.unspecialized_remaining
    }
}
