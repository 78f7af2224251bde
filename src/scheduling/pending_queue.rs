//! Pending queue: jobs admitted by the readiness sweep, awaiting a slot
//!
//! The queue preserves insertion order as produced by the sweep; the
//! assignment pass walks it front to back and never reorders for fairness
//! (fairness comes from work-type reservations and per-package caps).

use super::types::JobKey;
use std::collections::HashSet;
use tracing::debug;

/// Insertion-ordered queue of pending jobs with O(1) membership checks
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: Vec<JobKey>,
    members: HashSet<JobKey>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Returns false (and leaves the queue untouched) if the
    /// job is already pending.
    pub fn add(&mut self, key: JobKey) -> bool {
        if !self.members.insert(key) {
            debug!("job {} is already pending, not re-adding", key);
            return false;
        }
        self.order.push(key);
        true
    }

    pub fn add_all<I: IntoIterator<Item = JobKey>>(&mut self, keys: I) {
        for key in keys {
            self.add(key);
        }
    }

    /// Remove a job wherever it sits in the queue. Returns whether it was
    /// present.
    pub fn remove(&mut self, key: &JobKey) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        true
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate in insertion order. Each call restarts from the front.
    pub fn iter(&self) -> impl Iterator<Item = &JobKey> {
        self.order.iter()
    }

    /// Snapshot of the current order, for walks that mutate the queue
    pub fn snapshot(&self) -> Vec<JobKey> {
        self.order.clone()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
