// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared parcel bookkeeping: the pending table, the processing set, and
//! per-parcel timeout guards.
//!
//! A parcel lives in exactly one place: the pending map until it is
//! matched or times out, then (by barcode) the processing set until its
//! sort action finishes. Lock order is pending → processing → timers;
//! no lock is held across an await.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::parcel::{Parcel, SortState};

/// Processing-set entry: which PE took the parcel and when.
#[derive(Debug, Clone)]
pub struct ProcessingEntry {
    pub started_at: Instant,
    pub pe: String,
}

/// Look-ahead view of the next pending parcel.
#[derive(Debug, Clone, Copy)]
pub struct PendingPeek {
    pub index: u64,
    pub target_chute: i32,
    pub trigger_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ParcelTable {
    pub(crate) pending: Mutex<BTreeMap<u64, Parcel>>,
    pub(crate) processing: Mutex<HashMap<String, ProcessingEntry>>,
    pub(crate) timers: Mutex<HashMap<u64, CancellationToken>>,
}

impl ParcelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a barcode is pending or processing.
    pub fn is_in_flight(&self, barcode: &str) -> bool {
        if self.pending.lock().values().any(|p| p.barcode == barcode) {
            return true;
        }
        self.processing.lock().contains_key(barcode)
    }

    pub fn insert_pending(&self, parcel: Parcel) {
        self.pending.lock().insert(parcel.index, parcel);
    }

    pub fn remove_pending(&self, index: u64) -> Option<Parcel> {
        self.pending.lock().remove(&index)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.lock().len()
    }

    /// The pending parcel with the smallest index greater than `index`.
    pub fn peek_next_pending(&self, index: u64) -> Option<PendingPeek> {
        let pending = self.pending.lock();
        let (&next_index, parcel) =
            pending.range((std::ops::Bound::Excluded(index), std::ops::Bound::Unbounded)).next()?;
        Some(PendingPeek {
            index: next_index,
            target_chute: parcel.target_chute,
            trigger_at: parcel.trigger_at(),
        })
    }

    pub fn end_processing(&self, barcode: &str) -> bool {
        self.processing.lock().remove(barcode).is_some()
    }

    /// Remove processing entries older than `max_age`. Dead-man cleanup:
    /// entries expire whatever the pendulum is doing.
    pub fn reap_processing(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut processing = self.processing.lock();
        let expired: Vec<String> = processing
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.started_at) > max_age)
            .map(|(barcode, _)| barcode.clone())
            .collect();
        for barcode in &expired {
            processing.remove(barcode);
        }
        expired
    }

    /// Counts of pending parcels by lifecycle state, for the audit log.
    pub fn pending_state_counts(&self) -> HashMap<SortState, usize> {
        let mut counts = HashMap::new();
        for parcel in self.pending.lock().values() {
            *counts.entry(parcel.state()).or_insert(0) += 1;
        }
        counts
    }

    // -- Per-parcel timeout guards -------------------------------------------

    /// Create and store the timeout guard for a parcel. Cancelling the
    /// returned token disarms the timeout.
    pub fn arm_timer(&self, index: u64) -> CancellationToken {
        let guard = CancellationToken::new();
        self.timers.lock().insert(index, guard.clone());
        guard
    }

    /// Cancel and drop a parcel's timeout guard.
    pub fn disarm_timer(&self, index: u64) -> bool {
        match self.timers.lock().remove(&index) {
            Some(guard) => {
                guard.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the guard entry without cancelling, used by the timeout task
    /// itself once its sleep has elapsed.
    pub fn release_timer(&self, index: u64) {
        self.timers.lock().remove(&index);
    }

    pub fn timer_armed(&self, index: u64) -> bool {
        self.timers.lock().get(&index).map(|g| !g.is_cancelled()).unwrap_or(false)
    }

    /// Cancel and drop every timeout guard (engine stop).
    pub fn clear_timers(&self) {
        let mut timers = self.timers.lock();
        for (_, guard) in timers.drain() {
            guard.cancel();
        }
    }
}

#[cfg(test)]
#[path = "table_tests.rs"]
mod tests;
