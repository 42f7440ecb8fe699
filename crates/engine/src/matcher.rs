// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parcel selection on a sort-PE rising edge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::EngineState;
use crate::executor;
use crate::parcel::{Parcel, SortState};
use crate::pendulum::Direction;
use crate::table::ProcessingEntry;

/// Tolerance added on both ends of a PE's match window.
const MATCH_SLACK: Duration = Duration::from_millis(10);

/// Handle one sort rising edge: match a parcel and hand it to the action
/// executor, or restore neutral if a waiting pendulum's bet lost.
pub(crate) async fn on_sort_signal(state: &Arc<EngineState>, pe: &str, at: Instant) {
    match match_sort_signal(state, pe, at) {
        Some(parcel) => {
            tracing::debug!(pe = %pe, index = parcel.index, barcode = %parcel.barcode, "matched parcel");
            let state = Arc::clone(state);
            let pe = pe.to_owned();
            // One action executor task per in-flight parcel.
            tokio::spawn(async move {
                executor::execute_sort(state, parcel, pe, at).await;
            });
        }
        None => {
            if matches!(state.pendulums.direction(pe), Some(Direction::WaitingForNext { .. })) {
                tracing::debug!(pe = %pe, "waiting bet lost, restoring neutral");
                executor::force_immediate_reset(state, pe).await;
            }
        }
    }
}

/// Scan pending parcels in ascending index order and consume the first
/// eligible one for this PE.
///
/// Eligibility: trigger stamped, still `Pending`, chute owned by this PE,
/// barcode not already processing, timeout still armed, and the
/// trigger-to-signal delay inside the PE's window (± slack).
pub(crate) fn match_sort_signal(state: &EngineState, pe: &str, now: Instant) -> Option<Parcel> {
    let window = state.config.sort_pe(pe)?.window;

    let mut pending = state.table.pending.lock();
    let mut processing = state.table.processing.lock();
    let timers = state.table.timers.lock();

    let mut matched_index = None;
    for (&index, parcel) in pending.iter() {
        let Some(trigger_at) = parcel.trigger_at() else { continue };
        if parcel.state() != SortState::Pending {
            continue;
        }
        if !state.topology.slot_belongs_to_pe(parcel.target_chute, pe) {
            continue;
        }
        if processing.contains_key(&parcel.barcode) {
            continue;
        }
        if !timers.get(&index).map(|g| !g.is_cancelled()).unwrap_or(false) {
            continue;
        }
        let delay = now.saturating_duration_since(trigger_at);
        if !window.contains(delay, MATCH_SLACK) {
            continue;
        }
        matched_index = Some(index);
        break;
    }

    let index = matched_index?;
    drop(timers);

    let mut parcel = pending.remove(&index)?;
    parcel.advance(SortState::Processing);
    processing.insert(
        parcel.barcode.clone(),
        ProcessingEntry { started_at: now, pe: pe.to_owned() },
    );
    drop(processing);
    drop(pending);

    state.table.disarm_timer(index);
    Some(parcel)
}

#[cfg(test)]
#[path = "matcher_tests.rs"]
mod tests;
