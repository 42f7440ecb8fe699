// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The sort action for one matched parcel: wait for the parcel to reach
//! the arm, swing, and plan the reset. Owns the consecutive same-chute
//! optimization that defers the reset for the next parcel.

use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::Side;
use crate::engine::EngineState;
use crate::error::SortError;
use crate::event::SortEvent;
use crate::parcel::{Parcel, SortState};
use crate::pendulum::Direction;

/// Settle time between an immediate reset and the following swing.
const INTER_COMMAND_BRIDGE: Duration = Duration::from_millis(20);

/// Head start granted on top of the observed trigger gap when waiting
/// for a same-chute follower.
const LOOKAHEAD_SLACK: Duration = Duration::from_millis(100);

/// A waiting pendulum never waits less than this.
const MIN_WAIT: Duration = Duration::from_millis(500);

/// Per-pendulum waiting timers; arming a new one cancels the old.
#[derive(Debug, Default)]
pub(crate) struct WaitingTimers {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl WaitingTimers {
    pub(crate) fn cancel(&self, pe: &str) {
        if let Some(guard) = self.inner.lock().remove(pe) {
            guard.cancel();
        }
    }

    fn arm(&self, pe: &str, guard: CancellationToken) {
        if let Some(prev) = self.inner.lock().insert(pe.to_owned(), guard) {
            prev.cancel();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let mut timers = self.inner.lock();
        for (_, guard) in timers.drain() {
            guard.cancel();
        }
    }
}

enum SwingPlan {
    /// The arm already points the right way; no command.
    AlreadyAligned,
    /// A waiting pendulum's expected parcel arrived; no command.
    ConsumeWaiting,
    /// Neutral arm: swing directly.
    Direct,
    /// Arm is elsewhere: immediate reset, settle, then swing.
    ResetFirst,
}

/// Run the full sort action for `parcel` on `pe`.
///
/// Every exit path removes the parcel from the processing set, drives it
/// to a terminal state, and emits exactly one `SortingCompleted`.
pub(crate) async fn execute_sort(
    state: Arc<EngineState>,
    mut parcel: Parcel,
    pe: String,
    signal_at: Instant,
) {
    match run(&state, &parcel, &pe, signal_at).await {
        Ok(()) => {
            state.table.end_processing(&parcel.barcode);
            parcel.advance(SortState::Sorted);
            state.sink.publish(SortEvent::SortingCompleted { parcel });
        }
        Err(e) => {
            tracing::warn!(
                pe = %pe,
                index = parcel.index,
                barcode = %parcel.barcode,
                err = %e,
                "sort action failed"
            );
            recover(&state, &pe);
            state.table.end_processing(&parcel.barcode);
            parcel.advance(SortState::Error);
            state.sink.publish(SortEvent::SortingCompleted { parcel });
        }
    }
}

async fn run(
    state: &Arc<EngineState>,
    parcel: &Parcel,
    pe: &str,
    signal_at: Instant,
) -> Result<(), SortError> {
    let pe_cfg = state.config.sort_pe(pe).ok_or(SortError::UnknownDevice)?;
    if !state.scheduler.is_connected(pe) {
        return Err(SortError::ClientUnavailable);
    }

    // Let the parcel travel from the photoelectric to the arm.
    let over_arm = tokio::time::Instant::from_std(signal_at + pe_cfg.sorting_delay());
    tokio::time::sleep_until(over_arm).await;

    let side = Side::for_slot(parcel.target_chute);

    let plan = state
        .pendulums
        .with(pe, |p| match p.direction() {
            Direction::WaitingForNext { slot } if slot == parcel.target_chute => {
                p.resume_swing(side);
                SwingPlan::ConsumeWaiting
            }
            Direction::Swinging(current) if current == side => SwingPlan::AlreadyAligned,
            Direction::Reset => SwingPlan::Direct,
            _ => SwingPlan::ResetFirst,
        })
        .ok_or(SortError::UnknownDevice)?;

    match plan {
        SwingPlan::ConsumeWaiting => {
            // The bet paid off; the waiting timer must not fire a reset.
            state.waiting_timers.cancel(pe);
            tracing::debug!(pe = %pe, slot = parcel.target_chute, "arm already staged, swing skipped");
        }
        SwingPlan::AlreadyAligned => {
            tracing::debug!(pe = %pe, side = %side, "arm already aligned, swing skipped");
        }
        SwingPlan::Direct => {
            state.scheduler.send_now(pe, Bytes::from_static(state.commands.swing(side))).await?;
            let _ = state.pendulums.with(pe, |p| p.swing(side));
            state.pendulums.record_swing(parcel.target_chute);
        }
        SwingPlan::ResetFirst => {
            // An interrupting parcel may arrive while the arm is still
            // out or a reset is pending; neutralize first.
            state.waiting_timers.cancel(pe);
            let reset_side = state.pendulums.reset_side();
            state
                .scheduler
                .send_now(pe, Bytes::from_static(state.commands.reset(reset_side)))
                .await?;
            state.pendulums.force_reset(pe);
            tokio::time::sleep(INTER_COMMAND_BRIDGE).await;
            state.scheduler.send_now(pe, Bytes::from_static(state.commands.swing(side))).await?;
            let _ = state.pendulums.with(pe, |p| p.swing(side));
            state.pendulums.record_swing(parcel.target_chute);
        }
    }

    plan_reset(state, parcel, pe);
    Ok(())
}

/// Decide between deferring the reset for a same-chute follower and
/// scheduling the delayed reset.
fn plan_reset(state: &Arc<EngineState>, parcel: &Parcel, pe: &str) {
    let Some(pe_cfg) = state.config.sort_pe(pe) else { return };

    if let Some(gap) = same_chute_follower_gap(state, parcel) {
        let wait = cmp::max(gap + LOOKAHEAD_SLACK, MIN_WAIT);
        let _ = state.pendulums.with(pe, |p| p.wait_for_next(parcel.target_chute));
        arm_waiting_timer(state, pe, wait);
        tracing::debug!(
            pe = %pe,
            slot = parcel.target_chute,
            wait_ms = wait.as_millis() as u64,
            "reset deferred for same-chute follower"
        );
        return;
    }

    let reset_side = state.pendulums.reset_side();
    let Some(epoch) = state.pendulums.with(pe, |p| {
        p.begin_reset();
        p.epoch()
    }) else {
        return;
    };

    let gate_state = Arc::clone(state);
    let gate_pe = pe.to_owned();
    let done_state = Arc::clone(state);
    let done_pe = pe.to_owned();
    state.scheduler.schedule_delayed_reset(
        pe,
        Bytes::from_static(state.commands.reset(reset_side)),
        pe_cfg.reset_delay(),
        Box::new(move || gate_state.pendulums.epoch(&gate_pe) == Some(epoch)),
        Box::new(move |result| match result {
            Ok(()) => {
                done_state.pendulums.complete_reset_if(&done_pe, epoch);
            }
            Err(e) => {
                tracing::warn!(pe = %done_pe, err = %e, "delayed reset failed, forcing software reset");
                done_state.pendulums.force_reset(&done_pe);
            }
        }),
    );
}

/// The trigger-time gap to the very next pending parcel, when it targets
/// the same chute and follows closely enough to hold the arm for it.
fn same_chute_follower_gap(state: &EngineState, parcel: &Parcel) -> Option<Duration> {
    let next = state.table.peek_next_pending(parcel.index)?;
    if next.target_chute != parcel.target_chute {
        return None;
    }
    let gap = next.trigger_at?.checked_duration_since(parcel.trigger_at()?)?;
    if gap <= state.config.continuous_sort_max_interval() + LOOKAHEAD_SLACK {
        Some(gap)
    } else {
        None
    }
}

/// Arm the per-pendulum waiting timer; a previous timer is cancelled.
///
/// On expiry: if the pendulum is still waiting, the bet lost; restore
/// neutral with an immediate reset.
fn arm_waiting_timer(state: &Arc<EngineState>, pe: &str, wait: Duration) {
    let guard = CancellationToken::new();
    state.waiting_timers.arm(pe, guard.clone());

    let state = Arc::clone(state);
    let pe = pe.to_owned();
    tokio::spawn(async move {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = state.shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        if matches!(state.pendulums.direction(&pe), Some(Direction::WaitingForNext { .. })) {
            tracing::debug!(pe = %pe, "waiting timer expired, restoring neutral");
            force_immediate_reset(&state, &pe).await;
        }
    });
}

/// Send a reset right now, direction by the `last_slot` parity rule, and
/// leave the pendulum neutral in software whatever the wire said.
pub(crate) async fn force_immediate_reset(state: &Arc<EngineState>, pe: &str) {
    let frame = Bytes::from_static(state.commands.reset(state.pendulums.reset_side()));
    if let Err(e) = state.scheduler.send_now(pe, frame).await {
        tracing::warn!(pe = %pe, err = %e, "immediate reset send failed");
    }
    state.pendulums.force_reset(pe);
}

/// Error-path recovery: software-reset the pendulum and try a physical
/// reset in the background, best effort.
fn recover(state: &Arc<EngineState>, pe: &str) {
    state.pendulums.force_reset(pe);
    let frame = Bytes::from_static(state.commands.reset(state.pendulums.reset_side()));
    let scheduler = Arc::clone(&state.scheduler);
    let pe = pe.to_owned();
    tokio::spawn(async move {
        if let Err(e) = scheduler.send_now(&pe, frame).await {
            tracing::debug!(pe = %pe, err = %e, "best-effort reset failed");
        }
    });
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
