// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-diverter state machine and the process-wide swing memory.
//!
//! `direction` tracks where the arm is believed to be; it is advisory
//! while resetting or waiting. The authoritative source for which side to
//! reset from is `last_slot`: a left-reset is issued iff the last swung
//! slot is odd.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::command::Side;

/// Arm position / activity of one pendulum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Neutral, ready to swing.
    Reset,
    /// Arm held toward one side.
    Swinging(Side),
    /// A reset command is pending or in flight.
    Resetting,
    /// Reset deferred: the next parcel is expected to need the same slot.
    WaitingForNext { slot: i32 },
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Swinging(Side::Left) => "swinging_left",
            Self::Swinging(Side::Right) => "swinging_right",
            Self::Resetting => "resetting",
            Self::WaitingForNext { .. } => "waiting_for_next",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one pendulum. Mutated only by the action executor and the
/// command scheduler callbacks for its PE.
#[derive(Debug)]
pub struct Pendulum {
    direction: Direction,
    previous: Direction,
    /// Bumped on every transition. Delayed work captures the epoch at
    /// scheduling time and re-checks it before acting, so a superseded
    /// reset or completion never clobbers a newer state.
    epoch: u64,
}

impl Default for Pendulum {
    fn default() -> Self {
        Self { direction: Direction::Reset, previous: Direction::Reset, epoch: 0 }
    }
}

impl Pendulum {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn previous(&self) -> Direction {
        self.previous
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn set(&mut self, next: Direction) {
        self.previous = std::mem::replace(&mut self.direction, next);
        self.epoch += 1;
    }

    /// A swing command was acknowledged by the device.
    pub fn swing(&mut self, side: Side) {
        self.set(Direction::Swinging(side));
    }

    /// A waiting pendulum's bet paid off: the matching parcel arrived and
    /// the arm is already where it needs to be.
    pub fn resume_swing(&mut self, side: Side) {
        self.set(Direction::Swinging(side));
    }

    /// A delayed reset has been scheduled.
    pub fn begin_reset(&mut self) {
        self.set(Direction::Resetting);
    }

    /// A reset command was acknowledged; the arm is neutral.
    pub fn complete_reset(&mut self) {
        self.set(Direction::Reset);
    }

    /// Defer the reset because the next parcel targets the same chute.
    pub fn wait_for_next(&mut self, slot: i32) {
        self.set(Direction::WaitingForNext { slot });
    }

    /// Software-only reset from any state, used when the physical command
    /// cannot be sent or its outcome is unknown.
    pub fn force_reset(&mut self) {
        self.set(Direction::Reset);
    }
}

// -- Table --------------------------------------------------------------------

/// All pendulum states keyed by PE name, plus the process-wide `last_slot`.
#[derive(Debug, Default)]
pub struct PendulumTable {
    inner: RwLock<HashMap<String, Arc<Mutex<Pendulum>>>>,
    last_slot: AtomicI32,
}

impl PendulumTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pe: &str) {
        self.inner.write().entry(pe.to_owned()).or_default();
    }

    fn entry(&self, pe: &str) -> Option<Arc<Mutex<Pendulum>>> {
        self.inner.read().get(pe).map(Arc::clone)
    }

    /// Run `f` against the pendulum for `pe` under its lock.
    pub fn with<R>(&self, pe: &str, f: impl FnOnce(&mut Pendulum) -> R) -> Option<R> {
        let entry = self.entry(pe)?;
        let mut pendulum = entry.lock();
        Some(f(&mut pendulum))
    }

    pub fn direction(&self, pe: &str) -> Option<Direction> {
        self.with(pe, |p| p.direction())
    }

    pub fn epoch(&self, pe: &str) -> Option<u64> {
        self.with(pe, |p| p.epoch())
    }

    /// Software force-reset regardless of current state.
    pub fn force_reset(&self, pe: &str) -> bool {
        self.with(pe, |p| p.force_reset()).is_some()
    }

    /// Complete a reset only if no transition happened since `epoch` was
    /// captured; a stale completion is dropped.
    pub fn complete_reset_if(&self, pe: &str, epoch: u64) -> bool {
        self.with(pe, |p| {
            if p.epoch() == epoch && p.direction() == Direction::Resetting {
                p.complete_reset();
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Record a successful swing. `last_slot` is process-wide: any later
    /// reset picks its direction from this slot's parity.
    pub fn record_swing(&self, slot: i32) {
        self.last_slot.store(slot, Ordering::Relaxed);
    }

    pub fn last_slot(&self) -> i32 {
        self.last_slot.load(Ordering::Relaxed)
    }

    /// Reset direction by the parity rule: odd last slot resets from the
    /// left, even from the right.
    pub fn reset_side(&self) -> Side {
        Side::for_slot(self.last_slot())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "pendulum_tests.rs"]
mod tests;
