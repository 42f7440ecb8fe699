// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

/// Lifecycle state of a parcel inside the engine.
///
/// `Sorted` and `Error` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortState {
    Pending,
    Processing,
    Sorted,
    Error,
}

impl SortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sorted => "sorted",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sorted | Self::Error)
    }
}

impl std::fmt::Display for SortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the lifecycle graph permits `from -> to`.
///
/// Straight-through parcels go `Pending -> Sorted` directly; timed-out
/// parcels go `Pending -> Error` without ever processing.
pub fn can_advance(from: SortState, to: SortState) -> bool {
    use SortState::*;
    matches!(
        (from, to),
        (Pending, Processing) | (Pending, Sorted) | (Pending, Error) | (Processing, Sorted)
            | (Processing, Error)
    )
}

/// A parcel record, fully populated by the external scanner except for
/// the trigger stamp and lifecycle state, which the engine owns.
#[derive(Debug, Clone)]
pub struct Parcel {
    /// Monotonically increasing, unique within a run.
    pub index: u64,
    /// Unique among in-flight parcels; may repeat across time.
    pub barcode: String,
    /// Destination chute. Zero or negative means no sort decision.
    pub target_chute: i32,
    trigger_at: Option<Instant>,
    processing_time: Option<Duration>,
    state: SortState,
}

impl Parcel {
    pub fn new(index: u64, barcode: impl Into<String>, target_chute: i32) -> Self {
        Self {
            index,
            barcode: barcode.into(),
            target_chute,
            trigger_at: None,
            processing_time: None,
            state: SortState::Pending,
        }
    }

    /// Attach a trigger stamp supplied by the upstream scanner, for
    /// records whose trigger was correlated before ingress. Write-once:
    /// an already-stamped record keeps its original instant.
    pub fn with_trigger_at(mut self, at: Instant) -> Self {
        if self.trigger_at.is_none() {
            self.trigger_at = Some(at);
        }
        self
    }

    pub fn state(&self) -> SortState {
        self.state
    }

    pub fn trigger_at(&self) -> Option<Instant> {
        self.trigger_at
    }

    pub fn processing_time(&self) -> Option<Duration> {
        self.processing_time
    }

    /// Record the trigger instant and derive the processing time.
    ///
    /// The trigger stamp is write-once; a second call keeps the original
    /// instant and only fills a missing processing time.
    pub fn stamp_trigger(&mut self, trigger_at: Instant, now: Instant) {
        if self.trigger_at.is_none() {
            self.trigger_at = Some(trigger_at);
        }
        if self.processing_time.is_none() {
            if let Some(at) = self.trigger_at {
                self.processing_time = Some(now.saturating_duration_since(at));
            }
        }
    }

    /// Reset the lifecycle to `Pending` at ingress, whatever the caller
    /// left in the record.
    pub fn force_pending(&mut self) {
        self.state = SortState::Pending;
    }

    /// Advance the lifecycle; illegal transitions are ignored and reported.
    pub fn advance(&mut self, to: SortState) -> bool {
        if !can_advance(self.state, to) {
            return false;
        }
        self.state = to;
        true
    }
}

#[cfg(test)]
#[path = "parcel_tests.rs"]
mod tests;
