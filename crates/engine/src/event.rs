// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain events published to the injected sink.

use std::time::Instant;

use crate::parcel::Parcel;

/// Timestamped domain events emitted by the engine.
#[derive(Debug, Clone)]
pub enum SortEvent {
    /// A rising edge on the trigger photoelectric.
    TriggerSignal { at: Instant },
    /// A rising edge on a sort photoelectric.
    SortingSignal { pe: String, at: Instant },
    /// A parcel record arrived at ingress.
    PackageProcessing { at: Instant },
    /// A parcel reached its terminal state. Exactly one per parcel that
    /// entered the engine.
    SortingCompleted { parcel: Parcel },
    /// A device link came up or went down.
    DeviceConnectionChanged { device: String, connected: bool },
}

impl SortEvent {
    /// Wire-format tag for this event, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TriggerSignal { .. } => "trigger_signal",
            Self::SortingSignal { .. } => "sorting_signal",
            Self::PackageProcessing { .. } => "package_processing",
            Self::SortingCompleted { .. } => "sorting_completed",
            Self::DeviceConnectionChanged { .. } => "device_connection_changed",
        }
    }
}

/// Destination for domain events.
///
/// The engine publishes synchronously from its task contexts; sinks must
/// be cheap and non-blocking. Tests use an in-memory collecting sink.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SortEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: SortEvent) {}
}
