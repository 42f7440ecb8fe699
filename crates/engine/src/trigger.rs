// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded queue of recent trigger instants with windowed match-and-consume.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::TimeWindow;

/// Triggers older than the match window serve no purpose; a short queue
/// bounds how far a burst can run ahead of ingress.
const TRIGGER_QUEUE_CAP: usize = 5;

/// FIFO of recent trigger timestamps, all operations under one mutex.
#[derive(Debug, Default)]
pub struct TriggerQueue {
    inner: Mutex<VecDeque<Instant>>,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trigger instant, evicting the oldest beyond capacity.
    pub fn enqueue(&self, at: Instant) {
        let mut queue = self.inner.lock();
        queue.push_back(at);
        while queue.len() > TRIGGER_QUEUE_CAP {
            queue.pop_front();
            tracing::warn!(cap = TRIGGER_QUEUE_CAP, "trigger queue overflow, dropped oldest");
        }
    }

    /// Find and consume the first trigger whose age at `now` falls inside
    /// `window`.
    ///
    /// Entries older than the window are discarded as stale; entries
    /// younger than the window stay queued for a later parcel. Later
    /// in-range entries are preserved.
    pub fn match_and_consume(&self, now: Instant, window: &TimeWindow) -> Option<Instant> {
        let mut queue = self.inner.lock();
        let mut i = 0;
        while i < queue.len() {
            let Some(&at) = queue.get(i) else { break };
            let delay = now.saturating_duration_since(at);
            if delay > window.upper() {
                let _ = queue.remove(i);
                tracing::debug!(delay_ms = delay.as_millis() as u64, "discarded stale trigger");
                continue;
            }
            if delay >= window.lower() {
                return queue.remove(i);
            }
            // Still young; leave it for the next parcel.
            i += 1;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "trigger_tests.rs"]
mod tests;
