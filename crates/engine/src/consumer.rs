// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sort-signal queue: decouples link reader tasks from matching and
//! serializes cross-PE matching at a single point.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::EngineState;
use crate::matcher;

/// Work items for the consumer task.
#[derive(Debug)]
pub(crate) enum SortSignal {
    /// A debounced rising edge on a sort photoelectric.
    Rising { pe: String, at: Instant },
    /// Everything queued before this marker has been handled; exit.
    Drain,
}

/// Spawn the single consumer task draining the sort-signal queue.
///
/// Matching runs serially here, so parcels are handed to executors in
/// exactly the order their signals arrived, across all PEs.
pub(crate) fn spawn_consumer(
    state: Arc<EngineState>,
    mut rx: mpsc::UnboundedReceiver<SortSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                msg = rx.recv() => msg,
                _ = state.shutdown.cancelled() => break,
            };
            match msg {
                Some(SortSignal::Rising { pe, at }) => {
                    matcher::on_sort_signal(&state, &pe, at).await;
                }
                Some(SortSignal::Drain) | None => break,
            }
        }
        tracing::debug!("sort-signal consumer drained");
    })
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
