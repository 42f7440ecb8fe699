// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serialized outbound command path: one worker per device, strict FIFO,
//! plus scheduler-owned delayed resets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::SortError;
use crate::link::PeLink;

const WORKER_QUEUE_DEPTH: usize = 64;

/// Evaluated by the scheduler just before a delayed reset fires; a false
/// return means the pendulum has moved on and the frame must not be sent.
pub type ResetGate = Box<dyn FnOnce() -> bool + Send>;

/// Invoked with the send outcome after a delayed reset fires.
pub type ResetCallback = Box<dyn FnOnce(Result<(), SortError>) + Send>;

struct SendJob {
    frame: Bytes,
    done: oneshot::Sender<Result<(), SortError>>,
}

struct DeviceWorker {
    tx: mpsc::Sender<SendJob>,
    link: Arc<dyn PeLink>,
}

/// Owns one serial command worker per registered device.
///
/// Commands are sent one at a time per device in submission order. No
/// retries: a failed send surfaces to the caller and the link marks
/// itself disconnected.
pub struct CommandScheduler {
    workers: RwLock<HashMap<String, DeviceWorker>>,
    shutdown: CancellationToken,
}

impl CommandScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { workers: RwLock::new(HashMap::new()), shutdown }
    }

    /// Register a device link and spawn its worker.
    pub fn register(&self, link: Arc<dyn PeLink>) {
        let (tx, mut rx) = mpsc::channel::<SendJob>(WORKER_QUEUE_DEPTH);
        let device = link.device().to_owned();
        let worker_link = Arc::clone(&link);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let result = if !worker_link.is_connected() {
                    Err(SortError::ClientUnavailable)
                } else {
                    worker_link.send(job.frame).await.map_err(|e| {
                        tracing::warn!(device = %device, err = %e, "command send failed");
                        SortError::SendFailed
                    })
                };
                // Receiver may have given up; that is its problem.
                let _ = job.done.send(result);
            }
        });

        self.workers.write().insert(link.device().to_owned(), DeviceWorker { tx, link });
    }

    /// Whether a device is registered and its link reports connected.
    pub fn is_connected(&self, device: &str) -> bool {
        self.workers.read().get(device).map(|w| w.link.is_connected()).unwrap_or(false)
    }

    /// Registered device names with their connection state.
    pub fn device_status(&self) -> Vec<(String, bool)> {
        self.workers
            .read()
            .iter()
            .map(|(name, w)| (name.clone(), w.link.is_connected()))
            .collect()
    }

    /// Send one frame through the device's serial queue and wait for the
    /// outcome. No retry.
    pub async fn send_now(&self, device: &str, frame: Bytes) -> Result<(), SortError> {
        let tx = {
            let workers = self.workers.read();
            let Some(worker) = workers.get(device) else {
                return Err(SortError::UnknownDevice);
            };
            worker.tx.clone()
        };
        let (done, outcome) = oneshot::channel();
        tx.send(SendJob { frame, done }).await.map_err(|_| SortError::SendFailed)?;
        outcome.await.map_err(|_| SortError::SendFailed)?
    }

    /// Fire `frame` at the device after `delay` without holding the
    /// caller or a worker for the wait.
    ///
    /// There is no cancellation handle: `gate` runs at fire time and
    /// decides whether the reset is still wanted; superseded resets are
    /// dropped silently. `on_complete` observes the send outcome.
    pub fn schedule_delayed_reset(
        self: &Arc<Self>,
        device: &str,
        frame: Bytes,
        delay: Duration,
        gate: ResetGate,
        on_complete: ResetCallback,
    ) {
        let scheduler = Arc::clone(self);
        let device = device.to_owned();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !gate() {
                tracing::debug!(device = %device, "delayed reset superseded, skipped");
                return;
            }
            let result = scheduler.send_now(&device, frame).await;
            on_complete(result);
        });
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
