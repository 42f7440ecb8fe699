// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scenario harness for end-to-end engine tests.
//!
//! Drives a fully built engine through scripted device lines with real
//! timers and asserts on the frames each fake device received and the
//! events the engine published.

use std::sync::Once;
use std::time::{Duration, Instant};

use bytes::Bytes;
use divert::config::SortConfig;
use divert::event::SortEvent;
use divert::parcel::Parcel;
use divert::test_support::{start_rig, FakeHandle, TestRig};

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("divert=debug")
            .with_test_writer()
            .try_init();
    });
}

/// A started engine plus script helpers for the sorting-line scenarios.
pub struct ScenarioRig {
    pub rig: TestRig,
}

impl ScenarioRig {
    /// Build and start an engine over fake links for `config`.
    pub async fn start(config: SortConfig) -> anyhow::Result<Self> {
        init_tracing();
        let rig = start_rig(config).await?;
        // The start bracket (Start + both resets) is setup noise for the
        // scenarios; drop it from every device.
        for (device, _) in rig.engine.device_status() {
            if let Some(handle) = rig.hub.handle(&device) {
                handle.clear_sent();
            }
        }
        Ok(Self { rig })
    }

    pub fn handle(&self, device: &str) -> anyhow::Result<FakeHandle> {
        self.rig.handle(device)
    }

    /// Deliver a trigger rising edge line on `device`.
    pub async fn fire_trigger(&self, device: &str) -> anyhow::Result<()> {
        self.handle(device)?.feed_line("OCCH1:1").await;
        Ok(())
    }

    /// Deliver a sort rising edge line on `device`.
    pub async fn fire_sort(&self, device: &str) -> anyhow::Result<()> {
        self.handle(device)?.feed_line("OCCH2:1").await;
        Ok(())
    }

    pub fn ingest(&self, index: u64, barcode: &str, chute: i32) -> anyhow::Result<()> {
        self.rig.engine.process_package(Parcel::new(index, barcode, chute))?;
        Ok(())
    }

    /// Ingest a record whose trigger was already correlated upstream.
    pub fn ingest_stamped(
        &self,
        index: u64,
        barcode: &str,
        chute: i32,
        trigger_at: Instant,
    ) -> anyhow::Result<()> {
        self.rig
            .engine
            .process_package(Parcel::new(index, barcode, chute).with_trigger_at(trigger_at))?;
        Ok(())
    }

    /// Wait for the `SortingCompleted` event of one barcode.
    pub async fn completed(&self, barcode: &str, timeout: Duration) -> anyhow::Result<Parcel> {
        let barcode = barcode.to_owned();
        let event = self
            .rig
            .sink
            .wait_for(timeout, move |e| {
                matches!(e, SortEvent::SortingCompleted { parcel } if parcel.barcode == barcode)
            })
            .await?;
        match event {
            SortEvent::SortingCompleted { parcel } => Ok(parcel),
            _ => anyhow::bail!("wrong event variant"),
        }
    }

    pub fn frames(&self, device: &str) -> anyhow::Result<Vec<Bytes>> {
        Ok(self.handle(device)?.sent_frames())
    }

    /// Position of the first event of `kind`, for ordering assertions.
    pub fn event_position(&self, kind: &str) -> Option<usize> {
        self.rig.sink.events().iter().position(|e| e.kind() == kind)
    }
}

/// Shorthand for asserting an exact outbound frame sequence.
pub fn frames_of(frames: &[&'static [u8]]) -> Vec<Bytes> {
    frames.iter().map(|f| Bytes::from_static(f)).collect()
}
