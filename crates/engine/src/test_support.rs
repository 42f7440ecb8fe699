// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fakes and builders for engine tests: a scripted link hub, an
//! in-memory event sink, and a ready-to-run engine rig.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{SortConfig, SortMode, SortPeConfig, TimeWindow, TriggerPeConfig};
use crate::engine::{EngineBuilder, SortEngine};
use crate::event::{EventSink, SortEvent};
use crate::link::{LinkConnector, LinkInbound, PeLink};

// -- Collecting sink ----------------------------------------------------------

/// Event sink that records everything for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SortEvent>>,
}

impl EventSink for CollectingSink {
    fn publish(&self, event: SortEvent) {
        self.events.lock().push(event);
    }
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SortEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Poll until an event matching `pred` shows up.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&SortEvent) -> bool,
    ) -> anyhow::Result<SortEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.lock().iter().find(|e| pred(e)).cloned() {
                return Ok(event);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timed out waiting for event");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// -- Fake links ---------------------------------------------------------------

/// Frames every hub link sent, in global send order.
type SentLog = Arc<Mutex<Vec<(String, Bytes)>>>;

/// In-memory device link recording every frame it is asked to send.
pub struct FakeLink {
    device: String,
    connected: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    log: SentLog,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeLink {
    pub fn new(device: &str) -> Arc<Self> {
        Self::with_log(device, Duration::ZERO, Arc::default())
    }

    /// A link whose sends take `latency`, for serialization tests.
    pub fn with_latency(device: &str, latency: Duration) -> Arc<Self> {
        Self::with_log(device, latency, Arc::default())
    }

    fn with_log(device: &str, latency: Duration, log: SentLog) -> Arc<Self> {
        Arc::new(Self {
            device: device.to_owned(),
            connected: Arc::new(AtomicBool::new(true)),
            sent: Arc::new(Mutex::new(Vec::new())),
            log,
            latency,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Largest number of sends ever observed inside the send region.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl PeLink for FakeLink {
    fn device(&self) -> &str {
        &self.device
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if !self.is_connected() {
                anyhow::bail!("fake link {} is disconnected", self.device);
            }
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if self.latency > Duration::ZERO {
                tokio::time::sleep(self.latency).await;
            }
            self.log.lock().push((self.device.clone(), frame.clone()));
            self.sent.lock().push(frame);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Test-side handle for one hub-connected fake link.
#[derive(Clone)]
pub struct FakeHandle {
    device: String,
    pub inbound: mpsc::Sender<LinkInbound>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    connected: Arc<AtomicBool>,
}

impl FakeHandle {
    /// Deliver one CRLF-terminated line from the device.
    pub async fn feed_line(&self, line: &str) {
        self.feed_bytes(format!("{line}\r\n").as_bytes()).await;
    }

    pub async fn feed_bytes(&self, bytes: &[u8]) {
        let _ = self
            .inbound
            .send(LinkInbound::Data {
                device: self.device.clone(),
                chunk: Bytes::copy_from_slice(bytes),
            })
            .await;
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Drop the connection and report the transition, like a dying TCP
    /// reader would.
    pub async fn go_offline(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .inbound
            .send(LinkInbound::Connection { device: self.device.clone(), connected: false })
            .await;
    }
}

/// Connector handing out scripted in-memory links.
#[derive(Default)]
pub struct FakeHub {
    handles: Mutex<HashMap<String, FakeHandle>>,
    refused: Mutex<HashSet<String>>,
    log: SentLog,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `connect` fail for this device, simulating a dead endpoint.
    pub fn refuse(&self, device: &str) {
        self.refused.lock().insert(device.to_owned());
    }

    pub fn handle(&self, device: &str) -> Option<FakeHandle> {
        self.handles.lock().get(device).cloned()
    }

    /// Frames sent across all hub links, in global send order.
    pub fn sent_log(&self) -> Vec<(String, Bytes)> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl LinkConnector for FakeHub {
    fn connect(
        &self,
        device: &str,
        _address: &str,
        _port: u16,
        inbound: mpsc::Sender<LinkInbound>,
        _shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn PeLink>>> + Send + '_>> {
        let device = device.to_owned();
        Box::pin(async move {
            if self.refused.lock().contains(&device) {
                anyhow::bail!("connection refused: {device}");
            }
            let link = FakeLink::with_log(&device, Duration::ZERO, Arc::clone(&self.log));
            let handle = FakeHandle {
                device: device.clone(),
                inbound,
                sent: Arc::clone(&link.sent),
                connected: Arc::clone(&link.connected),
            };
            self.handles.lock().insert(device, handle);
            Ok(link as Arc<dyn PeLink>)
        })
    }
}

// -- Engine rig ---------------------------------------------------------------

/// A built engine wired to fakes, ready for scenario scripting.
pub struct TestRig {
    pub engine: SortEngine,
    pub hub: Arc<FakeHub>,
    pub sink: Arc<CollectingSink>,
}

impl TestRig {
    pub fn handle(&self, device: &str) -> anyhow::Result<FakeHandle> {
        self.hub.handle(device).ok_or_else(|| anyhow::anyhow!("no fake link for {device}"))
    }
}

/// Build, initialize, and start an engine against fake links.
pub async fn start_rig(config: SortConfig) -> anyhow::Result<TestRig> {
    let rig = build_rig(config)?;
    rig.engine.initialize().await?;
    rig.engine.start().await?;
    Ok(rig)
}

/// Build an engine against fake links without touching its lifecycle.
pub fn build_rig(config: SortConfig) -> anyhow::Result<TestRig> {
    let hub = FakeHub::new();
    let sink = CollectingSink::new();
    let engine = EngineBuilder::new(config)
        .with_connector(Arc::clone(&hub) as Arc<dyn LinkConnector>)
        .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
        .build()?;
    Ok(TestRig { engine, hub, sink })
}

/// The reference line used across tests: one diverter "P1" owning chutes
/// 1 and 2, sort window 350–600 ms, 50 ms sorting delay, 200 ms reset
/// delay, 30 ms debounce.
pub fn one_pe_config() -> SortConfig {
    SortConfig {
        mode: SortMode::Multi,
        trigger: TriggerPeConfig {
            address: "127.0.0.1".to_owned(),
            port: 7100,
            window: TimeWindow { lower_ms: 0, upper_ms: 450 },
        },
        sort_pes: vec![SortPeConfig {
            name: "P1".to_owned(),
            address: "127.0.0.1".to_owned(),
            port: 7101,
            window: TimeWindow { lower_ms: 350, upper_ms: 600 },
            sorting_delay_ms: 50,
            reset_delay_ms: 200,
        }],
        global_debounce_ms: 30,
        straight_through_timeout_ms: 400,
        continuous_sort_max_interval_ms: 2_000,
    }
}

/// Two diverters: "P1" owns chutes 1–2, "P2" owns chutes 3–4.
pub fn two_pe_config() -> SortConfig {
    let mut config = one_pe_config();
    let mut second = config.sort_pes[0].clone();
    second.name = "P2".to_owned();
    second.port = 7102;
    config.sort_pes.push(second);
    config
}

/// Single-pendulum line: one combined device named "default".
pub fn single_config() -> SortConfig {
    let mut config = one_pe_config();
    config.mode = SortMode::Single;
    config.sort_pes[0].name = "default".to_owned();
    config
}
