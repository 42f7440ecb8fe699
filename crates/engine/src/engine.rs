// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine supervisor: lifecycle, parcel ingress, signal dispatch, and the
//! processing watchdog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandSet, DEFAULT_COMMANDS};
use crate::config::{SortConfig, SortMode};
use crate::consumer::{spawn_consumer, SortSignal};
use crate::error::IngestError;
use crate::event::{EventSink, NullSink, SortEvent};
use crate::executor::{self, WaitingTimers};
use crate::link::tcp::TcpConnector;
use crate::link::{LinkConnector, LinkInbound};
use crate::parcel::{Parcel, SortState};
use crate::pendulum::{Direction, PendulumTable};
use crate::scheduler::CommandScheduler;
use crate::signal::{classify_line, Debouncer, LineClass, LineSplitter, SignalHealth};
use crate::table::ParcelTable;
use crate::topology::{MultiTopology, SingleTopology, Topology};
use crate::trigger::TriggerQueue;

/// Device name of the dedicated trigger photoelectric (multi mode).
pub const TRIGGER_DEVICE: &str = "trigger";

/// Grace added on top of a PE's upper window for the per-parcel sort
/// timeout.
const SORT_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// Processing-set entries older than this are reaped whatever the
/// pendulum is doing.
const PROCESSING_MAX_AGE: Duration = Duration::from_secs(30);

const INBOUND_QUEUE_DEPTH: usize = 256;

// -- Shared state -------------------------------------------------------------

/// State shared by every engine task.
pub struct EngineState {
    pub config: SortConfig,
    pub commands: CommandSet,
    pub topology: Box<dyn Topology>,
    pub sink: Arc<dyn EventSink>,
    pub scheduler: Arc<CommandScheduler>,
    pub triggers: TriggerQueue,
    pub table: ParcelTable,
    pub pendulums: PendulumTable,
    pub(crate) waiting_timers: WaitingTimers,
    pub running: AtomicBool,
    pub shutdown: CancellationToken,
    pub(crate) sort_tx: mpsc::UnboundedSender<SortSignal>,
}

// -- Builder ------------------------------------------------------------------

/// Builds a [`SortEngine`] from a configuration snapshot plus injected
/// collaborators.
pub struct EngineBuilder {
    config: SortConfig,
    sink: Arc<dyn EventSink>,
    connector: Arc<dyn LinkConnector>,
    commands: CommandSet,
}

impl EngineBuilder {
    pub fn new(config: SortConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NullSink),
            connector: Arc::new(TcpConnector),
            commands: DEFAULT_COMMANDS,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn LinkConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_commands(mut self, commands: CommandSet) -> Self {
        self.commands = commands;
        self
    }

    pub fn build(self) -> anyhow::Result<SortEngine> {
        self.config.validate()?;

        let topology: Box<dyn Topology> = match self.config.mode {
            SortMode::Single => Box::new(SingleTopology::new(self.config.sort_pes[0].name.clone())),
            SortMode::Multi => Box::new(MultiTopology::new(
                self.config.sort_pes.iter().map(|pe| pe.name.clone()).collect(),
            )),
        };

        let shutdown = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (sort_tx, sort_rx) = mpsc::unbounded_channel();

        let state = Arc::new(EngineState {
            config: self.config,
            commands: self.commands,
            topology,
            sink: self.sink,
            scheduler: Arc::new(CommandScheduler::new(shutdown.clone())),
            triggers: TriggerQueue::new(),
            table: ParcelTable::new(),
            pendulums: PendulumTable::new(),
            waiting_timers: WaitingTimers::default(),
            running: AtomicBool::new(false),
            shutdown,
            sort_tx,
        });

        Ok(SortEngine {
            state,
            connector: self.connector,
            initialized: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            sort_rx: Mutex::new(Some(sort_rx)),
            dispatch: Mutex::new(None),
            consumer: Mutex::new(None),
            watchdog: Mutex::new(None),
        })
    }
}

// -- Engine -------------------------------------------------------------------

/// The pendulum-sort engine.
pub struct SortEngine {
    state: Arc<EngineState>,
    connector: Arc<dyn LinkConnector>,
    initialized: AtomicBool,
    inbound_tx: mpsc::Sender<LinkInbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<LinkInbound>>>,
    sort_rx: Mutex<Option<mpsc::UnboundedReceiver<SortSignal>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// What a device's inbound lines mean to the engine.
struct DeviceRoles {
    trigger: bool,
    sort_pe: Option<String>,
}

/// Per-device decode state owned by the dispatch task.
struct DeviceIo {
    splitter: LineSplitter,
    trigger_debounce: Debouncer,
    sort_debounce: Debouncer,
    health: SignalHealth,
}

impl DeviceIo {
    fn new(debounce: Duration) -> Self {
        Self {
            splitter: LineSplitter::new(),
            trigger_debounce: Debouncer::new(debounce),
            sort_debounce: Debouncer::new(debounce),
            health: SignalHealth::new(),
        }
    }
}

impl SortEngine {
    /// Open every photoelectric link and start the signal dispatch task.
    ///
    /// Idempotent. Connection failures are observed and published, never
    /// fatal: a dead device simply fails every later send against it.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut roles = HashMap::new();
        for (device, address, port, role) in self.device_plan() {
            roles.insert(device.clone(), role);
            match self
                .connector
                .connect(
                    &device,
                    &address,
                    port,
                    self.inbound_tx.clone(),
                    self.state.shutdown.clone(),
                )
                .await
            {
                Ok(link) => {
                    self.state.scheduler.register(link);
                    self.state.sink.publish(SortEvent::DeviceConnectionChanged {
                        device,
                        connected: true,
                    });
                }
                Err(e) => {
                    tracing::warn!(device = %device, err = %e, "link connect failed");
                    self.state.sink.publish(SortEvent::DeviceConnectionChanged {
                        device,
                        connected: false,
                    });
                }
            }
        }

        for pe in &self.state.config.sort_pes {
            self.state.pendulums.register(&pe.name);
        }

        if let Some(rx) = self.inbound_rx.lock().take() {
            *self.dispatch.lock() = Some(spawn_dispatch(Arc::clone(&self.state), rx, roles));
        }
        Ok(())
    }

    /// Begin sorting: bracket every diverter with `Start` plus both
    /// resets, then run the watchdog and the signal consumer.
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            anyhow::bail!("engine not initialized");
        }
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let commands = self.state.commands;
        for device in self.command_devices() {
            if !self.state.scheduler.is_connected(&device) {
                continue;
            }
            for frame in [commands.start, commands.reset_left, commands.reset_right] {
                if let Err(e) =
                    self.state.scheduler.send_now(&device, bytes::Bytes::from_static(frame)).await
                {
                    tracing::warn!(device = %device, err = %e, "start bracket send failed");
                }
            }
        }

        if let Some(rx) = self.sort_rx.lock().take() {
            *self.consumer.lock() = Some(spawn_consumer(Arc::clone(&self.state), rx));
        }
        *self.watchdog.lock() = Some(spawn_watchdog(Arc::clone(&self.state)));

        tracing::info!(mode = ?self.state.config.mode, pes = self.state.config.sort_pes.len(), "engine started");
        Ok(())
    }

    /// Stop sorting: drain queued sort signals, bracket the diverters
    /// with `Stop` plus both resets, then tear every task down.
    pub async fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Finish matching whatever is already queued before the links go.
        let _ = self.state.sort_tx.send(SortSignal::Drain);
        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            let _ = handle.await;
        }

        let commands = self.state.commands;
        for device in self.command_devices() {
            if !self.state.scheduler.is_connected(&device) {
                continue;
            }
            for frame in [commands.stop, commands.reset_left, commands.reset_right] {
                if let Err(e) =
                    self.state.scheduler.send_now(&device, bytes::Bytes::from_static(frame)).await
                {
                    tracing::warn!(device = %device, err = %e, "stop bracket send failed");
                }
            }
        }

        self.state.shutdown.cancel();
        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
        let watchdog = self.watchdog.lock().take();
        if let Some(handle) = watchdog {
            let _ = handle.await;
        }

        self.state.table.clear_timers();
        self.state.waiting_timers.cancel_all();
        tracing::info!("engine stopped");
    }

    /// Accept a parcel record from the external scanner. Non-blocking:
    /// the sort work happens on engine tasks.
    pub fn process_package(&self, mut parcel: Parcel) -> Result<(), IngestError> {
        if !self.state.running.load(Ordering::SeqCst) {
            tracing::warn!(barcode = %parcel.barcode, "parcel rejected, engine stopped");
            return Err(IngestError::ServiceStopped);
        }
        if self.state.table.is_in_flight(&parcel.barcode) {
            tracing::warn!(barcode = %parcel.barcode, "parcel rejected, barcode in flight");
            return Err(IngestError::DuplicateBarcode);
        }

        let now = Instant::now();
        self.state.sink.publish(SortEvent::PackageProcessing { at: now });

        if let Some(at) = parcel.trigger_at() {
            // Pre-stamped by the caller; only derive the processing time.
            parcel.stamp_trigger(at, now);
        } else if let Some(at) =
            self.state.triggers.match_and_consume(now, &self.state.config.trigger.window)
        {
            parcel.stamp_trigger(at, now);
        } else {
            // Acceptable: the parcel will miss its sort match and fall to
            // a timeout.
            tracing::debug!(index = parcel.index, barcode = %parcel.barcode, "no trigger match at ingress");
        }

        parcel.force_pending();
        let index = parcel.index;
        let (after, kind) = match self.state.topology.pe_for_slot(parcel.target_chute) {
            Some(pe) => {
                let window = self.state.config.sort_pe(pe).map(|c| c.window.upper());
                let upper = window.unwrap_or_default();
                (upper + SORT_TIMEOUT_SLACK, ParcelTimeout::Sort { pe: pe.to_owned() })
            }
            None => (self.state.config.straight_through_timeout(), ParcelTimeout::StraightThrough),
        };

        self.state.table.insert_pending(parcel);
        spawn_parcel_timeout(Arc::clone(&self.state), index, after, kind);
        Ok(())
    }

    /// Registered devices with their connection state.
    pub fn device_status(&self) -> Vec<(String, bool)> {
        self.state.scheduler.device_status()
    }

    /// The last slot any pendulum swung for; source of truth for reset
    /// direction.
    pub fn last_slot(&self) -> i32 {
        self.state.pendulums.last_slot()
    }

    pub fn pendulum_direction(&self, pe: &str) -> Option<Direction> {
        self.state.pendulums.direction(pe)
    }

    pub fn pending_len(&self) -> usize {
        self.state.table.pending_len()
    }

    pub fn processing_len(&self) -> usize {
        self.state.table.processing_len()
    }

    pub(crate) fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Devices that receive swing/reset/start/stop commands.
    fn command_devices(&self) -> Vec<String> {
        self.state.config.sort_pes.iter().map(|pe| pe.name.clone()).collect()
    }

    /// Devices to open: `(name, address, port, roles)`.
    ///
    /// Single mode runs one combined device carrying the trigger channel,
    /// the sort channel, and the arm, registered under the sort PE name.
    fn device_plan(&self) -> Vec<(String, String, u16, DeviceRoles)> {
        let config = &self.state.config;
        match config.mode {
            SortMode::Single => {
                let pe = &config.sort_pes[0];
                vec![(
                    pe.name.clone(),
                    config.trigger.address.clone(),
                    config.trigger.port,
                    DeviceRoles { trigger: true, sort_pe: Some(pe.name.clone()) },
                )]
            }
            SortMode::Multi => {
                let mut plan = vec![(
                    TRIGGER_DEVICE.to_owned(),
                    config.trigger.address.clone(),
                    config.trigger.port,
                    DeviceRoles { trigger: true, sort_pe: None },
                )];
                for pe in &config.sort_pes {
                    plan.push((
                        pe.name.clone(),
                        pe.address.clone(),
                        pe.port,
                        DeviceRoles { trigger: false, sort_pe: Some(pe.name.clone()) },
                    ));
                }
                plan
            }
        }
    }
}

// -- Signal dispatch ----------------------------------------------------------

fn spawn_dispatch(
    state: Arc<EngineState>,
    mut rx: mpsc::Receiver<LinkInbound>,
    roles: HashMap<String, DeviceRoles>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut io: HashMap<String, DeviceIo> = HashMap::new();
        loop {
            let msg = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                LinkInbound::Data { device, chunk } => {
                    let Some(role) = roles.get(&device) else { continue };
                    let debounce = state.config.global_debounce();
                    let entry =
                        io.entry(device.clone()).or_insert_with(|| DeviceIo::new(debounce));
                    let now = Instant::now();
                    for line in entry.splitter.push(&chunk) {
                        dispatch_line(&state, &device, role, entry, &line, now);
                    }
                }
                LinkInbound::Connection { device, connected } => {
                    tracing::warn!(device = %device, connected, "device connection changed");
                    state
                        .sink
                        .publish(SortEvent::DeviceConnectionChanged { device, connected });
                }
            }
        }
    })
}

fn dispatch_line(
    state: &Arc<EngineState>,
    device: &str,
    role: &DeviceRoles,
    io: &mut DeviceIo,
    line: &str,
    now: Instant,
) {
    match classify_line(line, role.trigger) {
        LineClass::TriggerRising if role.trigger => {
            if let Some(anomaly) = io.health.record_rising() {
                tracing::error!(device = %device, ?anomaly, "abnormal trigger signal");
            }
            if io.trigger_debounce.accept_rising(now) {
                state.triggers.enqueue(now);
                state.sink.publish(SortEvent::TriggerSignal { at: now });
            } else {
                tracing::debug!(device = %device, "debounced trigger edge");
            }
        }
        LineClass::SortRising => {
            let Some(pe) = role.sort_pe.as_deref() else { return };
            if let Some(anomaly) = io.health.record_rising() {
                tracing::error!(device = %device, ?anomaly, "abnormal sort signal");
            }
            if io.sort_debounce.accept_rising(now) {
                state.sink.publish(SortEvent::SortingSignal { pe: pe.to_owned(), at: now });
                let _ = state.sort_tx.send(SortSignal::Rising { pe: pe.to_owned(), at: now });
            } else {
                tracing::debug!(device = %device, "debounced sort edge");
            }
        }
        LineClass::LowLevel => {
            if let Some(anomaly) = io.health.record_low() {
                tracing::error!(device = %device, ?anomaly, "abnormal signal counts");
            }
        }
        LineClass::TriggerRising | LineClass::Other => {}
    }
}

// -- Per-parcel timeouts ------------------------------------------------------

enum ParcelTimeout {
    Sort { pe: String },
    StraightThrough,
}

fn spawn_parcel_timeout(
    state: Arc<EngineState>,
    index: u64,
    after: Duration,
    kind: ParcelTimeout,
) {
    let guard = state.table.arm_timer(index);
    tokio::spawn(async move {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = state.shutdown.cancelled() => return,
            _ = tokio::time::sleep(after) => {}
        }
        state.table.release_timer(index);
        let Some(mut parcel) = state.table.remove_pending(index) else { return };
        match kind {
            ParcelTimeout::Sort { pe } => {
                tracing::warn!(index, barcode = %parcel.barcode, pe = %pe, "sort timeout");
                parcel.advance(SortState::Error);
                state.sink.publish(SortEvent::SortingCompleted { parcel });
                // The arm may have started swinging for this parcel; it
                // must be neutral before the next one arrives.
                executor::force_immediate_reset(&state, &pe).await;
            }
            ParcelTimeout::StraightThrough => {
                tracing::debug!(index, barcode = %parcel.barcode, "straight-through complete");
                parcel.advance(SortState::Sorted);
                state.sink.publish(SortEvent::SortingCompleted { parcel });
            }
        }
    });
}

// -- Watchdog -----------------------------------------------------------------

fn spawn_watchdog(state: Arc<EngineState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(WATCHDOG_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let now = Instant::now();
            for barcode in state.table.reap_processing(now, PROCESSING_MAX_AGE) {
                tracing::warn!(barcode = %barcode, "reaped stale processing entry");
            }

            let pending = state.table.pending_len();
            let processing = state.table.processing_len();
            if pending > 0 || processing > 0 {
                let counts = state.table.pending_state_counts();
                let summary: Vec<String> =
                    counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
                tracing::debug!(
                    pending,
                    processing,
                    states = %summary.join(","),
                    "parcel table audit"
                );
            }
        }
    })
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
