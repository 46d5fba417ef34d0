//! One frame source and its acquisition thread.
//!
//! `FrameSource` owns a single device or network origin. `start()` resolves
//! the origin, validates a connection strategy by decoding one frame and
//! spawns the acquisition loop on a named thread. Readers only ever see deep
//! copies of the latest frame.
//!
//! Acquisition loop failure policy:
//! - any read error bumps the consecutive-failure counter; only the first
//!   three of a burst are logged
//! - framing errors also bump a separate counter; past `max_framing_errors`
//!   the loop abandons the stream for the snapshot endpoint, if one exists
//! - past `max_consecutive_failures` the loop ends and the source is `Failed`
//!   until someone restarts it

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{CaptureSettings, SourceConfig, SourceKind};
use crate::frame::{FpsMeter, Frame, FrameSlot};
use crate::ingest::address::{self, NetworkEndpoints};
use crate::ingest::{
    Capture, CaptureBackend, CaptureError, ConnectStrategy, FailureClass, SystemBackend,
};
use crate::SourceId;

const LOGGED_FAILURES_PER_BURST: u32 = 3;
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{id} ({origin}) unavailable: {reason}")]
    Unavailable {
        id: SourceId,
        origin: String,
        reason: String,
    },
    #[error("{0} is disabled")]
    Disabled(SourceId),
}

/// Lifecycle of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Never started.
    Idle,
    Running,
    /// Stopped by the owner.
    Stopped,
    /// Acquisition loop gave up; needs an explicit restart.
    Failed,
}

/// Health snapshot of one source slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub display_name: String,
    pub kind: SourceKind,
    /// Device descriptor or current network address; `"disabled"` for
    /// disabled slots.
    pub source: String,
    pub state: SourceState,
    pub running: bool,
    pub fps: f32,
    pub frames_captured: u64,
    /// Transport in use (`snapshot`, `mjpeg`, `device`, ...).
    pub transport: Option<String>,
    pub last_error: Option<String>,
}

impl SourceInfo {
    /// Report for a slot that is configured but not enabled.
    pub fn disabled(id: SourceId, config: &SourceConfig) -> Self {
        Self {
            id,
            display_name: config.display_name.clone(),
            kind: config.kind,
            source: "disabled".to_string(),
            state: SourceState::Idle,
            running: false,
            fps: 0.0,
            frames_captured: 0,
            transport: None,
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Status {
    state: SourceState,
    transport: Option<String>,
    last_error: Option<String>,
}

/// State shared between a `FrameSource` and its acquisition thread.
///
/// A fresh instance is created on every `start()`, so a thread detached by a
/// timed-out `stop()` can never write into a later session's slot.
#[derive(Debug)]
struct Shared {
    slot: FrameSlot,
    stopped: AtomicBool,
    running: AtomicBool,
    frames_captured: AtomicU64,
    fps_bits: AtomicU32,
    status: Mutex<Status>,
}

impl Shared {
    fn new(state: SourceState) -> Self {
        Self {
            slot: FrameSlot::new(),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            frames_captured: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0f32.to_bits()),
            status: Mutex::new(Status {
                state,
                transport: None,
                last_error: None,
            }),
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    /// Store a frame and return its sequence number.
    fn publish(&self, image: RgbImage, settings: &CaptureSettings) -> u64 {
        let sequence = self.frames_captured.fetch_add(1, Ordering::AcqRel) + 1;
        let image = fit_to(image, settings.width, settings.height);
        self.slot.store(Frame::new(image, sequence));
        sequence
    }
}

fn fit_to(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }
}

// ----------------------------------------------------------------------------
// FrameSource
// ----------------------------------------------------------------------------

/// One acquisition origin plus its background thread.
pub struct FrameSource {
    id: SourceId,
    config: SourceConfig,
    settings: CaptureSettings,
    backend: Arc<dyn CaptureBackend>,
    /// Network address in use; differs from `config.url` during `reconnect()`.
    address: String,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

/// A validated connection ready to hand to the acquisition loop.
struct Connection {
    capture: Box<dyn Capture>,
    first: RgbImage,
    transport: &'static str,
    snapshot_fallback: Option<String>,
    network: bool,
}

impl FrameSource {
    /// Source backed by the production transports.
    pub fn new(id: SourceId, config: SourceConfig, settings: CaptureSettings) -> Self {
        Self::with_backend(id, config, settings, Arc::new(SystemBackend))
    }

    pub fn with_backend(
        id: SourceId,
        config: SourceConfig,
        settings: CaptureSettings,
        backend: Arc<dyn CaptureBackend>,
    ) -> Self {
        Self {
            id,
            address: config.url.clone(),
            config,
            settings,
            backend,
            shared: Arc::new(Shared::new(SourceState::Idle)),
            worker: None,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Connect and launch the acquisition thread.
    ///
    /// A no-op when the source is already running.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if !self.config.enabled {
            return Err(SourceError::Disabled(self.id));
        }
        if self.is_running() {
            log::debug!("FrameSource[{}]: start ignored, already running", self.id);
            return Ok(());
        }
        // A previous loop that failed on its own is already finished.
        if let Some(handle) = self.worker.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        let origin = self.origin();
        let mut connection = match self.connect() {
            Ok(connection) => connection,
            Err(reason) => {
                log::warn!("FrameSource[{}]: {} unavailable: {}", self.id, origin, reason);
                let mut status = self.shared.status();
                status.last_error = Some(reason.clone());
                return Err(SourceError::Unavailable {
                    id: self.id,
                    origin,
                    reason,
                });
            }
        };

        if connection.network
            && self.settings.prefer_snapshot
            && connection.transport != ConnectStrategy::Snapshot.label()
        {
            self.poll_snapshots_instead(&mut connection);
        }

        let shared = Arc::new(Shared::new(SourceState::Running));
        shared.publish(connection.first, &self.settings);
        shared.running.store(true, Ordering::Release);
        shared.status().transport = Some(connection.transport.to_string());

        let acquisition = Acquisition {
            id: self.id,
            shared: Arc::clone(&shared),
            capture: connection.capture,
            on_snapshot: connection.transport == ConnectStrategy::Snapshot.label(),
            snapshot_fallback: connection.snapshot_fallback,
            network: connection.network,
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("acquire-{}", self.id))
            .spawn(move || acquisition.run())
            .map_err(|e| SourceError::Unavailable {
                id: self.id,
                origin: origin.clone(),
                reason: format!("spawn acquisition thread: {}", e),
            })?;

        self.shared = shared;
        self.worker = Some(handle);
        log::info!(
            "FrameSource[{}]: connected to {} via {}",
            self.id,
            origin,
            connection.transport
        );
        Ok(())
    }

    fn origin(&self) -> String {
        match self.config.kind {
            SourceKind::Device => format!("device:{}", self.config.device_index),
            SourceKind::Url => self.address.clone(),
        }
    }

    fn connect(&self) -> Result<Connection, String> {
        match self.config.kind {
            SourceKind::Device => {
                let mut capture = self
                    .backend
                    .open_device(self.config.device_index, &self.settings)
                    .map_err(|e| e.to_string())?;
                let first = capture.read().map_err(|e| e.to_string())?;
                Ok(Connection {
                    capture,
                    first,
                    transport: "device",
                    snapshot_fallback: None,
                    network: false,
                })
            }
            SourceKind::Url => self.connect_network(&address::normalize(&self.address)),
        }
    }

    fn connect_network(&self, endpoints: &NetworkEndpoints) -> Result<Connection, String> {
        let mut failures = Vec::new();
        for strategy in self.strategy_order() {
            let target = match strategy {
                ConnectStrategy::Snapshot => match endpoints.snapshot.as_deref() {
                    Some(snapshot) => snapshot,
                    None => continue,
                },
                _ => endpoints.stream.as_str(),
            };
            let attempt = self
                .backend
                .open_url(target, strategy, &self.settings)
                .and_then(|mut capture| capture.read().map(|first| (capture, first)));
            match attempt {
                Ok((capture, first)) => {
                    return Ok(Connection {
                        capture,
                        first,
                        transport: strategy.label(),
                        snapshot_fallback: endpoints.snapshot.clone(),
                        network: true,
                    })
                }
                Err(err) => {
                    log::debug!(
                        "FrameSource[{}]: {} via {} failed: {}",
                        self.id,
                        target,
                        strategy.label(),
                        err
                    );
                    failures.push(format!("{}: {}", strategy.label(), err));
                }
            }
        }
        if failures.is_empty() {
            return Err("no connection strategy applies".to_string());
        }
        Err(format!("all strategies failed ({})", failures.join("; ")))
    }

    /// Hand the loop a snapshot handle in place of a validated stream.
    ///
    /// The stream is kept when the snapshot endpoint cannot be opened.
    fn poll_snapshots_instead(&self, connection: &mut Connection) {
        let Some(url) = connection.snapshot_fallback.as_deref() else {
            return;
        };
        match self
            .backend
            .open_url(url, ConnectStrategy::Snapshot, &self.settings)
        {
            Ok(capture) => {
                log::info!(
                    "FrameSource[{}]: validated via {}, polling snapshots at {}",
                    self.id,
                    connection.transport,
                    url
                );
                connection.capture = capture;
                connection.transport = ConnectStrategy::Snapshot.label();
            }
            Err(err) => {
                log::debug!(
                    "FrameSource[{}]: snapshot endpoint {} unavailable, keeping {}: {}",
                    self.id,
                    url,
                    connection.transport,
                    err
                );
            }
        }
    }

    fn strategy_order(&self) -> Vec<ConnectStrategy> {
        let mut order = ConnectStrategy::ORDER.to_vec();
        if !self.settings.prefer_snapshot {
            order.rotate_left(1);
        }
        order
    }

    /// Deep copy of the most recent frame.
    pub fn get_frame(&self) -> Option<Frame> {
        self.shared.slot.load()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SourceState {
        self.shared.status().state
    }

    /// Stop the acquisition thread and clear the latest frame. Idempotent.
    ///
    /// Waits at most `join_timeout`; a thread still blocked in a read after
    /// that is detached and exits on its next loop check.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + self.settings.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("FrameSource[{}]: acquisition thread panicked", self.id);
                }
            } else {
                log::warn!(
                    "FrameSource[{}]: acquisition thread did not stop within {:?}; detaching",
                    self.id,
                    self.settings.join_timeout
                );
            }
            log::info!("FrameSource[{}]: stopped", self.id);
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.slot.clear();
        let mut status = self.shared.status();
        if status.state == SourceState::Running {
            status.state = SourceState::Stopped;
        }
    }

    /// Stop, pause, start.
    pub fn restart(&mut self) -> Result<(), SourceError> {
        log::info!("FrameSource[{}]: restarting", self.id);
        self.stop();
        std::thread::sleep(self.settings.restart_pause);
        self.start()
    }

    /// Re-establish a connection, trying address variants for network origins.
    ///
    /// On total failure the configured address is restored and a plain
    /// `restart()` decides the outcome.
    pub fn reconnect(&mut self) -> Result<(), SourceError> {
        if self.config.kind == SourceKind::Device {
            return self.restart();
        }
        let original = self.config.url.clone();
        for variant in address::reconnect_variants(&original) {
            log::info!("FrameSource[{}]: reconnecting via {}", self.id, variant);
            self.stop();
            std::thread::sleep(self.settings.restart_pause);
            self.address = variant;
            if self.start().is_ok() {
                return Ok(());
            }
        }
        self.address = original;
        self.restart()
    }

    pub fn info(&self) -> SourceInfo {
        let status = self.shared.status();
        let running = self.is_running();
        SourceInfo {
            id: self.id,
            display_name: self.config.display_name.clone(),
            kind: self.config.kind,
            source: self.origin(),
            state: status.state,
            running,
            fps: if running { self.shared.fps() } else { 0.0 },
            frames_captured: self.shared.frames_captured.load(Ordering::Acquire),
            transport: status.transport.clone(),
            last_error: status.last_error.clone(),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

struct Acquisition {
    id: SourceId,
    shared: Arc<Shared>,
    capture: Box<dyn Capture>,
    on_snapshot: bool,
    snapshot_fallback: Option<String>,
    network: bool,
    backend: Arc<dyn CaptureBackend>,
    settings: CaptureSettings,
}

impl Acquisition {
    fn run(mut self) {
        let mut failures = 0u32;
        let mut framing_errors = 0u32;
        let mut meter = FpsMeter::new();

        while !self.shared.stopped.load(Ordering::Acquire) {
            match self.capture.read() {
                Ok(image) => {
                    // A detached thread must not refill the slot `stop()` cleared.
                    if self.shared.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    failures = 0;
                    self.shared.publish(image, &self.settings);
                    if self.shared.stopped.load(Ordering::Acquire) {
                        self.shared.slot.clear();
                        break;
                    }
                    if let Some(fps) = meter.tick() {
                        self.shared.set_fps(fps);
                    }
                    if self.network && !self.settings.poll_delay.is_zero() {
                        std::thread::sleep(self.settings.poll_delay);
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures <= LOGGED_FAILURES_PER_BURST {
                        log::warn!(
                            "FrameSource[{}]: read failed ({}/{}): {}",
                            self.id,
                            failures,
                            self.settings.max_consecutive_failures,
                            err
                        );
                    }

                    if err.class() == FailureClass::Degraded {
                        framing_errors += 1;
                        if framing_errors > self.settings.max_framing_errors
                            && self.switch_to_snapshot()
                        {
                            failures = 0;
                            framing_errors = 0;
                            continue;
                        }
                    }

                    if failures > self.settings.max_consecutive_failures {
                        self.fail(&err);
                        return;
                    }
                    std::thread::sleep(self.settings.retry_delay);
                }
            }
        }
        self.shared.running.store(false, Ordering::Release);
    }

    /// Replace the stream handle with snapshot polling. Returns false when no
    /// snapshot endpoint is available.
    fn switch_to_snapshot(&mut self) -> bool {
        if self.on_snapshot {
            return false;
        }
        let Some(url) = self.snapshot_fallback.clone() else {
            return false;
        };
        match self
            .backend
            .open_url(&url, ConnectStrategy::Snapshot, &self.settings)
        {
            Ok(capture) => {
                log::warn!(
                    "FrameSource[{}]: stream framing unreliable, switching to snapshots at {}",
                    self.id,
                    url
                );
                self.capture = capture;
                self.on_snapshot = true;
                self.shared.status().transport = Some(ConnectStrategy::Snapshot.label().into());
                true
            }
            Err(err) => {
                log::warn!(
                    "FrameSource[{}]: snapshot fallback {} unavailable: {}",
                    self.id,
                    url,
                    err
                );
                false
            }
        }
    }

    fn fail(&self, err: &CaptureError) {
        log::error!(
            "FrameSource[{}]: giving up after {} consecutive failures: {}",
            self.id,
            self.settings.max_consecutive_failures + 1,
            err
        );
        self.shared.slot.clear();
        self.shared.running.store(false, Ordering::Release);
        let mut status = self.shared.status();
        status.state = SourceState::Failed;
        status.last_error = Some(err.to_string());
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
