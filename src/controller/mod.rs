//! Peripheral controllers.
//!
//! A [`DeviceController`] manages one external link through its lifecycle:
//!
//! ```text
//! Idle ──start()──▶ Connecting ──ready──▶ Connected ──EOF/timeout──▶ Disconnected
//!                        │                    │                          │
//!                        └────────────── stop() ─────────────────────────┴──▶ Stopped
//! ```
//!
//! `start()` suspends until the [`Connector`] reports readiness, `run()` until
//! the link drops or `stop()` is called. Both suspension points also wait on
//! the stop signal, so `stop()` cancels them. Reconnecting is left to the
//! owner: a disconnected controller can be started again, a stopped one not.

pub mod link;
pub mod wire;

pub use link::{connector_for, ChannelConnector, Connector, DynLink, LinkSender, WireLink};
pub use wire::{DecoderStats, Message, MicrosClock, WireDecoder};

use crate::config::WireTimeouts;
use crate::core::Status;
use crate::data::StreamWriter;
use crate::error::ControllerError;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Connection lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Constructed, never started.
    Idle,
    /// Waiting for readiness.
    Connecting,
    /// Link up.
    Connected,
    /// Link lost; may be started again.
    Disconnected,
    /// Terminal.
    Stopped,
}

impl ControllerState {
    /// Canonical health for this state.
    pub fn status(self) -> Status {
        match self {
            ControllerState::Idle | ControllerState::Connecting => Status::Standby,
            ControllerState::Connected => Status::Active,
            ControllerState::Disconnected | ControllerState::Stopped => Status::Disconnected,
        }
    }
}

/// Observer for connection transitions; each hook fires once per connection.
pub trait ControllerHooks: Send + Sync {
    /// Link established.
    fn on_connect(&self, _controller: &str) {}

    /// Link ended (lost or stopped).
    fn on_disconnect(&self, _controller: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ControllerHooks for NoHooks {}

/// Controller counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStats {
    /// Successful connects.
    pub connects: u64,
    /// Connections that ended.
    pub disconnects: u64,
    /// Transport handles released.
    pub releases: u64,
    /// Lines read from the link.
    pub lines: u64,
    /// Malformed lines.
    pub malformed: u64,
    /// Estimated sample rate (Hz).
    pub ema_rate: f64,
    /// Rate reported by the peripheral (Hz).
    pub reported_rate: Option<f64>,
}

type LinkReader = BufReader<ReadHalf<DynLink>>;
type LinkWriter = WriteHalf<DynLink>;

/// State machine for one peripheral link.
pub struct DeviceController {
    id: String,
    connector: Arc<dyn Connector>,
    timeouts: WireTimeouts,
    sink: StreamWriter,
    hooks: Arc<dyn ControllerHooks>,
    state: watch::Sender<ControllerState>,
    stop: watch::Sender<bool>,
    reader: Mutex<Option<LinkReader>>,
    writer: Mutex<Option<LinkWriter>>,
    decoder: parking_lot::Mutex<WireDecoder>,
    devices: parking_lot::Mutex<BTreeMap<String, Status>>,
    /// True between a connect and the matching disconnect notification.
    session: AtomicBool,
    connects: AtomicU64,
    disconnects: AtomicU64,
    releases: AtomicU64,
    lines: AtomicU64,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("id", &self.id)
            .field("connector", &self.connector.describe())
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the stop flag is set.
async fn stopped(mut stop: watch::Receiver<bool>) {
    // The sender lives as long as the controller; an error means it is gone
    let _ = stop.wait_for(|stopped| *stopped).await;
}

impl DeviceController {
    /// Creates an idle controller writing decoded readings through `sink`.
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
        timeouts: WireTimeouts,
        sink: StreamWriter,
        hooks: Arc<dyn ControllerHooks>,
    ) -> Self {
        let id = id.into();
        let (state, _) = watch::channel(ControllerState::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            decoder: parking_lot::Mutex::new(WireDecoder::new(id.clone())),
            id,
            connector,
            timeouts,
            sink,
            hooks,
            state,
            stop,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            devices: parking_lot::Mutex::new(BTreeMap::new()),
            session: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            lines: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Waits for the link to become ready, then transitions to `Connected`.
    ///
    /// Cancelled by [`stop`](Self::stop) (returns [`ControllerError::Stopped`]).
    /// A connect failure or timeout leaves the controller `Disconnected`.
    pub async fn start(&self) -> Result<(), ControllerError> {
        if self.is_stopped() {
            return Err(ControllerError::Stopped);
        }
        if self.state() == ControllerState::Connected {
            return Ok(());
        }
        self.set_state(ControllerState::Connecting);
        debug!(controller = %self.id, link = %self.connector.describe(), "Connecting");

        let attempt = tokio::time::timeout(self.timeouts.connect, self.connector.connect());
        let outcome = tokio::select! {
            biased;
            _ = stopped(self.stop.subscribe()) => return Err(ControllerError::Stopped),
            outcome = attempt => outcome,
        };

        let link = match outcome {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                self.set_state(ControllerState::Disconnected);
                return Err(err);
            }
            Err(_) => {
                self.set_state(ControllerState::Disconnected);
                return Err(ControllerError::Timeout(format!(
                    "no readiness within {:?}",
                    self.timeouts.connect
                )));
            }
        };

        let (read_half, write_half) = tokio::io::split(link);
        // stop() enters Stopped before taking the writer lock, and the state
        // never leaves Stopped. Connecting under the lock therefore either
        // loses to stop() or completes before stop() can end the session.
        let mut writer = self.writer.lock().await;
        if !self.set_state(ControllerState::Connected) {
            // Either stop() won, or a concurrent start() already connected
            return if self.is_stopped() {
                Err(ControllerError::Stopped)
            } else {
                Ok(())
            };
        }
        *writer = Some(write_half);
        *self.reader.lock().await = Some(BufReader::new(read_half));
        self.decoder.lock().reset_clock(Utc::now());
        self.session.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::Relaxed);
        info!(controller = %self.id, link = %self.connector.describe(), "Connected");
        self.hooks.on_connect(&self.id);
        Ok(())
    }

    /// Reads and decodes lines until the link drops or `stop()` is called.
    ///
    /// Returns the resulting state: `Disconnected` after a lost link,
    /// `Stopped` after `stop()`. Returns immediately if not connected.
    pub async fn run(&self) -> ControllerState {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return self.state();
        };

        let mut line = Vec::with_capacity(256);
        let reason = loop {
            line.clear();
            let event = tokio::select! {
                biased;
                _ = stopped(self.stop.subscribe()) => None,
                read = tokio::time::timeout(self.timeouts.read, reader.read_until(b'\n', &mut line)) => Some(read),
            };

            match event {
                None => break None,
                Some(Err(_)) => break Some(format!("no data within {:?}", self.timeouts.read)),
                Some(Ok(Err(err))) => break Some(err.to_string()),
                Some(Ok(Ok(0))) => break Some("link closed".to_string()),
                Some(Ok(Ok(_))) => {
                    self.lines.fetch_add(1, Ordering::Relaxed);
                    let text = String::from_utf8_lossy(&line);
                    self.decode(&text);
                }
            }
        };
        drop(reader);

        if let Some(reason) = reason {
            warn!(controller = %self.id, %reason, "Link lost");
            self.set_state(ControllerState::Disconnected);
            self.release_writer().await;
        }
        self.end_session();
        self.state()
    }

    /// Cancels pending `start()`/`run()` suspensions, releases the link and
    /// enters `Stopped`. Safe to call repeatedly and concurrently.
    pub async fn stop(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        self.set_state(ControllerState::Stopped);
        self.release_writer().await;
        // A running run() owns the reader and drops it on its way out
        self.reader.lock().await.take();
        self.end_session();
        info!(controller = %self.id, "Controller stopped");
    }

    /// Sends one JSON line. A no-op when not connected.
    pub async fn write(&self, value: &Value) -> Result<(), ControllerError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!(controller = %self.id, "Write dropped, not connected");
            return Ok(());
        };

        let mut line = serde_json::to_string(value).map_err(|e| ControllerError::Io(e.to_string()))?;
        line.push('\n');
        let send = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.timeouts.write, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ControllerError::Io(err.to_string())),
            Err(_) => Err(ControllerError::Timeout(format!(
                "write not completed within {:?}",
                self.timeouts.write
            ))),
        }
    }

    /// Decodes one framed unit and forwards it to the stream.
    ///
    /// Malformed input is dropped (and logged once per back-to-back repeat).
    pub fn decode(&self, raw: &str) -> Option<Message> {
        let message = self.decoder.lock().decode(raw)?;
        match &message {
            Message::Data {
                readings, statuses, ..
            } => {
                self.sink.extend(readings.iter().cloned());
                self.update_devices(statuses);
            }
            Message::Idle { statuses } => self.update_devices(statuses),
            Message::Feedback { .. } => {}
        }
        Some(message)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Moves to `state` unless already there; `Stopped` is never left.
    /// Returns whether the state changed.
    fn set_state(&self, state: ControllerState) -> bool {
        let mut previous = state;
        let changed = self.state.send_if_modified(|current| {
            if *current == state || *current == ControllerState::Stopped {
                return false;
            }
            previous = std::mem::replace(current, state);
            true
        });
        if changed {
            debug!(controller = %self.id, from = ?previous, to = ?state, "State changed");
        }
        changed
    }

    async fn release_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(self.timeouts.write, writer.shutdown()).await;
            self.releases.fetch_add(1, Ordering::Relaxed);
            debug!(controller = %self.id, "Link released");
        }
    }

    fn end_session(&self) {
        if self.session.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
            self.hooks.on_disconnect(&self.id);
        }
    }

    fn update_devices(&self, statuses: &[(String, Status)]) {
        if statuses.is_empty() {
            return;
        }
        let mut devices = self.devices.lock();
        for (name, status) in statuses {
            devices.insert(name.clone(), *status);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Interface id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Canonical health derived from the state.
    pub fn status(&self) -> Status {
        self.state().status()
    }

    /// Whether `stop()` has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Last reported status of each sub-device behind the link.
    pub fn device_statuses(&self) -> BTreeMap<String, Status> {
        self.devices.lock().clone()
    }

    /// Counters.
    pub fn stats(&self) -> ControllerStats {
        let decoder = self.decoder.lock().stats();
        ControllerStats {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            malformed: decoder.malformed,
            ema_rate: decoder.ema_rate,
            reported_rate: decoder.reported_rate,
        }
    }
}
