//! Recorder orchestration.
//!
//! The [`Recorder`] owns every configured sensor and controller, the bus they
//! share and the [`SharedBuffer`] they write into. After [`Recorder::start`]:
//!
//! - one poll task samples all recording sensors every `poll_interval` and
//!   appends their readings to the sensor streams
//! - one supervision task per controller runs `start()` / `run()` and restarts
//!   a lost link after `reconnect_delay`
//!
//! Consumers use the query, status and command methods. [`Recorder::shutdown`]
//! cancels controllers, halts polling, drives every sensor to its safe state
//! and joins the background tasks.

use crate::config::RecorderConfig;
use crate::controller::{connector_for, ControllerState, DeviceController, NoHooks};
use crate::core::{Command, CommandOutcome, SampleOutcome, Status};
use crate::data::{RangeEnd, RangeStart, SharedBuffer, StoredReading, StreamWriter};
use crate::error::{AppResult, ControllerError, DaqError};
use crate::hardware::{open_bus, BusTransport};
use crate::nested;
use crate::sensor::{Sensor, SensorInfo};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Health summary of one interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceStatus {
    /// Interface id.
    pub interface: String,
    /// `sensor` or `controller`.
    pub role: &'static str,
    /// Current health.
    pub status: Status,
    /// Consecutive failures (always 0 for controllers).
    pub error_count: u32,
    /// Readings currently retained for this interface.
    pub retained: usize,
}

struct ControllerSlot {
    controller: Arc<DeviceController>,
    start_command: Option<Value>,
}

/// Owns the acquisition pipeline.
pub struct Recorder {
    config: RecorderConfig,
    bus: BusTransport,
    buffer: Arc<SharedBuffer>,
    sensors: Vec<Arc<Sensor>>,
    controllers: Vec<ControllerSlot>,
    /// Sensor stream writers, moved into the poll task by `start()`.
    sensor_writers: parking_lot::Mutex<Option<Vec<StreamWriter>>>,
    stop: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("name", &self.config.application.name)
            .field("bus", &self.bus.name())
            .field("sensors", &self.sensors.len())
            .field("controllers", &self.controllers.len())
            .finish()
    }
}

impl Recorder {
    /// Validates `config`, opens the configured bus and builds every component.
    pub fn from_config(config: RecorderConfig) -> AppResult<Self> {
        config.validate()?;
        let bus = open_bus(&config.bus)?;
        Self::with_bus(config, bus)
    }

    /// Builds every component on an already opened bus.
    ///
    /// Each enabled sensor and controller claims its stream here, so a budget
    /// that cannot hold all of them fails before anything is started.
    pub fn with_bus(config: RecorderConfig, bus: BusTransport) -> AppResult<Self> {
        let buffer = Arc::new(SharedBuffer::new(config.buffer.clone()));

        let mut sensors = Vec::new();
        let mut sensor_writers = Vec::new();
        for definition in config.enabled_sensors() {
            let writer = buffer.claim(&definition.id)?;
            sensors.push(Arc::new(Sensor::from_definition(definition, bus.clone())));
            sensor_writers.push(writer);
        }

        let mut controllers = Vec::new();
        for definition in config.enabled_controllers() {
            let connector = connector_for(&definition.link)?;
            let writer = buffer.claim(&definition.id)?;
            let controller = DeviceController::new(
                definition.id.clone(),
                connector,
                definition.timeouts,
                writer,
                Arc::new(NoHooks),
            );
            controllers.push(ControllerSlot {
                controller: Arc::new(controller),
                start_command: definition.start_command.clone(),
            });
        }

        info!(
            sensors = sensors.len(),
            controllers = controllers.len(),
            bus = bus.name(),
            "Recorder assembled"
        );

        let (stop, _) = watch::channel(false);
        Ok(Self {
            config,
            bus,
            buffer,
            sensors,
            controllers,
            sensor_writers: parking_lot::Mutex::new(Some(sensor_writers)),
            stop,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Configures the sensors and spawns the poll and supervision tasks.
    ///
    /// Calling it again while running is a no-op; after
    /// [`shutdown`](Self::shutdown) it fails with [`DaqError::ShutDown`].
    pub async fn start(&self) -> AppResult<()> {
        if *self.stop.borrow() {
            return Err(DaqError::ShutDown);
        }
        let Some(writers) = self.sensor_writers.lock().take() else {
            debug!("Recorder already started");
            return Ok(());
        };

        join_all(self.sensors.iter().map(|sensor| sensor.init())).await;

        let mut tasks = Vec::with_capacity(self.controllers.len() + 1);
        let polled: Vec<_> = self.sensors.iter().cloned().zip(writers).collect();
        if !polled.is_empty() {
            tasks.push((
                "sensor poll".to_string(),
                tokio::spawn(poll_sensors(
                    polled,
                    self.config.scheduler.poll_interval,
                    self.stop.subscribe(),
                )),
            ));
        }

        for slot in &self.controllers {
            tasks.push((
                slot.controller.id().to_string(),
                tokio::spawn(supervise(
                    Arc::clone(&slot.controller),
                    slot.start_command.clone(),
                    self.config.scheduler.reconnect_delay,
                    self.stop.subscribe(),
                )),
            ));
        }

        self.tasks.lock().extend(tasks);
        info!(
            poll_interval = ?self.config.scheduler.poll_interval,
            "Recorder started"
        );
        Ok(())
    }

    /// Stops everything. Idempotent.
    ///
    /// Controllers are cancelled first, then polling halts and every sensor is
    /// driven to its safe state. Background tasks that do not finish within
    /// `shutdown_timeout` are aborted and reported.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.stop.send_replace(true) {
            return Ok(());
        }
        info!("Recorder shutting down");

        join_all(self.controllers.iter().map(|slot| slot.controller.stop())).await;
        join_all(self.sensors.iter().map(|sensor| sensor.stop())).await;
        self.sensor_writers.lock().take();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + self.config.scheduler.shutdown_timeout;
        let mut errors = Vec::new();
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(DaqError::Task {
                    name,
                    reason: err.to_string(),
                }),
                Err(_) => {
                    handle.abort();
                    errors.push(DaqError::Task {
                        name,
                        reason: "did not finish before shutdown timeout".into(),
                    });
                }
            }
        }

        if errors.is_empty() {
            info!("Recorder stopped");
            Ok(())
        } else {
            for err in &errors {
                error!(error = %err, "Shutdown problem");
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    pub fn is_shut_down(&self) -> bool {
        *self.stop.borrow()
    }

    // =========================================================================
    // Consumer API
    // =========================================================================

    /// Range read over one interface's stream.
    pub fn query(
        &self,
        interface: &str,
        start: RangeStart,
        end: RangeEnd,
        count: Option<usize>,
    ) -> AppResult<Vec<Arc<StoredReading>>> {
        self.ensure_known(interface)?;
        Ok(self.buffer.query(interface, start, end, count))
    }

    /// Range read reduced to roughly `max_len` evenly spaced readings.
    pub fn query_decimated(
        &self,
        interface: &str,
        start: RangeStart,
        end: RangeEnd,
        count: Option<usize>,
        max_len: usize,
    ) -> AppResult<Vec<Arc<StoredReading>>> {
        self.ensure_known(interface)?;
        Ok(self
            .buffer
            .query_decimated(interface, start, end, count, max_len))
    }

    /// Most recent reading of an interface.
    pub fn latest(&self, interface: &str) -> AppResult<Option<Arc<StoredReading>>> {
        self.ensure_known(interface)?;
        Ok(self.buffer.latest(interface))
    }

    /// Current health of an interface.
    pub fn status(&self, interface: &str) -> AppResult<Status> {
        if let Some(sensor) = self.sensor(interface) {
            return Ok(sensor.status());
        }
        self.controller(interface)
            .map(|controller| controller.status())
            .ok_or_else(|| DaqError::UnknownInterface(interface.to_string()))
    }

    /// Consecutive failures of a sensor; controllers report 0.
    pub fn error_count(&self, interface: &str) -> AppResult<u32> {
        if let Some(sensor) = self.sensor(interface) {
            return Ok(sensor.error_count());
        }
        self.controller(interface)
            .map(|_| 0)
            .ok_or_else(|| DaqError::UnknownInterface(interface.to_string()))
    }

    /// Routes an operator command to `interface`.
    ///
    /// Shorthand for [`dispatch`](Self::dispatch) with a [`Command`].
    pub async fn send_command(
        &self,
        interface: &str,
        key: &str,
        value: Value,
    ) -> AppResult<CommandOutcome> {
        self.dispatch(Command::new(interface, key, value)).await
    }

    /// Delivers a command to its target.
    ///
    /// Sensors interpret `key` themselves. For controllers a dotted key is
    /// expanded into nested objects (`"CTRL.freq"` → `{"CTRL": {"freq": v}}`),
    /// an empty key sends `value` as is; the result is written as one line.
    pub async fn dispatch(&self, command: Command) -> AppResult<CommandOutcome> {
        let Command { target, key, value } = command;
        let interface = target.as_str();
        if let Some(sensor) = self.sensor(interface) {
            return Ok(sensor.command(&key, &value).await);
        }
        let Some(controller) = self.controller(interface) else {
            return Err(DaqError::UnknownInterface(target));
        };

        if controller.state() != ControllerState::Connected {
            return Ok(CommandOutcome::Rejected(format!(
                "controller is {:?}",
                controller.state()
            )));
        }
        let payload = if nested::split_path(&key).is_empty() {
            value
        } else {
            nested::expand(&key, value)
        };
        match controller.write(&payload).await {
            Ok(()) => {
                debug!(controller = %interface, %payload, "Command sent");
                Ok(CommandOutcome::Accepted)
            }
            Err(err) => Ok(CommandOutcome::Rejected(err.to_string())),
        }
    }

    /// Health summary of every interface, sensors first, in configuration order.
    pub fn statuses(&self) -> Vec<InterfaceStatus> {
        let sensors = self.sensors.iter().map(|sensor| InterfaceStatus {
            interface: sensor.id().to_string(),
            role: "sensor",
            status: sensor.status(),
            error_count: sensor.error_count(),
            retained: self.buffer.len(sensor.id()),
        });
        let controllers = self.controllers.iter().map(|slot| InterfaceStatus {
            interface: slot.controller.id().to_string(),
            role: "controller",
            status: slot.controller.status(),
            error_count: 0,
            retained: self.buffer.len(slot.controller.id()),
        });
        sensors.chain(controllers).collect()
    }

    /// Descriptions of all sensors.
    pub fn sensor_info(&self) -> Vec<SensorInfo> {
        self.sensors.iter().map(|sensor| sensor.info()).collect()
    }

    /// Sensor by interface id.
    pub fn sensor(&self, interface: &str) -> Option<&Arc<Sensor>> {
        self.sensors.iter().find(|sensor| sensor.id() == interface)
    }

    /// Controller by interface id.
    pub fn controller(&self, interface: &str) -> Option<&Arc<DeviceController>> {
        self.controllers
            .iter()
            .map(|slot| &slot.controller)
            .find(|controller| controller.id() == interface)
    }

    /// The shared buffer.
    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }

    /// The bus shared by all sensors.
    pub fn bus(&self) -> &BusTransport {
        &self.bus
    }

    /// Configuration the recorder was built from.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn ensure_known(&self, interface: &str) -> AppResult<()> {
        if self.sensor(interface).is_some() || self.controller(interface).is_some() {
            Ok(())
        } else {
            Err(DaqError::UnknownInterface(interface.to_string()))
        }
    }
}

// =============================================================================
// Background tasks
// =============================================================================

/// Resolves once shutdown was requested (or the recorder is gone).
async fn shutdown_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn poll_sensors(
    sensors: Vec<(Arc<Sensor>, StreamWriter)>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        // Sensors sharing a bus are serialized by the transport
        let outcomes = join_all(sensors.iter().map(|(sensor, _)| sensor.sample())).await;
        for ((sensor, writer), outcome) in sensors.iter().zip(outcomes) {
            match outcome {
                SampleOutcome::Sampled => writer.extend(sensor.to_readings()),
                SampleOutcome::Failed(err) => {
                    debug!(sensor = %sensor.id(), errors = sensor.error_count(), error = %err, "Sample failed");
                }
                SampleOutcome::Skipped => {}
            }
        }
    }
    debug!("Sensor poll loop finished");
}

async fn supervise(
    controller: Arc<DeviceController>,
    start_command: Option<Value>,
    reconnect_delay: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        match controller.start().await {
            Ok(()) => {
                if let Some(command) = &start_command {
                    if let Err(err) = controller.write(command).await {
                        warn!(controller = %controller.id(), error = %err, "Start command not sent");
                    }
                }
                if controller.run().await == ControllerState::Stopped {
                    break;
                }
            }
            Err(ControllerError::Stopped) => break,
            Err(err) => warn!(controller = %controller.id(), error = %err, "Connect failed"),
        }

        let Some(delay) = reconnect_delay else {
            info!(controller = %controller.id(), "Link down, reconnect disabled");
            break;
        };
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut stop) => break,
            _ = tokio::time::sleep(delay) => {
                debug!(controller = %controller.id(), "Reconnecting");
            }
        }
    }
}
