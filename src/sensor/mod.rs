//! Bus-attached sensors.
//!
//! A [`Sensor`] wraps one device-specific [`SensorDriver`] and owns everything
//! the drivers have in common:
//!
//! - health bookkeeping: the consecutive-failure `ErrorCount` and [`Status`]
//! - the last good raw sample (stale-but-available on failure)
//! - the record flag, deferred reconfiguration and stuck-at-zero detection
//! - sequencing of `sample()`, `command()` and `stop()` so that a stop never
//!   lands in the middle of another bus interaction
//!
//! Drivers only describe how to talk to their chip and how to decode bytes.
//!
//! # Status policy
//!
//! | Event | Status |
//! |---|---|
//! | constructed | `Disconnected` |
//! | `init()` (whatever the outcome) | `Standby` |
//! | successful sample | `Active` |
//! | `error_threshold` consecutive failures | `Error` |
//! | `stop()` | `Disconnected` (terminal) |

pub mod gpio;
pub mod light_strip;
pub mod pressure;
pub mod register;

pub use gpio::GpioSensor;
pub use light_strip::LightStrip;
pub use pressure::PressureSensor;
pub use register::RegisterSensor;

use crate::config::{HealthPolicy, SensorDefinition, SensorDevice};
use crate::core::{CommandOutcome, Reading, ReadingValue, SampleOutcome, Status};
use crate::error::{BusError, BusResult};
use crate::hardware::BusTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a driver did not apply a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Key or value not applicable; nothing was written.
    Rejected(String),
    /// The write failed on the bus.
    Bus(BusError),
}

impl From<BusError> for CommandError {
    fn from(err: BusError) -> Self {
        CommandError::Bus(err)
    }
}

/// Device-specific part of a sensor.
///
/// Implementations hold only their own configuration (and, where the chip
/// cannot be read back, their own last commanded state); they never share
/// state between instances.
#[async_trait]
pub trait SensorDriver: Send + Sync {
    /// Variant name (`pressure`, `light_strip`, ...).
    fn kind(&self) -> &'static str;

    /// Human readable device name.
    fn name(&self) -> &str;

    /// Parameter short names produced by [`decode`](Self::decode).
    fn parameters(&self) -> Vec<String>;

    /// One-time chip configuration.
    async fn configure(&self, bus: &BusTransport) -> BusResult<()>;

    /// One read transaction; returns the raw sample.
    async fn acquire(&self, bus: &BusTransport) -> BusResult<Vec<u8>>;

    /// Pure transform from a raw sample to named values.
    fn decode(&self, raw: &[u8]) -> Vec<(String, ReadingValue)>;

    /// Applies an operator command.
    async fn apply(&self, bus: &BusTransport, key: &str, value: &Value)
        -> Result<(), CommandError>;

    /// Drives outputs to their safe state.
    async fn safe_state(&self, bus: &BusTransport) -> BusResult<()>;

    /// Whether an all-zero sample indicates a chip that lost its configuration.
    fn detects_stuck_zero(&self) -> bool {
        true
    }
}

/// Serializable sensor summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorInfo {
    /// Interface id.
    pub id: String,
    /// Variant name.
    pub kind: String,
    /// Device name.
    pub name: String,
    /// Parameter short names.
    pub parameters: Vec<String>,
    /// Current status.
    pub status: Status,
    /// Consecutive failures.
    pub error_count: u32,
    /// Whether the sensor is being polled.
    pub record: bool,
}

#[derive(Debug, Clone)]
struct RawSample {
    bytes: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SensorState {
    error_count: u32,
    last: Option<RawSample>,
    zero_count: u32,
    record: bool,
    stopped: bool,
    reconfigure: bool,
}

/// A bus-attached device with health bookkeeping.
pub struct Sensor {
    id: String,
    driver: Box<dyn SensorDriver>,
    bus: BusTransport,
    policy: HealthPolicy,
    /// Serializes bus interactions of this sensor (sample, command, stop).
    io: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<SensorState>,
    status: watch::Sender<Status>,
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("id", &self.id)
            .field("kind", &self.driver.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl Sensor {
    /// Creates a sensor around a driver.
    pub fn new(
        id: impl Into<String>,
        driver: Box<dyn SensorDriver>,
        bus: BusTransport,
        policy: HealthPolicy,
    ) -> Self {
        let (status, _) = watch::channel(Status::Disconnected);
        Self {
            id: id.into(),
            driver,
            bus,
            policy,
            io: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(SensorState {
                record: true,
                ..SensorState::default()
            }),
            status,
        }
    }

    /// Builds a sensor from its configuration entry.
    pub fn from_definition(definition: &SensorDefinition, bus: BusTransport) -> Self {
        let driver: Box<dyn SensorDriver> = match &definition.device {
            SensorDevice::Pressure { address, divisor } => {
                Box::new(PressureSensor::new(*address, *divisor))
            }
            SensorDevice::LightStrip { address } => Box::new(LightStrip::new(*address)),
            SensorDevice::Gpio { inputs, outputs } => {
                Box::new(GpioSensor::new(inputs.clone(), outputs.clone()))
            }
            SensorDevice::Register {
                address,
                register,
                parameters,
            } => Box::new(RegisterSensor::new(*address, *register, parameters.clone())),
        };
        let sensor = Self::new(definition.id.clone(), driver, bus, definition.policy);
        sensor.state.lock().record = definition.record;
        sensor
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// One-time configuration. Always ends in `Standby`; a failed
    /// configuration is retried by the next [`sample`](Self::sample).
    pub async fn init(&self) {
        let _io = self.io.lock().await;
        if self.state.lock().stopped {
            return;
        }

        match self.driver.configure(&self.bus).await {
            Ok(()) => {
                self.state.lock().reconfigure = false;
                info!(sensor = %self.id, kind = self.driver.kind(), "Sensor configured");
            }
            Err(err) => {
                self.state.lock().reconfigure = true;
                warn!(sensor = %self.id, error = %err, "Sensor configuration failed, will retry on next sample");
            }
        }
        self.set_status(Status::Standby);
    }

    /// Performs one read transaction and updates health bookkeeping.
    ///
    /// Never fails: the outcome is reported as a value and the previous good
    /// sample stays available when the read fails.
    pub async fn sample(&self) -> SampleOutcome {
        let _io = self.io.lock().await;
        let reconfigure = {
            let state = self.state.lock();
            if state.stopped || !state.record {
                return SampleOutcome::Skipped;
            }
            state.reconfigure
        };

        if reconfigure {
            if let Err(err) = self.driver.configure(&self.bus).await {
                self.note_failure(&err);
                return SampleOutcome::Failed(err);
            }
            self.state.lock().reconfigure = false;
            debug!(sensor = %self.id, "Sensor reconfigured");
        }

        match self.driver.acquire(&self.bus).await {
            Ok(bytes) => {
                self.note_sample(bytes);
                SampleOutcome::Sampled
            }
            Err(err) => {
                self.note_failure(&err);
                SampleOutcome::Failed(err)
            }
        }
    }

    /// Decodes the last good sample. Pure: repeated calls return the same values.
    pub fn to_readings(&self) -> Vec<Reading> {
        let Some(last) = self.state.lock().last.clone() else {
            return Vec::new();
        };
        self.driver
            .decode(&last.bytes)
            .into_iter()
            .map(|(parameter, value)| Reading::new(&self.id, parameter, value, last.timestamp))
            .collect()
    }

    /// Applies an operator command.
    ///
    /// `record` toggles polling locally. Every other key goes to the driver;
    /// bus failures count towards the ErrorCount exactly like sample failures.
    pub async fn command(&self, key: &str, value: &Value) -> CommandOutcome {
        if key == "record" {
            let Some(record) = value
                .as_bool()
                .or_else(|| value.as_i64().map(|v| v != 0))
            else {
                return CommandOutcome::Rejected(format!("record expects a boolean, got {}", value));
            };
            self.state.lock().record = record;
            info!(sensor = %self.id, record, "Record flag changed");
            return CommandOutcome::Accepted;
        }

        let _io = self.io.lock().await;
        if self.state.lock().stopped {
            return CommandOutcome::Rejected("sensor stopped".into());
        }

        match self.driver.apply(&self.bus, key, value).await {
            Ok(()) => {
                self.note_success();
                CommandOutcome::Accepted
            }
            Err(CommandError::Rejected(reason)) => {
                debug!(sensor = %self.id, key, %reason, "Command rejected");
                CommandOutcome::Rejected(reason)
            }
            Err(CommandError::Bus(err)) => {
                self.note_failure(&err);
                CommandOutcome::Failed(err)
            }
        }
    }

    /// Drives outputs to the safe state and sets `Disconnected`. Idempotent.
    ///
    /// Waits for an in-flight sample or command of this sensor to finish.
    pub async fn stop(&self) {
        let _io = self.io.lock().await;
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }

        if let Err(err) = self.driver.safe_state(&self.bus).await {
            warn!(sensor = %self.id, error = %err, "Failed to drive safe state");
        }
        self.set_status(Status::Disconnected);
        info!(sensor = %self.id, "Sensor stopped");
    }

    // =========================================================================
    // Health bookkeeping
    // =========================================================================

    fn set_status(&self, status: Status) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(sensor = %self.id, from = %previous, to = %status, "Status changed");
        }
    }

    fn note_sample(&self, bytes: Vec<u8>) {
        {
            let mut state = self.state.lock();
            state.error_count = 0;

            let all_zero = !bytes.is_empty() && bytes.iter().all(|b| *b == 0);
            if all_zero && self.driver.detects_stuck_zero() {
                state.zero_count += 1;
                let threshold = self.policy.zero_reinit_threshold;
                if threshold > 0 && state.zero_count > threshold {
                    warn!(sensor = %self.id, zero_count = state.zero_count, "Sensor stuck at zero, reconfiguring");
                    state.zero_count = 0;
                    state.reconfigure = true;
                }
            } else {
                state.zero_count = 0;
            }

            state.last = Some(RawSample {
                bytes,
                timestamp: Utc::now(),
            });
        }
        self.set_status(Status::Active);
    }

    fn note_success(&self) {
        self.state.lock().error_count = 0;
        if self.status() == Status::Error {
            self.set_status(Status::Active);
        }
    }

    fn note_failure(&self, err: &BusError) {
        let error_count = {
            let mut state = self.state.lock();
            state.error_count = state.error_count.saturating_add(1);
            state.error_count
        };
        debug!(sensor = %self.id, error_count, error = %err, "Bus transaction failed");

        if error_count >= self.policy.error_threshold && self.status() != Status::Error {
            warn!(sensor = %self.id, error_count, "Sensor failing, escalating to error");
            self.set_status(Status::Error);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Interface id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Variant name.
    pub fn kind(&self) -> &'static str {
        self.driver.kind()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Consecutive failed bus transactions.
    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    /// Whether the sensor is being polled.
    pub fn is_recording(&self) -> bool {
        self.state.lock().record
    }

    /// Whether `stop()` has run.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Serializable summary.
    pub fn info(&self) -> SensorInfo {
        let state = self.state.lock();
        SensorInfo {
            id: self.id.clone(),
            kind: self.driver.kind().to_string(),
            name: self.driver.name().to_string(),
            parameters: self.driver.parameters(),
            status: self.status(),
            error_count: state.error_count,
            record: state.record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusErrorKind;
    use crate::hardware::{BusSettings, SimulatedBus};
    use serde_json::json;
    use std::time::Duration;

    fn bus() -> (SimulatedBus, BusTransport) {
        let sim = SimulatedBus::new();
        let transport = BusTransport::new(
            sim.clone(),
            BusSettings {
                retries: 0,
                retry_delay: Duration::from_millis(1),
                lock_timeout: Duration::from_millis(100),
                timeout: Duration::from_millis(500),
            },
        );
        (sim, transport)
    }

    fn pressure(bus: BusTransport, error_threshold: u32) -> Sensor {
        Sensor::new(
            "PInt",
            Box::new(PressureSensor::new(0x5C, pressure::DEFAULT_DIVISOR)),
            bus,
            HealthPolicy {
                error_threshold,
                zero_reinit_threshold: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_init_sets_standby_even_on_failure() {
        let (sim, bus) = bus();
        sim.set_absent(0x5C, true);
        let sensor = pressure(bus, 5);
        assert_eq!(sensor.status(), Status::Disconnected);

        sensor.init().await;
        assert_eq!(sensor.status(), Status::Standby);
        assert_eq!(sensor.error_count(), 0);

        // Deferred configuration failure shows up in the next sample
        assert!(matches!(sensor.sample().await, SampleOutcome::Failed(_)));
        assert_eq!(sensor.error_count(), 1);

        sim.set_absent(0x5C, false);
        assert!(sensor.sample().await.is_success());
        assert_eq!(sim.register(0x5C, pressure::CTRL_REG1), Some(pressure::CTRL_REG1_RUN));
    }

    #[tokio::test]
    async fn test_escalates_to_error_and_recovers() {
        let (sim, bus) = bus();
        let sensor = pressure(bus, 3);
        sensor.init().await;
        assert!(sensor.sample().await.is_success());
        assert_eq!(sensor.status(), Status::Active);

        sim.set_absent(0x5C, true);
        for expected in 1..=2 {
            sensor.sample().await;
            assert_eq!(sensor.error_count(), expected);
            assert_eq!(sensor.status(), Status::Active);
        }
        sensor.sample().await;
        assert_eq!(sensor.status(), Status::Error);

        sim.set_absent(0x5C, false);
        sensor.sample().await;
        assert_eq!(sensor.error_count(), 0);
        assert_eq!(sensor.status(), Status::Active);
    }

    #[tokio::test]
    async fn test_default_policy_escalates_on_fifth_failure() {
        let (sim, bus) = bus();
        let sensor = Sensor::new(
            "PInt",
            Box::new(PressureSensor::new(0x5C, pressure::DEFAULT_DIVISOR)),
            bus,
            HealthPolicy::default(),
        );
        sensor.init().await;
        assert!(sensor.sample().await.is_success());

        sim.set_absent(0x5C, true);
        for expected in 1..=4 {
            sensor.sample().await;
            assert_eq!(sensor.error_count(), expected);
            assert_eq!(sensor.status(), Status::Active);
        }
        sensor.sample().await;
        assert_eq!(sensor.error_count(), 5);
        assert_eq!(sensor.status(), Status::Error);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_last_reading() {
        let (sim, bus) = bus();
        sim.set_registers(0x5C, pressure::PRESS_OUT_XL, &[0x00, 0x00, 0x01, 0xD0, 0x07]);
        let sensor = pressure(bus, 5);
        sensor.init().await;
        sensor.sample().await;
        let before = sensor.to_readings();
        assert_eq!(before.len(), 2);

        sim.fail_next(1);
        assert!(!sensor.sample().await.is_success());
        assert_eq!(sensor.to_readings(), before);
        assert_eq!(sensor.to_readings(), before);
    }

    #[tokio::test]
    async fn test_stuck_at_zero_triggers_reconfiguration() {
        let (sim, bus) = bus();
        sim.set_registers(0x5C, pressure::PRESS_OUT_XL, &[0; 5]);
        let sensor = pressure(bus, 5);
        sensor.init().await;

        for _ in 0..4 {
            assert!(sensor.sample().await.is_success());
        }
        sim.clear_operations();
        sensor.sample().await;

        let ops = sim.operations();
        assert_eq!(ops[0].target, pressure::CTRL_REG1);
        assert_eq!(sensor.error_count(), 0);
    }

    #[tokio::test]
    async fn test_record_flag_skips_sampling() {
        let (sim, bus) = bus();
        let sensor = pressure(bus, 5);
        sensor.init().await;

        assert_eq!(
            sensor.command("record", &json!(false)).await,
            CommandOutcome::Accepted
        );
        sim.clear_operations();
        assert_eq!(sensor.sample().await, SampleOutcome::Skipped);
        assert!(sim.operations().is_empty());

        sensor.command("record", &json!(1)).await;
        assert!(sensor.sample().await.is_success());
        assert!(matches!(
            sensor.command("record", &json!("yes")).await,
            CommandOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_command_failure_counts_as_error() {
        let (sim, bus) = bus();
        let sensor = Sensor::new(
            "Light",
            Box::new(LightStrip::new(0x55)),
            bus,
            HealthPolicy::default(),
        );
        sensor.init().await;

        sim.set_absent(0x55, true);
        let outcome = sensor.command("fill", &json!([255, 0, 128])).await;
        assert!(matches!(
            outcome,
            CommandOutcome::Failed(BusError {
                kind: BusErrorKind::NoAcknowledge,
                ..
            })
        ));
        assert_eq!(sensor.error_count(), 1);

        sim.set_absent(0x55, false);
        assert_eq!(
            sensor.command("fill", &json!([255, 0, 128])).await,
            CommandOutcome::Accepted
        );
        assert_eq!(sensor.error_count(), 0);
        assert!(matches!(
            sensor.command("blink", &json!(1)).await,
            CommandOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let (sim, bus) = bus();
        let sensor = Sensor::new(
            "GPIO",
            Box::new(GpioSensor::new(vec![18], vec![6])),
            bus,
            HealthPolicy::default(),
        );
        sensor.init().await;
        sensor.command("6", &json!(true)).await;
        assert_eq!(sim.output_level(6), Some(true));

        sensor.stop().await;
        sensor.stop().await;
        assert_eq!(sensor.status(), Status::Disconnected);
        assert_eq!(sim.output_level(6), Some(false));
        assert_eq!(sensor.sample().await, SampleOutcome::Skipped);
        assert!(matches!(
            sensor.command("6", &json!(true)).await,
            CommandOutcome::Rejected(_)
        ));
        assert_eq!(sim.output_level(6), Some(false));
    }

    #[tokio::test]
    async fn test_info() {
        let (_sim, bus) = bus();
        let sensor = pressure(bus, 5);
        let info = sensor.info();
        assert_eq!(info.kind, "pressure");
        assert_eq!(info.parameters, vec!["PRS".to_string(), "TMP".to_string()]);
        assert!(info.record);
    }
}
