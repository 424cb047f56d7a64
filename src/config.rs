//! Recorder configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `REC_DAQ_` (nesting split on `__`)
//!
//! Every component receives its own typed section; all fields have defaults so
//! an empty file yields a runnable, simulated setup.
//!
//! # Example
//! ```no_run
//! use rec_daq::config::RecorderConfig;
//!
//! let config = RecorderConfig::load_from("config/recorder.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), rec_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Bus backend selection and transaction policy
    #[serde(default)]
    pub bus: BusConfig,
    /// Shared buffer sizing
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Poll loop and controller supervision
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Bus-attached sensors
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
    /// Serial/network peripherals
    #[serde(default)]
    pub controllers: Vec<ControllerDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Which bus implementation backs the sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    /// Software double with synthetic values.
    #[default]
    Simulated,
    /// Linux I2C character device + sysfs GPIO (feature `linux_hal`).
    Linux,
}

/// Bus transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend implementation
    #[serde(default)]
    pub backend: BusBackend,
    /// I2C character device used by the Linux backend
    #[serde(default = "default_i2c_device")]
    pub i2c_device: String,
    /// Extra attempts after a transient failure within one transaction
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Pause between attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Maximum wait for exclusive bus access
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Upper bound for one complete transaction (lock wait included)
    #[serde(default = "default_bus_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            i2c_device: default_i2c_device(),
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            lock_timeout: default_lock_timeout(),
            timeout: default_bus_timeout(),
        }
    }
}

/// Shared buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Total memory budget across all streams, in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: usize,
    /// Number of equal shares the budget is divided into for streams without an explicit quota
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Explicit per-interface byte quotas
    #[serde(default)]
    pub stream_quotas: BTreeMap<String, usize>,
    /// Optional cap on the number of readings per stream
    #[serde(default)]
    pub max_records: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory(),
            max_streams: default_max_streams(),
            stream_quotas: BTreeMap::new(),
            max_records: None,
        }
    }
}

impl BufferConfig {
    /// Byte quota an interface receives when its stream is created.
    pub fn quota_for(&self, interface: &str) -> usize {
        self.stream_quotas
            .get(interface)
            .copied()
            .unwrap_or_else(|| self.default_share())
    }

    /// Equal share of the budget.
    pub fn default_share(&self) -> usize {
        self.max_memory_bytes / self.max_streams.max(1)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sensor poll period
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Delay before restarting a disconnected controller; `None` disables reconnects
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Option<Duration>,
    /// Upper bound for joining background tasks on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            reconnect_delay: default_reconnect_delay(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Health policy applied by a [`Sensor`](crate::sensor::Sensor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Consecutive failures that escalate Status to Error
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// All-zero samples tolerated before reconfiguring the chip (0 disables)
    #[serde(default = "default_zero_reinit_threshold")]
    pub zero_reinit_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            zero_reinit_threshold: default_zero_reinit_threshold(),
        }
    }
}

/// Sensor definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Unique interface identifier (stream name)
    pub id: String,
    /// Whether this sensor is created at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Whether the sensor is polled from the start
    #[serde(default = "default_enabled")]
    pub record: bool,
    /// Health policy
    #[serde(default)]
    pub policy: HealthPolicy,
    /// Device variant
    pub device: SensorDevice,
}

/// Device-specific sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorDevice {
    /// Barometric pressure chip (pressure + temperature registers)
    Pressure {
        /// I2C address
        #[serde(default = "default_pressure_address")]
        address: u8,
        /// Raw pressure counts per output unit
        #[serde(default = "default_pressure_divisor")]
        divisor: f64,
    },
    /// Addressable RGB light strip controller
    LightStrip {
        /// I2C address
        #[serde(default = "default_light_strip_address")]
        address: u8,
    },
    /// Digital pins
    Gpio {
        /// Pins read as inputs (pull-down)
        #[serde(default)]
        inputs: Vec<u8>,
        /// Pins driven as outputs (low when safe)
        #[serde(default)]
        outputs: Vec<u8>,
    },
    /// Generic register block, one byte per parameter
    Register {
        /// I2C address
        address: u8,
        /// First register
        register: u8,
        /// Parameter names, one per byte read
        parameters: Vec<String>,
    },
}

/// Controller definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerDefinition {
    /// Unique interface identifier (stream name)
    pub id: String,
    /// Whether this controller is created at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How the link is established
    pub link: LinkConfig,
    /// Wire timeouts
    #[serde(default)]
    pub timeouts: WireTimeouts,
    /// JSON value written after every successful connect
    #[serde(default)]
    pub start_command: Option<serde_json::Value>,
}

/// Timeouts applied to one controller link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTimeouts {
    /// Upper bound for the readiness wait in `start()`
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect: Duration,
    /// Silence after which the link is considered lost
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read: Duration,
    /// Upper bound for one outbound write
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write: Duration,
}

impl Default for WireTimeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
            write: default_write_timeout(),
        }
    }
}

/// Link definition for a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkConfig {
    /// USB/serial device (feature `serial`)
    Serial {
        /// Device path, e.g. `/dev/ttyACM0`
        path: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// TCP stream
    Tcp {
        /// `host:port`
        address: String,
    },
    /// In-process peripheral producing synthetic data lines
    Simulated {
        /// Line period
        #[serde(default = "default_simulated_interval", with = "humantime_serde")]
        interval: Duration,
    },
}

// Default value functions
fn default_name() -> String {
    "rec_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_i2c_device() -> String {
    "/dev/i2c-1".to_string()
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(2)
}

fn default_lock_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_bus_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_max_memory() -> usize {
    128_000_000
}

fn default_max_streams() -> usize {
    16
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_reconnect_delay() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_error_threshold() -> u32 {
    5
}

fn default_zero_reinit_threshold() -> u32 {
    0xFD
}

fn default_enabled() -> bool {
    true
}

fn default_pressure_address() -> u8 {
    0x5C
}

fn default_pressure_divisor() -> f64 {
    5460.86912
}

fn default_light_strip_address() -> u8 {
    0x55
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_simulated_interval() -> Duration {
    Duration::from_millis(100)
}

impl RecorderConfig {
    /// Load configuration from a specific file path merged with `REC_DAQ_` environment variables
    ///
    /// Example override: `REC_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("REC_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment layer)
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(source)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.scheduler.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "scheduler.poll_interval must be greater than zero".into(),
            ));
        }

        if self.bus.timeout.is_zero() || self.bus.lock_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "bus.timeout and bus.lock_timeout must be greater than zero".into(),
            ));
        }

        // Interface ids are stream names and must be unique across sensors and controllers
        let mut ids = HashSet::new();
        for id in self
            .enabled_sensors()
            .map(|s| &s.id)
            .chain(self.enabled_controllers().map(|c| &c.id))
        {
            if id.is_empty() {
                return Err(DaqError::Configuration("Empty interface id".into()));
            }
            if !ids.insert(id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate interface ID: {}",
                    id
                )));
            }
        }

        if self.buffer.max_streams == 0 {
            return Err(DaqError::Configuration(
                "buffer.max_streams must be at least 1".into(),
            ));
        }

        let explicit: usize = self.buffer.stream_quotas.values().sum();
        if explicit > self.buffer.max_memory_bytes {
            return Err(DaqError::Configuration(format!(
                "Stream quotas ({} bytes) exceed buffer.max_memory_bytes ({} bytes)",
                explicit, self.buffer.max_memory_bytes
            )));
        }

        let planned: usize = ids.iter().map(|id| self.buffer.quota_for(id)).sum();
        if planned > self.buffer.max_memory_bytes {
            return Err(DaqError::Configuration(format!(
                "{} interfaces need {} bytes of quota but the budget is {} bytes; raise max_streams or lower stream_quotas",
                ids.len(),
                planned,
                self.buffer.max_memory_bytes
            )));
        }

        for sensor in self.enabled_sensors() {
            if sensor.policy.error_threshold == 0 {
                return Err(DaqError::Configuration(format!(
                    "Sensor '{}' has error_threshold = 0; it must be at least 1",
                    sensor.id
                )));
            }
            if let SensorDevice::Register { parameters, .. } = &sensor.device {
                if parameters.is_empty() {
                    return Err(DaqError::Configuration(format!(
                        "Register sensor '{}' needs at least one parameter",
                        sensor.id
                    )));
                }
            }
            if let SensorDevice::Pressure { divisor, .. } = &sensor.device {
                if *divisor == 0.0 {
                    return Err(DaqError::Configuration(format!(
                        "Pressure sensor '{}' has a zero divisor",
                        sensor.id
                    )));
                }
            }
        }

        for controller in self.enabled_controllers() {
            if let LinkConfig::Simulated { interval } = &controller.link {
                if interval.is_zero() {
                    return Err(DaqError::Configuration(format!(
                        "Controller '{}' has a zero simulated link interval",
                        controller.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// All enabled sensors
    pub fn enabled_sensors(&self) -> impl Iterator<Item = &SensorDefinition> {
        self.sensors.iter().filter(|s| s.enabled)
    }

    /// All enabled controllers
    pub fn enabled_controllers(&self) -> impl Iterator<Item = &ControllerDefinition> {
        self.controllers.iter().filter(|c| c.enabled)
    }
}
