//! Core data types shared by sensors, controllers and the shared buffer.
use crate::error::BusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by a single [`Reading`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    /// Digital level or flag.
    Bool(bool),
    /// Integer value (packed colors, counters, raw bytes).
    Int(i64),
    /// Calibrated floating point value.
    Float(f64),
    /// Free text reported by a peripheral.
    Text(String),
}

impl ReadingValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ReadingValue::Int(i) => Some(*i as f64),
            ReadingValue::Float(f) => Some(*f),
            ReadingValue::Text(_) => None,
        }
    }

    /// Converts a scalar JSON value. Objects, arrays and nulls have no reading form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(ReadingValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(ReadingValue::Int)
                .or_else(|| n.as_f64().map(ReadingValue::Float)),
            serde_json::Value::String(s) => Some(ReadingValue::Text(s.clone())),
            _ => None,
        }
    }

    fn heap_bytes(&self) -> usize {
        match self {
            ReadingValue::Text(s) => s.len(),
            _ => 0,
        }
    }
}

impl From<f64> for ReadingValue {
    fn from(value: f64) -> Self {
        ReadingValue::Float(value)
    }
}

impl From<i64> for ReadingValue {
    fn from(value: i64) -> Self {
        ReadingValue::Int(value)
    }
}

impl From<bool> for ReadingValue {
    fn from(value: bool) -> Self {
        ReadingValue::Bool(value)
    }
}

/// One timestamped named value produced by a sensor or a controller.
///
/// Immutable once stored in the [`SharedBuffer`](crate::data::SharedBuffer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Interface (stream) the reading belongs to.
    pub interface: String,
    /// Parameter short name, e.g. `PRS` or `PInt_TMP`.
    pub parameter: String,
    /// Decoded value.
    pub value: ReadingValue,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Creates a new reading.
    pub fn new(
        interface: impl Into<String>,
        parameter: impl Into<String>,
        value: impl Into<ReadingValue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            interface: interface.into(),
            parameter: parameter.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// Approximate memory held by this reading, used for buffer accounting.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.interface.len()
            + self.parameter.len()
            + self.value.heap_bytes()
    }
}

/// Canonical device health, shared by every sensor kind and controller.
///
/// The numeric codes are stable and are what [`Status::code`] reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not initialised, stopped, or link down.
    #[default]
    Disconnected,
    /// Configured and idle.
    Standby,
    /// Producing data.
    Active,
    /// Sustained failures past the escalation threshold.
    Error,
}

impl Status {
    /// Stable numeric code: 0 Disconnected, 1 Standby, 2 Active, 3 Error.
    pub fn code(self) -> u8 {
        match self {
            Status::Disconnected => 0,
            Status::Standby => 1,
            Status::Active => 2,
            Status::Error => 3,
        }
    }

    /// Maps a status code as reported over the wire by external firmware.
    ///
    /// Firmware reports negative values on faults, `0` when idle/stopped,
    /// small positive values when configured and larger ones while sampling.
    pub fn from_wire_code(code: i64) -> Self {
        match code {
            c if c < 0 => Status::Error,
            0 => Status::Disconnected,
            1..=5 => Status::Standby,
            _ => Status::Active,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Disconnected => "disconnected",
            Status::Standby => "standby",
            Status::Active => "active",
            Status::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// Operator command addressed to a sensor or controller. Produces no reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Interface id of the target.
    pub target: String,
    /// Command key (`fill`, `record`, a pin number, or a dotted path for controllers).
    pub key: String,
    /// Command argument.
    pub value: serde_json::Value,
}

impl Command {
    /// Creates a command.
    pub fn new(
        target: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            target: target.into(),
            key: key.into(),
            value,
        }
    }
}

/// Result of [`Sensor::sample`](crate::sensor::Sensor::sample).
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Read succeeded and the cache now holds fresh bytes.
    Sampled,
    /// Read failed; the previous sample stays available.
    Failed(BusError),
    /// Sensor is stopped or not recording; no bus traffic happened.
    Skipped,
}

impl SampleOutcome {
    /// True for [`SampleOutcome::Sampled`].
    pub fn is_success(&self) -> bool {
        matches!(self, SampleOutcome::Sampled)
    }
}

/// Result of a command sent to a sensor or controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Written to the device.
    Accepted,
    /// Not applicable to the target (unknown key, bad value, stopped device).
    Rejected(String),
    /// The bus write failed; counted in the sensor's ErrorCount.
    Failed(BusError),
}
