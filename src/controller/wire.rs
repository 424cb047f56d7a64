//! Line framing for peripheral links.
//!
//! Peripherals send one message per line:
//!
//! - a JSON object with an `"idle"` key: sub-device status info only
//! - any other JSON object: one data row. Top-level scalars become parameters,
//!   nested objects are flattened to `<device>_<param>`, `"#ST"` inside a
//!   nested object is that sub-device's status code, `"us"` is the device's
//!   microsecond clock and `"sDt"` the time the device spent sampling
//! - anything else is free-text feedback; `"<rate> Hz"` reports the sample rate
//!
//! Malformed JSON is dropped. An identical malformed line arriving back-to-back
//! is only logged once.

use crate::core::{Reading, ReadingValue, Status};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

/// Keys that carry framing information rather than readings.
const TIME_KEY: &str = "time";
const MICROS_KEY: &str = "us";
const SAMPLE_DT_KEY: &str = "sDt";
const STATUS_KEY: &str = "#ST";
const IDLE_KEY: &str = "idle";

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A timestamped data row.
    Data {
        /// Row timestamp.
        timestamp: DateTime<Utc>,
        /// Flattened readings, all stamped with `timestamp`.
        readings: Vec<Reading>,
        /// Sub-device statuses carried in the row.
        statuses: Vec<(String, Status)>,
    },
    /// Status info sent while the peripheral is not recording.
    Idle {
        /// Sub-device statuses.
        statuses: Vec<(String, Status)>,
    },
    /// Free text.
    Feedback {
        /// Line without trailing whitespace.
        text: String,
        /// Sample rate, if the line reported one.
        rate: Option<f64>,
    },
}

/// Maps the peripheral's wrapping 32-bit microsecond counter to wall time.
///
/// The first value seen after [`reset`](Self::reset) maps to the anchor; a
/// value lower than its predecessor means the counter wrapped.
#[derive(Debug, Clone)]
pub struct MicrosClock {
    anchor: DateTime<Utc>,
    origin: Option<u32>,
    last: u32,
    wraps: i64,
}

impl MicrosClock {
    /// Creates a clock anchored at `anchor`.
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            origin: None,
            last: 0,
            wraps: 0,
        }
    }

    /// Re-anchors the clock, e.g. on a new connection.
    pub fn reset(&mut self, anchor: DateTime<Utc>) {
        *self = Self::new(anchor);
    }

    /// Converts a counter value to a timestamp.
    pub fn timestamp(&mut self, micros: u32) -> DateTime<Utc> {
        let origin = *self.origin.get_or_insert(micros);
        if micros < self.last {
            self.wraps += 1;
        }
        self.last = micros;
        let elapsed = self.wraps * (1i64 << 32) + i64::from(micros) - i64::from(origin);
        self.anchor + Duration::microseconds(elapsed)
    }
}

/// Exponential moving average of the sample rate derived from `sDt`.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    rate: f64,
    window: f64,
}

impl RateEstimator {
    /// Creates an estimator averaging over roughly `window` samples.
    pub fn new(window: f64) -> Self {
        Self {
            rate: 0.0,
            window: window.max(1.0),
        }
    }

    /// Feeds one sample duration in microseconds; zero is ignored.
    pub fn update(&mut self, sample_dt_us: f64) {
        if sample_dt_us <= 0.0 {
            return;
        }
        let instant = 1e6 / sample_dt_us;
        if self.rate == 0.0 {
            self.rate = instant;
        } else {
            self.rate += (instant - self.rate) / self.window;
        }
    }

    /// Current estimate in Hz (0 before the first update).
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        // one minute at the default 256 Hz
        Self::new(256.0 * 60.0)
    }
}

/// Decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecoderStats {
    /// Lines that decoded to a message.
    pub decoded: u64,
    /// Malformed lines (suppressed repeats included).
    pub malformed: u64,
    /// Malformed lines that were not logged because they repeated the previous one.
    pub suppressed: u64,
    /// Estimated rate from `sDt`.
    pub ema_rate: f64,
    /// Last rate reported in feedback.
    pub reported_rate: Option<f64>,
}

/// Stateful line decoder for one interface.
#[derive(Debug, Clone)]
pub struct WireDecoder {
    interface: String,
    clock: MicrosClock,
    rate: RateEstimator,
    last_malformed: Option<String>,
    repeats: u64,
    stats: DecoderStats,
}

impl WireDecoder {
    /// Creates a decoder stamping readings with `interface`.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            clock: MicrosClock::new(Utc::now()),
            rate: RateEstimator::default(),
            last_malformed: None,
            repeats: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Starts a new connection: re-anchors the device clock.
    pub fn reset_clock(&mut self, anchor: DateTime<Utc>) {
        self.clock.reset(anchor);
    }

    /// Counters.
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            ema_rate: self.rate.rate(),
            ..self.stats
        }
    }

    /// Decodes one line. Returns `None` for blank and malformed lines.
    pub fn decode(&mut self, raw: &str) -> Option<Message> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        if !(line.starts_with('{') || line.starts_with('[')) {
            self.clear_malformed();
            self.stats.decoded += 1;
            return Some(self.feedback(line));
        }

        let object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                self.malformed(line, "not a JSON object");
                return None;
            }
            Err(err) => {
                self.malformed(line, &err.to_string());
                return None;
            }
        };

        self.clear_malformed();
        self.stats.decoded += 1;
        if object.contains_key(IDLE_KEY) {
            Some(Message::Idle {
                statuses: idle_statuses(&object),
            })
        } else {
            Some(self.data(object))
        }
    }

    fn feedback(&mut self, line: &str) -> Message {
        let rate = line
            .strip_suffix(" Hz")
            .and_then(|value| value.trim().parse::<f64>().ok());
        if let Some(rate) = rate {
            self.stats.reported_rate = Some(rate);
        } else {
            debug!(interface = %self.interface, feedback = line, "Peripheral feedback");
        }
        Message::Feedback {
            text: line.to_string(),
            rate,
        }
    }

    fn data(&mut self, mut object: Map<String, Value>) -> Message {
        if let Some(dt) = object.remove(SAMPLE_DT_KEY).and_then(|v| v.as_f64()) {
            self.rate.update(dt);
        }

        let micros = object.remove(MICROS_KEY).and_then(|v| v.as_u64());
        let time = object.remove(TIME_KEY).and_then(|v| v.as_f64());
        let timestamp = match (time, micros) {
            (Some(seconds), _) => epoch_seconds(seconds).unwrap_or_else(Utc::now),
            (None, Some(us)) => self.clock.timestamp((us & 0xFFFF_FFFF) as u32),
            (None, None) => Utc::now(),
        };

        let mut readings = Vec::new();
        let mut statuses = Vec::new();
        for (key, value) in object {
            match value {
                Value::Object(device) => {
                    for (param, value) in device {
                        if param == STATUS_KEY {
                            if let Some(code) = value.as_i64() {
                                statuses.push((key.clone(), Status::from_wire_code(code)));
                            }
                        } else if let Some(value) = ReadingValue::from_json(&value) {
                            readings.push(self.reading(format!("{}_{}", key, param), value, timestamp));
                        }
                    }
                }
                other => match ReadingValue::from_json(&other) {
                    Some(value) => readings.push(self.reading(key, value, timestamp)),
                    None => trace!(interface = %self.interface, key = %key, "Skipping non-scalar field"),
                },
            }
        }

        Message::Data {
            timestamp,
            readings,
            statuses,
        }
    }

    fn reading(&self, parameter: String, value: ReadingValue, timestamp: DateTime<Utc>) -> Reading {
        Reading {
            interface: self.interface.clone(),
            parameter,
            value,
            timestamp,
        }
    }

    fn malformed(&mut self, line: &str, reason: &str) {
        self.stats.malformed += 1;
        if self.last_malformed.as_deref() == Some(line) {
            self.repeats += 1;
            self.stats.suppressed += 1;
            return;
        }
        self.clear_malformed();
        warn!(interface = %self.interface, line, reason, "Dropping malformed line");
        self.last_malformed = Some(line.to_string());
    }

    fn clear_malformed(&mut self) {
        if self.repeats > 0 {
            debug!(interface = %self.interface, repeats = self.repeats, "Suppressed repeated malformed lines");
        }
        self.repeats = 0;
        self.last_malformed = None;
    }
}

fn epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn idle_statuses(object: &Map<String, Value>) -> Vec<(String, Status)> {
    object
        .iter()
        .filter_map(|(name, value)| {
            let device = value.as_object()?;
            let code = device.get(STATUS_KEY).and_then(Value::as_i64).unwrap_or(0);
            Some((name.clone(), Status::from_wire_code(code)))
        })
        .collect()
}
