//! Barometric pressure chip (LPS22-style register map).
//!
//! Pressure is a 24-bit little-endian count, temperature a signed 16-bit
//! little-endian value in hundredths of a degree. Both are read in a single
//! 5-byte block starting at `PRESS_OUT_XL`.

use super::{CommandError, SensorDriver};
use crate::core::ReadingValue;
use crate::error::BusResult;
use crate::hardware::BusTransport;
use async_trait::async_trait;
use serde_json::Value;

/// Default I2C address.
pub const DEFAULT_ADDRESS: u8 = 0x5C;
/// Raw pressure counts per output unit.
pub const DEFAULT_DIVISOR: f64 = 5460.86912;
/// Control register 1 (output data rate).
pub const CTRL_REG1: u8 = 0x10;
/// 75 Hz continuous conversion.
pub const CTRL_REG1_RUN: u8 = 0x50;
/// Power down.
pub const CTRL_REG1_OFF: u8 = 0x00;
/// First output register.
pub const PRESS_OUT_XL: u8 = 0x28;
const SAMPLE_LEN: usize = 5;

/// Pressure + temperature sensor.
#[derive(Debug, Clone)]
pub struct PressureSensor {
    address: u8,
    divisor: f64,
}

impl PressureSensor {
    /// Creates a driver for the chip at `address`.
    pub fn new(address: u8, divisor: f64) -> Self {
        Self { address, divisor }
    }

    /// Decodes pressure from the three little-endian pressure bytes.
    pub fn pressure(&self, raw: [u8; 3]) -> f64 {
        f64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], 0])) / self.divisor
    }

    /// Decodes temperature in degrees.
    pub fn temperature(raw: [u8; 2]) -> f64 {
        f64::from(i16::from_le_bytes(raw)) / 100.0
    }
}

impl Default for PressureSensor {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_DIVISOR)
    }
}

#[async_trait]
impl SensorDriver for PressureSensor {
    fn kind(&self) -> &'static str {
        "pressure"
    }

    fn name(&self) -> &str {
        "Pressure Sensor"
    }

    fn parameters(&self) -> Vec<String> {
        vec!["PRS".into(), "TMP".into()]
    }

    async fn configure(&self, bus: &BusTransport) -> BusResult<()> {
        bus.write(self.address, CTRL_REG1, vec![CTRL_REG1_RUN]).await
    }

    async fn acquire(&self, bus: &BusTransport) -> BusResult<Vec<u8>> {
        bus.read(self.address, PRESS_OUT_XL, SAMPLE_LEN).await
    }

    fn decode(&self, raw: &[u8]) -> Vec<(String, ReadingValue)> {
        let [p0, p1, p2, t0, t1] = match raw {
            [p0, p1, p2, t0, t1, ..] => [*p0, *p1, *p2, *t0, *t1],
            _ => return Vec::new(),
        };
        vec![
            ("PRS".into(), self.pressure([p0, p1, p2]).into()),
            ("TMP".into(), Self::temperature([t0, t1]).into()),
        ]
    }

    async fn apply(
        &self,
        _bus: &BusTransport,
        key: &str,
        _value: &Value,
    ) -> Result<(), CommandError> {
        Err(CommandError::Rejected(format!(
            "pressure sensor has no command '{}'",
            key
        )))
    }

    async fn safe_state(&self, bus: &BusTransport) -> BusResult<()> {
        bus.write(self.address, CTRL_REG1, vec![CTRL_REG1_OFF]).await
    }
}
