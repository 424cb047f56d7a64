//! RGB light strip behind a microcontroller bridge.
//!
//! The bridge cannot report the colour it shows, so the driver keeps the last
//! colour it successfully commanded (per instance) and reports that on every
//! sample after checking that the bridge still answers.

use super::{CommandError, SensorDriver};
use crate::core::ReadingValue;
use crate::error::BusResult;
use crate::hardware::BusTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Default I2C address.
pub const DEFAULT_ADDRESS: u8 = 0x55;
/// Execute the last written settings.
pub const EXECUTE_REG: u8 = 0;
/// Set the whole strip to one colour: `[R, G, B, start MSB, start LSB, length MSB, length LSB]`.
pub const FILL_REG: u8 = 2;

/// Packs three channel values into one integer, first channel most significant.
pub fn pack_rgb(color: [u8; 3]) -> i64 {
    i64::from(u32::from_be_bytes([0, color[0], color[1], color[2]]))
}

/// Light strip driver.
#[derive(Debug)]
pub struct LightStrip {
    address: u8,
    color: Mutex<[u8; 3]>,
}

impl LightStrip {
    /// Creates a driver for the bridge at `address`; the strip starts dark.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            color: Mutex::new([0; 3]),
        }
    }

    /// Last colour successfully written.
    pub fn color(&self) -> [u8; 3] {
        *self.color.lock()
    }

    /// Writes the colour and latches it in one bus transaction.
    pub async fn fill(&self, bus: &BusTransport, color: [u8; 3]) -> BusResult<()> {
        let address = self.address;
        bus.transaction(move |bus| {
            let mut payload = color.to_vec();
            // start pixel 0, length 0 = whole strip
            payload.extend_from_slice(&[0; 4]);
            bus.write_block(address, FILL_REG, &payload)?;
            bus.write_block(address, EXECUTE_REG, &[1])
        })
        .await?;
        *self.color.lock() = color;
        Ok(())
    }
}

impl Default for LightStrip {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS)
    }
}

/// Accepts `[r, g, b]` or a packed `0xRRGGBB` integer.
fn parse_color(value: &Value) -> Option<[u8; 3]> {
    match value {
        Value::Array(items) if items.len() == 3 => {
            let mut color = [0u8; 3];
            for (slot, item) in color.iter_mut().zip(items) {
                *slot = u8::try_from(item.as_u64()?).ok()?;
            }
            Some(color)
        }
        Value::Number(n) => {
            let packed = u32::try_from(n.as_u64()?).ok().filter(|v| *v <= 0xFF_FFFF)?;
            let [_, r, g, b] = packed.to_be_bytes();
            Some([r, g, b])
        }
        _ => None,
    }
}

#[async_trait]
impl SensorDriver for LightStrip {
    fn kind(&self) -> &'static str {
        "light_strip"
    }

    fn name(&self) -> &str {
        "Ambient Light"
    }

    fn parameters(&self) -> Vec<String> {
        vec!["RGB".into()]
    }

    async fn configure(&self, bus: &BusTransport) -> BusResult<()> {
        bus.read(self.address, EXECUTE_REG, 1).await.map(|_| ())
    }

    async fn acquire(&self, bus: &BusTransport) -> BusResult<Vec<u8>> {
        bus.read(self.address, EXECUTE_REG, 1).await?;
        Ok(self.color().to_vec())
    }

    fn decode(&self, raw: &[u8]) -> Vec<(String, ReadingValue)> {
        match raw {
            [r, g, b] => vec![("RGB".into(), ReadingValue::Int(pack_rgb([*r, *g, *b])))],
            _ => Vec::new(),
        }
    }

    async fn apply(&self, bus: &BusTransport, key: &str, value: &Value) -> Result<(), CommandError> {
        if key != "fill" {
            return Err(CommandError::Rejected(format!(
                "light strip has no command '{}'",
                key
            )));
        }
        let color = parse_color(value).ok_or_else(|| {
            CommandError::Rejected(format!("fill expects [r, g, b] or 0xRRGGBB, got {}", value))
        })?;
        self.fill(bus, color).await?;
        Ok(())
    }

    async fn safe_state(&self, bus: &BusTransport) -> BusResult<()> {
        self.fill(bus, [0; 3]).await
    }

    fn detects_stuck_zero(&self) -> bool {
        false
    }
}
