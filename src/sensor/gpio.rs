//! Digital pins.
//!
//! Inputs use pull-downs; outputs start and stop low. Each pin is reported as
//! a boolean parameter named by its pin number, and outputs are commanded with
//! the pin number as key (`command("6", true)`).

use super::{CommandError, SensorDriver};
use crate::core::ReadingValue;
use crate::error::BusResult;
use crate::hardware::{BusTransport, PinMode, Pull};
use async_trait::async_trait;
use serde_json::Value;

/// GPIO sensor.
#[derive(Debug, Clone)]
pub struct GpioSensor {
    inputs: Vec<u8>,
    outputs: Vec<u8>,
}

impl GpioSensor {
    /// Creates a driver for the given input and output pins.
    pub fn new(inputs: Vec<u8>, outputs: Vec<u8>) -> Self {
        Self { inputs, outputs }
    }

    /// Pins in reporting order: outputs first, then inputs.
    fn pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.outputs.iter().chain(self.inputs.iter()).copied()
    }
}

impl Default for GpioSensor {
    fn default() -> Self {
        Self::new(vec![18], vec![6])
    }
}

#[async_trait]
impl SensorDriver for GpioSensor {
    fn kind(&self) -> &'static str {
        "gpio"
    }

    fn name(&self) -> &str {
        "GPIO Pins"
    }

    fn parameters(&self) -> Vec<String> {
        self.pins().map(|p| p.to_string()).collect()
    }

    async fn configure(&self, bus: &BusTransport) -> BusResult<()> {
        let inputs = self.inputs.clone();
        let outputs = self.outputs.clone();
        bus.transaction(move |bus| {
            for pin in &inputs {
                bus.setup_pin(*pin, PinMode::Input, Pull::Down)?;
            }
            for pin in &outputs {
                bus.setup_pin(*pin, PinMode::Output, Pull::None)?;
                bus.write_pin(*pin, false)?;
            }
            Ok(())
        })
        .await
    }

    async fn acquire(&self, bus: &BusTransport) -> BusResult<Vec<u8>> {
        let pins: Vec<u8> = self.pins().collect();
        bus.transaction(move |bus| {
            pins.iter()
                .map(|pin| bus.read_pin(*pin).map(u8::from))
                .collect()
        })
        .await
    }

    fn decode(&self, raw: &[u8]) -> Vec<(String, ReadingValue)> {
        self.pins()
            .zip(raw)
            .map(|(pin, level)| (pin.to_string(), ReadingValue::Bool(*level != 0)))
            .collect()
    }

    async fn apply(&self, bus: &BusTransport, key: &str, value: &Value) -> Result<(), CommandError> {
        let pin: u8 = key
            .parse()
            .map_err(|_| CommandError::Rejected(format!("'{}' is not a pin number", key)))?;
        if !self.outputs.contains(&pin) {
            return Err(CommandError::Rejected(format!("pin {} is not an output", pin)));
        }
        let level = value
            .as_bool()
            .or_else(|| value.as_i64().map(|v| v != 0))
            .ok_or_else(|| CommandError::Rejected(format!("pin level must be boolean, got {}", value)))?;
        bus.output(pin, level).await?;
        Ok(())
    }

    async fn safe_state(&self, bus: &BusTransport) -> BusResult<()> {
        let outputs = self.outputs.clone();
        bus.transaction(move |bus| {
            for pin in &outputs {
                bus.write_pin(*pin, false)?;
            }
            Ok(())
        })
        .await
    }

    fn detects_stuck_zero(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{BusSettings, SimulatedBus};
    use serde_json::json;

    fn setup() -> (SimulatedBus, BusTransport, GpioSensor) {
        let sim = SimulatedBus::new();
        let bus = BusTransport::new(sim.clone(), BusSettings::default());
        (sim, bus, GpioSensor::default())
    }

    #[tokio::test]
    async fn test_reads_inputs_and_outputs() {
        let (sim, bus, gpio) = setup();
        gpio.configure(&bus).await.unwrap();
        sim.set_input(18, true);

        let raw = gpio.acquire(&bus).await.unwrap();
        assert_eq!(raw, vec![0, 1]);
        assert_eq!(
            gpio.decode(&raw),
            vec![
                ("6".to_string(), ReadingValue::Bool(false)),
                ("18".to_string(), ReadingValue::Bool(true)),
            ]
        );
    }

    #[tokio::test]
    async fn test_only_outputs_accept_commands() {
        let (sim, bus, gpio) = setup();
        gpio.configure(&bus).await.unwrap();

        gpio.apply(&bus, "6", &json!(true)).await.unwrap();
        assert_eq!(sim.output_level(6), Some(true));
        assert!(matches!(
            gpio.apply(&bus, "18", &json!(true)).await,
            Err(CommandError::Rejected(_))
        ));
        assert!(matches!(
            gpio.apply(&bus, "six", &json!(true)).await,
            Err(CommandError::Rejected(_))
        ));

        gpio.safe_state(&bus).await.unwrap();
        assert_eq!(sim.output_level(6), Some(false));
    }
}
