//! Generic register block: one byte per named parameter.

use super::{CommandError, SensorDriver};
use crate::core::ReadingValue;
use crate::error::BusResult;
use crate::hardware::BusTransport;
use async_trait::async_trait;
use serde_json::Value;

/// Reads `parameters.len()` consecutive registers starting at `register`.
#[derive(Debug, Clone)]
pub struct RegisterSensor {
    address: u8,
    register: u8,
    parameters: Vec<String>,
}

impl RegisterSensor {
    /// Creates a driver.
    pub fn new(address: u8, register: u8, parameters: Vec<String>) -> Self {
        Self {
            address,
            register,
            parameters,
        }
    }
}

#[async_trait]
impl SensorDriver for RegisterSensor {
    fn kind(&self) -> &'static str {
        "register"
    }

    fn name(&self) -> &str {
        "Register Block"
    }

    fn parameters(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn configure(&self, _bus: &BusTransport) -> BusResult<()> {
        Ok(())
    }

    async fn acquire(&self, bus: &BusTransport) -> BusResult<Vec<u8>> {
        bus.read(self.address, self.register, self.parameters.len())
            .await
    }

    fn decode(&self, raw: &[u8]) -> Vec<(String, ReadingValue)> {
        self.parameters
            .iter()
            .zip(raw)
            .map(|(name, byte)| (name.clone(), ReadingValue::Int(i64::from(*byte))))
            .collect()
    }

    async fn apply(&self, _bus: &BusTransport, key: &str, _value: &Value) -> Result<(), CommandError> {
        Err(CommandError::Rejected(format!(
            "register sensor has no command '{}'",
            key
        )))
    }

    async fn safe_state(&self, _bus: &BusTransport) -> BusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{BusSettings, SimulatedBus};

    #[tokio::test]
    async fn test_one_byte_per_parameter() {
        let sim = SimulatedBus::new();
        sim.set_registers(0x40, 0x10, &[7, 8]);
        let bus = BusTransport::new(sim, BusSettings::default());
        let sensor = RegisterSensor::new(0x40, 0x10, vec!["A".into(), "B".into()]);

        let raw = sensor.acquire(&bus).await.unwrap();
        assert_eq!(
            sensor.decode(&raw),
            vec![
                ("A".to_string(), ReadingValue::Int(7)),
                ("B".to_string(), ReadingValue::Int(8)),
            ]
        );
    }
}
