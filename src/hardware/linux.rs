//! Linux bus backend: I2C character device plus sysfs GPIO.
//!
//! Only compiled with the `linux_hal` feature.

use super::bus::{BusDriver, PinMode, Pull};
use crate::error::{BusError, BusErrorKind, BusResult};
use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{I2cdev, SysfsPin};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Real hardware bus.
pub struct LinuxBus {
    i2c: I2cdev,
    device: String,
    pins: HashMap<u8, SysfsPin>,
}

impl LinuxBus {
    /// Opens the I2C character device at `path` (e.g. `/dev/i2c-1`).
    pub fn open(path: &str) -> BusResult<Self> {
        let i2c = I2cdev::new(path).map_err(|e| {
            BusError::new(BusErrorKind::Io, format!("failed to open {}: {}", path, e))
        })?;
        debug!(device = path, "Opened I2C device");
        Ok(Self {
            i2c,
            device: path.to_string(),
            pins: HashMap::new(),
        })
    }

    fn pin(&self, pin: u8) -> BusResult<&SysfsPin> {
        self.pins.get(&pin).ok_or_else(|| {
            BusError::new(
                BusErrorKind::InvalidArgument,
                format!("pin {} is not configured", pin),
            )
        })
    }
}

fn map_i2c_error(address: u8, err: linux_embedded_hal::I2CError) -> BusError {
    let kind = match err.kind() {
        ErrorKind::NoAcknowledge(_) => BusErrorKind::NoAcknowledge,
        _ => BusErrorKind::Io,
    };
    BusError::at(kind, address, err.to_string())
}

fn map_gpio_error(pin: u8, err: linux_embedded_hal::sysfs_gpio::Error) -> BusError {
    BusError::new(BusErrorKind::Io, format!("gpio {}: {}", pin, err))
}

impl BusDriver for LinuxBus {
    fn name(&self) -> &str {
        &self.device
    }

    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> BusResult<()> {
        self.i2c
            .write_read(address, &[register], buf)
            .map_err(|e| map_i2c_error(address, e))
    }

    fn write_block(&mut self, address: u8, register: u8, payload: &[u8]) -> BusResult<()> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(register);
        frame.extend_from_slice(payload);
        self.i2c
            .write(address, &frame)
            .map_err(|e| map_i2c_error(address, e))
    }

    fn setup_pin(&mut self, pin: u8, mode: PinMode, pull: Pull) -> BusResult<()> {
        let handle = SysfsPin::new(u64::from(pin));
        handle.export().map_err(|e| map_gpio_error(pin, e))?;
        let direction = match mode {
            PinMode::Input => Direction::In,
            PinMode::Output => Direction::Low,
        };
        handle
            .set_direction(direction)
            .map_err(|e| map_gpio_error(pin, e))?;
        if pull != Pull::None {
            // sysfs has no pull control; the board must provide the resistor
            warn!(pin, ?pull, "Pull resistor requested but not configurable via sysfs");
        }
        self.pins.insert(pin, handle);
        Ok(())
    }

    fn read_pin(&mut self, pin: u8) -> BusResult<bool> {
        let value = self
            .pin(pin)?
            .get_value()
            .map_err(|e| map_gpio_error(pin, e))?;
        Ok(value != 0)
    }

    fn write_pin(&mut self, pin: u8, level: bool) -> BusResult<()> {
        self.pin(pin)?
            .set_value(u8::from(level))
            .map_err(|e| map_gpio_error(pin, e))
    }
}
