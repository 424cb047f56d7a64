//! Bus hardware access.
//!
//! - [`bus`]: the driver trait and the shared, serialized transport
//! - [`simulated`]: software double used for development and tests
//! - `linux`: I2C/GPIO on Linux hosts (feature `linux_hal`)

pub mod bus;
#[cfg(feature = "linux_hal")]
pub mod linux;
pub mod simulated;

pub use bus::{BusDriver, BusSettings, BusTransport, PinMode, Pull};
pub use simulated::SimulatedBus;

use crate::config::{BusBackend, BusConfig};
use crate::error::AppResult;
#[cfg(not(feature = "linux_hal"))]
use crate::error::DaqError;
use tracing::info;

/// Opens the bus selected by configuration.
pub fn open_bus(config: &BusConfig) -> AppResult<BusTransport> {
    let settings = BusSettings::from(config);
    match config.backend {
        BusBackend::Simulated => {
            info!("Using simulated bus");
            Ok(BusTransport::new(SimulatedBus::new(), settings))
        }
        #[cfg(feature = "linux_hal")]
        BusBackend::Linux => {
            info!(device = %config.i2c_device, "Using Linux bus");
            let driver = linux::LinuxBus::open(&config.i2c_device)?;
            Ok(BusTransport::new(driver, settings))
        }
        #[cfg(not(feature = "linux_hal"))]
        BusBackend::Linux => Err(DaqError::FeatureNotEnabled("linux_hal".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_backend_opens() {
        let bus = open_bus(&BusConfig::default()).unwrap();
        assert_eq!(bus.name(), "simulated");
    }

    #[cfg(not(feature = "linux_hal"))]
    #[test]
    fn test_linux_backend_requires_feature() {
        let config = BusConfig {
            backend: BusBackend::Linux,
            ..BusConfig::default()
        };
        assert!(matches!(
            open_bus(&config),
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }
}
