//! Integration tests for layered configuration loading.

use rec_daq::config::{BusBackend, LinkConfig, RecorderConfig, SensorDevice};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const FILE: &str = r#"
    [application]
    name = "field station"
    log_level = "info"

    [scheduler]
    poll_interval = "250ms"
    reconnect_delay = "3s"

    [[sensors]]
    id = "PInt"
    [sensors.device]
    kind = "pressure"

    [[controllers]]
    id = "pico"
    [controllers.link]
    kind = "serial"
    path = "/dev/ttyACM0"
    [controllers.timeouts]
    read = "2s"
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(FILE);
    let config = RecorderConfig::load_from(file.path()).unwrap();

    assert_eq!(config.application.name, "field station");
    assert_eq!(config.scheduler.poll_interval, Duration::from_millis(250));
    assert_eq!(config.scheduler.reconnect_delay, Some(Duration::from_secs(3)));
    assert_eq!(
        config.sensors[0].device,
        SensorDevice::Pressure {
            address: 0x5C,
            divisor: 5460.86912
        }
    );
    assert_eq!(
        config.controllers[0].link,
        LinkConfig::Serial {
            path: "/dev/ttyACM0".into(),
            baud_rate: 115_200
        }
    );
    assert_eq!(config.controllers[0].timeouts.read, Duration::from_secs(2));
    assert_eq!(config.controllers[0].timeouts.write, Duration::from_secs(1));
    config.validate().unwrap();
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(FILE);
    std::env::set_var("REC_DAQ_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("REC_DAQ_BUS__BACKEND", "linux");
    let loaded = RecorderConfig::load_from(file.path());
    std::env::remove_var("REC_DAQ_APPLICATION__LOG_LEVEL");
    std::env::remove_var("REC_DAQ_BUS__BACKEND");

    let config = loaded.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.bus.backend, BusBackend::Linux);
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.sensors.is_empty());
    assert_eq!(config.bus.backend, BusBackend::Simulated);
}

#[test]
#[serial]
fn test_bad_duration_is_reported() {
    let file = write_config("[scheduler]\npoll_interval = \"soon\"\n");
    let err = RecorderConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/recorder.toml");
    let config = RecorderConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.enabled_sensors().count(), 3);
    assert_eq!(config.enabled_controllers().count(), 1);
}
