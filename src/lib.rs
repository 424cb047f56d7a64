//! # rec_daq
//!
//! Headless sensor recorder for small embedded hosts. It polls bus-attached
//! chips and digital pins, keeps serial/network peripherals connected, and
//! normalizes everything into one bounded, queryable time series.
//!
//! ## Crate Structure
//!
//! - **`config`**: Typed configuration loaded from TOML + `REC_DAQ_` environment variables.
//! - **`core`**: Data model (`Reading`, `Status`, `Command`, outcomes).
//! - **`data`**: The `SharedBuffer`: per-interface streams with byte quotas and FIFO eviction.
//! - **`error`**: `DaqError` for the application, `BusError` and `ControllerError` as values.
//! - **`hardware`**: `BusDriver` trait, the serialized `BusTransport`, simulated and Linux backends.
//! - **`sensor`**: `Sensor` health bookkeeping plus the pressure, light strip, GPIO and register drivers.
//! - **`controller`**: `DeviceController` link state machine, connectors and the wire decoder.
//! - **`recorder`**: Poll loop, controller supervision and the consumer API.
//! - **`logging`**: tracing subscriber setup.
//! - **`nested`**: Dotted-key helpers for nested JSON commands.

pub mod config;
pub mod controller;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod nested;
pub mod recorder;
pub mod sensor;

pub use crate::config::RecorderConfig;
pub use crate::core::{Command, CommandOutcome, Reading, ReadingValue, SampleOutcome, Status};
pub use crate::data::{RangeEnd, RangeStart, SharedBuffer, StoredReading};
pub use crate::error::{AppResult, DaqError};
pub use crate::recorder::{InterfaceStatus, Recorder};
