//! Custom error types for the application.
//!
//! Failures that cross a component boundary are values, never panics:
//!
//! - **`BusError`**: Result of a failed bus transaction. Sensors fold these into
//!   their ErrorCount instead of propagating them.
//! - **`ControllerError`**: Why a [`DeviceController`](crate::controller::DeviceController)
//!   could not connect or was cancelled.
//! - **`DaqError`**: Application level errors (configuration, resource limits,
//!   unknown interfaces, shutdown problems).
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Convenience alias for bus transaction results.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Classification of a failed bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// Underlying device I/O failed.
    Io,
    /// No device answered at the address.
    NoAcknowledge,
    /// The transaction did not complete in time.
    Timeout,
    /// The bus lock could not be acquired in time.
    Busy,
    /// Request was malformed (bad pin, empty payload, ...).
    InvalidArgument,
    /// Operation not available on this backend.
    Unsupported,
}

impl BusErrorKind {
    /// Kinds worth retrying within one transaction.
    pub fn is_transient(self) -> bool {
        matches!(self, BusErrorKind::Io | BusErrorKind::NoAcknowledge)
    }
}

impl std::fmt::Display for BusErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BusErrorKind::Io => "io",
            BusErrorKind::NoAcknowledge => "no_acknowledge",
            BusErrorKind::Timeout => "timeout",
            BusErrorKind::Busy => "busy",
            BusErrorKind::InvalidArgument => "invalid_argument",
            BusErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{}", label)
    }
}

/// A failed bus transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bus {kind} error{}: {message}", .address.map(|a| format!(" at 0x{a:02X}")).unwrap_or_default())]
pub struct BusError {
    /// Failure class.
    pub kind: BusErrorKind,
    /// Device address involved, when there is one.
    pub address: Option<u8>,
    /// Human readable detail.
    pub message: String,
}

impl BusError {
    /// Creates a bus error without an address.
    pub fn new(kind: BusErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            address: None,
            message: message.into(),
        }
    }

    /// Creates a bus error tied to a device address.
    pub fn at(kind: BusErrorKind, address: u8, message: impl Into<String>) -> Self {
        Self {
            kind,
            address: Some(address),
            message: message.into(),
        }
    }

    /// Shorthand for [`BusErrorKind::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BusErrorKind::Timeout, message)
    }
}

/// Why a controller operation did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// `stop()` was requested; the controller is terminal.
    #[error("controller stopped")]
    Stopped,

    /// The connector could not establish the link.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Readiness, read or write did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Wire I/O failed.
    #[error("wire I/O error: {0}")]
    Io(String),
}

/// Application level error.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("Cannot allocate stream '{interface}': {reason}")]
    StreamLimit { interface: String, reason: String },

    #[error("Stream '{0}' already has a writer")]
    StreamOwned(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Background task '{name}' failed: {reason}")]
    Task { name: String, reason: String },

    #[error("Recorder has been shut down")]
    ShutDown,

    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
