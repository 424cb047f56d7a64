//! Shared bus transport.
//!
//! A [`BusDriver`] performs blocking register and pin I/O on one physical bus.
//! [`BusTransport`] wraps it behind a single lock so that every transaction
//! (lock acquisition, retries and all of its register accesses) completes
//! before the next one starts. Blocking work runs on tokio's blocking pool so
//! the poll loop and controller tasks are never stalled by a slow chip.
//!
//! Multi-step operations that must not interleave with other clients (for
//! example "write colour registers, then latch") go through
//! [`BusTransport::transaction`] as one closure.

use crate::config::BusConfig;
use crate::error::{BusError, BusErrorKind, BusResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Direction of a digital pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Pin is sampled.
    Input,
    /// Pin is driven.
    Output,
}

/// Pull resistor selection for input pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Floating.
    None,
    /// Pull-up.
    Up,
    /// Pull-down.
    Down,
}

/// Blocking access to one physical bus.
///
/// Implementations are only ever called by one thread at a time (the
/// transport holds the lock), so they may keep mutable state freely.
pub trait BusDriver: Send {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Reads `buf.len()` bytes starting at `register` of the device at `address`.
    fn read_block(&mut self, address: u8, register: u8, buf: &mut [u8]) -> BusResult<()>;

    /// Writes `payload` starting at `register` of the device at `address`.
    fn write_block(&mut self, address: u8, register: u8, payload: &[u8]) -> BusResult<()>;

    /// Configures a digital pin.
    fn setup_pin(&mut self, pin: u8, mode: PinMode, pull: Pull) -> BusResult<()>;

    /// Reads a digital pin level.
    fn read_pin(&mut self, pin: u8) -> BusResult<bool>;

    /// Drives a digital output pin.
    fn write_pin(&mut self, pin: u8, level: bool) -> BusResult<()>;
}

/// Transaction policy of a [`BusTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    /// Extra attempts after a transient failure.
    pub retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Maximum wait for the bus lock.
    pub lock_timeout: Duration,
    /// Upper bound for a whole transaction.
    pub timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for BusSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            retries: config.retries,
            retry_delay: config.retry_delay,
            lock_timeout: config.lock_timeout,
            timeout: config.timeout,
        }
    }
}

struct BusInner {
    driver: Mutex<Box<dyn BusDriver>>,
    settings: BusSettings,
    name: String,
}

impl BusInner {
    fn run<T, F>(&self, mut op: F) -> BusResult<T>
    where
        F: FnMut(&mut dyn BusDriver) -> BusResult<T>,
    {
        let mut driver = self
            .driver
            .try_lock_for(self.settings.lock_timeout)
            .ok_or_else(|| {
                BusError::new(
                    BusErrorKind::Busy,
                    format!(
                        "{} bus not available within {:?}",
                        self.name, self.settings.lock_timeout
                    ),
                )
            })?;

        let mut attempt = 0;
        loop {
            match op(&mut **driver) {
                Ok(value) => return Ok(value),
                Err(err) if err.kind.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    trace!(bus = %self.name, attempt, error = %err, "Retrying bus transaction");
                    std::thread::sleep(self.settings.retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct BusTransport {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl BusTransport {
    /// Wraps a driver with the given transaction policy.
    pub fn new(driver: impl BusDriver + 'static, settings: BusSettings) -> Self {
        let name = driver.name().to_string();
        debug!(bus = %name, ?settings, "Bus transport created");
        Self {
            inner: Arc::new(BusInner {
                driver: Mutex::new(Box::new(driver)),
                settings,
                name,
            }),
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Transaction policy.
    pub fn settings(&self) -> &BusSettings {
        &self.inner.settings
    }

    /// Runs `op` with exclusive access to the bus.
    ///
    /// Transient failures are retried inside the same lock hold. The returned
    /// error is [`BusErrorKind::Busy`] if the lock could not be taken and
    /// [`BusErrorKind::Timeout`] if the whole transaction overran.
    pub async fn transaction<T, F>(&self, op: F) -> BusResult<T>
    where
        T: Send + 'static,
        F: FnMut(&mut dyn BusDriver) -> BusResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let timeout = inner.settings.timeout;
        let task = tokio::task::spawn_blocking(move || inner.run(op));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BusError::new(
                BusErrorKind::Io,
                format!("bus worker failed: {}", join_err),
            )),
            Err(_) => Err(BusError::timeout(format!(
                "{} transaction exceeded {:?}",
                self.inner.name, timeout
            ))),
        }
    }

    /// Reads `len` bytes starting at `register`.
    pub async fn read(&self, address: u8, register: u8, len: usize) -> BusResult<Vec<u8>> {
        self.transaction(move |bus| {
            let mut buf = vec![0u8; len];
            bus.read_block(address, register, &mut buf)?;
            Ok(buf)
        })
        .await
    }

    /// Writes `payload` starting at `register`.
    pub async fn write(&self, address: u8, register: u8, payload: Vec<u8>) -> BusResult<()> {
        self.transaction(move |bus| bus.write_block(address, register, &payload))
            .await
    }

    /// Configures a digital pin.
    pub async fn setup_pin(&self, pin: u8, mode: PinMode, pull: Pull) -> BusResult<()> {
        self.transaction(move |bus| bus.setup_pin(pin, mode, pull))
            .await
    }

    /// Reads a digital input.
    pub async fn input(&self, pin: u8) -> BusResult<bool> {
        self.transaction(move |bus| bus.read_pin(pin)).await
    }

    /// Drives a digital output.
    pub async fn output(&self, pin: u8, level: bool) -> BusResult<()> {
        self.transaction(move |bus| bus.write_pin(pin, level))
            .await
    }
}
