//! Link establishment for controllers.
//!
//! A [`Connector`] is the readiness primitive of a [`DeviceController`](super::DeviceController):
//! `connect()` suspends until the peripheral is reachable and hands back a
//! bidirectional byte stream.
//!
//! # Connectors
//!
//! - [`SerialConnector`]: USB/serial device via tokio-serial (feature `serial`)
//! - [`TcpConnector`]: TCP stream
//! - [`ChannelConnector`]: readiness fired by another task ([`LinkSender::ready`])
//! - [`SimulatedPeripheral`]: in-process device emitting synthetic data lines

use crate::config::LinkConfig;
use crate::error::{AppResult, ControllerError};
#[cfg(not(feature = "serial"))]
use crate::error::DaqError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

// =============================================================================
// Link Trait
// =============================================================================

/// Byte stream to a peripheral.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used:
/// `tokio_serial::SerialStream`, `tokio::net::TcpStream`,
/// `tokio::io::DuplexStream` (tests and simulation).
pub trait WireLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> WireLink for T {}

/// Type-erased link.
pub type DynLink = Box<dyn WireLink>;

/// Establishes links on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Suspends until the peripheral is reachable.
    async fn connect(&self) -> Result<DynLink, ControllerError>;
}

/// Builds the connector selected by configuration.
pub fn connector_for(config: &LinkConfig) -> AppResult<Arc<dyn Connector>> {
    match config {
        #[cfg(feature = "serial")]
        LinkConfig::Serial { path, baud_rate } => {
            Ok(Arc::new(SerialConnector::new(path.clone(), *baud_rate)))
        }
        #[cfg(not(feature = "serial"))]
        LinkConfig::Serial { .. } => Err(DaqError::FeatureNotEnabled("serial".into())),
        LinkConfig::Tcp { address } => Ok(Arc::new(TcpConnector::new(address.clone()))),
        LinkConfig::Simulated { interval } => Ok(Arc::new(SimulatedPeripheral::new(*interval))),
    }
}

// =============================================================================
// Serial
// =============================================================================

/// Serial device connector (8N1, no flow control).
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    /// Creates a connector for `path` at `baud_rate`.
    pub fn new(path: String, baud_rate: u32) -> Self {
        Self { path, baud_rate }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.path, self.baud_rate)
    }

    async fn connect(&self) -> Result<DynLink, ControllerError> {
        use tokio_serial::SerialPortBuilderExt;

        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let mut port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| ControllerError::ConnectFailed(format!("spawn_blocking failed: {}", e)))?
        .map_err(|e| ControllerError::ConnectFailed(format!("{}: {}", self.path, e)))?;

        let discarded = drain(&mut port, Duration::from_millis(50)).await;
        if discarded > 0 {
            debug!(path = %self.path, discarded, "Discarded stale bytes");
        }
        Ok(Box::new(port))
    }
}

/// Reads and discards whatever is immediately available.
#[cfg(feature = "serial")]
async fn drain<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    use tokio::io::AsyncReadExt;

    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(n)) if n > 0 => total += n,
            _ => break,
        }
    }
    total
}

// =============================================================================
// TCP
// =============================================================================

/// TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Creates a connector for `host:port`.
    pub fn new(address: String) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }

    async fn connect(&self) -> Result<DynLink, ControllerError> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| ControllerError::ConnectFailed(format!("{}: {}", self.address, e)))?;
        // Lines are small and latency matters more than throughput
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Connector whose readiness is signalled by another task.
pub struct ChannelConnector {
    links: Mutex<mpsc::Receiver<DynLink>>,
}

/// Sending side of a [`ChannelConnector`].
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<DynLink>,
}

impl ChannelConnector {
    /// Creates a connector and the handle that fires its readiness.
    pub fn pair() -> (Self, LinkSender) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                links: Mutex::new(rx),
            },
            LinkSender { tx },
        )
    }
}

impl LinkSender {
    /// Hands a link to the waiting `connect()`. Returns `false` if the connector is gone.
    pub async fn ready(&self, link: impl WireLink + 'static) -> bool {
        self.tx.send(Box::new(link)).await.is_ok()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    fn describe(&self) -> String {
        "channel".to_string()
    }

    async fn connect(&self) -> Result<DynLink, ControllerError> {
        self.links
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ControllerError::ConnectFailed("link sender dropped".into()))
    }
}

// =============================================================================
// Simulated peripheral
// =============================================================================

/// In-process peripheral producing newline-delimited JSON data lines.
///
/// Each line carries `us`, `sDt` and one nested `PInt` object; every tenth
/// line is followed by a `"<rate> Hz"` feedback line. Inbound lines are logged.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    interval: Duration,
}

impl SimulatedPeripheral {
    /// Creates a peripheral emitting one line per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Connector for SimulatedPeripheral {
    fn describe(&self) -> String {
        format!("simulated peripheral every {:?}", self.interval)
    }

    async fn connect(&self) -> Result<DynLink, ControllerError> {
        if self.interval.is_zero() {
            return Err(ControllerError::ConnectFailed(
                "simulated interval must be greater than zero".into(),
            ));
        }
        let (host, device) = tokio::io::duplex(8192);
        tokio::spawn(run_peripheral(device, self.interval));
        info!(interval = ?self.interval, "Simulated peripheral attached");
        Ok(Box::new(host))
    }
}

fn synthetic_line(started: tokio::time::Instant, interval: Duration) -> String {
    use rand::Rng;

    let micros = (started.elapsed().as_micros() & 0xFFFF_FFFF) as u64;
    let (pressure, temperature) = {
        let mut rng = rand::thread_rng();
        (
            1013.25 + rng.gen_range(-0.5..0.5),
            21.0 + rng.gen_range(-0.2..0.2),
        )
    };
    serde_json::json!({
        "us": micros,
        "sDt": interval.as_micros().min(u128::from(u16::MAX)) as u64,
        "PInt": { "PRS": pressure, "TMP": temperature, "#ST": 10 },
    })
    .to_string()
}

async fn run_peripheral(device: tokio::io::DuplexStream, interval: Duration) {
    let (read_half, mut write_half) = tokio::io::split(device);
    let mut inbound = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(interval);
    let started = tokio::time::Instant::now();
    let rate = 1.0 / interval.as_secs_f64().max(1e-6);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut out = synthetic_line(started, interval);
                out.push('\n');
                sent += 1;
                if sent % 10 == 0 {
                    out.push_str(&format!("{:.1} Hz\r\n", rate));
                }
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            line = inbound.next_line() => match line {
                Ok(Some(command)) => debug!(%command, "Simulated peripheral received command"),
                _ => break,
            },
        }
    }
    debug!(sent, "Simulated peripheral detached");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_connector_waits_for_readiness() {
        let (connector, sender) = ChannelConnector::pair();
        let pending = tokio::spawn(async move { connector.connect().await.is_ok() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let (host, _device) = tokio::io::duplex(64);
        assert!(sender.ready(host).await);
        assert!(pending.await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_connector_fails_when_sender_dropped() {
        let (connector, sender) = ChannelConnector::pair();
        drop(sender);
        assert!(matches!(
            connector.connect().await,
            Err(ControllerError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_peripheral_emits_json_lines() {
        let peripheral = SimulatedPeripheral::new(Duration::from_millis(5));
        let link = peripheral.connect().await.unwrap();
        let mut lines = BufReader::new(link).lines();

        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("us").is_some());
        assert_eq!(value["PInt"]["#ST"], 10);
    }

    #[tokio::test]
    async fn test_simulated_peripheral_rejects_zero_interval() {
        let peripheral = SimulatedPeripheral::new(Duration::ZERO);
        assert!(matches!(
            peripheral.connect().await,
            Err(ControllerError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let connector = TcpConnector::new(address);
        assert!(connector.connect().await.is_ok());
        assert!(accept.await.unwrap());
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_serial_requires_feature() {
        let config = LinkConfig::Serial {
            path: "/dev/ttyACM0".into(),
            baud_rate: 115_200,
        };
        assert!(connector_for(&config).is_err());
    }
}
