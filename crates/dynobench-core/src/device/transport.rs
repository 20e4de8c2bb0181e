//! Transports
//!
//! The device only needs a duplex byte stream. Real benches hang off a
//! serial port; tests plug in in-memory pipes.

use std::collections::HashMap;
use std::sync::Mutex;

use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};

use super::DeviceError;
use crate::protocol::DEFAULT_BAUD_RATE;

/// Byte stream a device talks over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport handle
pub type Transport = Box<dyn AsyncStream>;

/// Opens a transport by DSN
pub trait Connector: Send + Sync {
    /// Open the transport named by `dsn`
    fn open(&self, dsn: &str) -> Result<Transport, DeviceError>;
}

/// Serial port connector (8N1, no flow control)
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
}

impl SerialConnector {
    /// Connector opening ports at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl Connector for SerialConnector {
    fn open(&self, dsn: &str) -> Result<Transport, DeviceError> {
        let builder = tokio_serial::new(dsn, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None);

        let stream = SerialStream::open(&builder).map_err(|e| DeviceError::Open {
            dsn: dsn.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(stream))
    }
}

/// Connector handing out a single pre-opened stream
///
/// Useful for pipes and sockets opened elsewhere; a second `open` fails.
pub struct StreamConnector {
    stream: Mutex<Option<Transport>>,
}

impl StreamConnector {
    /// Wrap an already open stream
    pub fn new(stream: impl AsyncStream + 'static) -> Self {
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
        }
    }
}

impl Connector for StreamConnector {
    fn open(&self, dsn: &str) -> Result<Transport, DeviceError> {
        self.stream
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| DeviceError::Open {
                dsn: dsn.to_string(),
                reason: "stream already taken".to_string(),
            })
    }
}

/// A serial port visible to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port path, e.g. `/dev/ttyACM0`
    pub name: String,
    /// USB product string, if any
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let product = match info.port_type {
            SerialPortType::UsbPort(usb) => usb.product,
            _ => None,
        };
        Self {
            name: info.port_name,
            product,
        }
    }
}

/// Bench controllers enumerate as CDC-ACM first, then USB-serial bridges
fn port_rank(name: &str) -> (u8, usize, String) {
    let base = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1, "ttyUSB")] {
        if let Some(n) = base.strip_prefix(prefix) {
            return (rank, n.parse().unwrap_or(usize::MAX), base.to_string());
        }
    }
    (2, 0, base.to_string())
}

/// List serial ports, most likely bench ports first
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        ports.entry(port.name.clone()).or_insert(port);
    }

    let mut ports: Vec<PortInfo> = ports.into_values().collect();
    ports.sort_by_key(|p| port_rank(&p.name));
    ports
}
