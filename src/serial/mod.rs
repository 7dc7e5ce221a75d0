pub mod device;
pub mod framing;
pub mod mock;
pub mod port;
pub mod transport;

pub use device::{ByteMeter, SerialDevice};
pub use framing::{FrameDecoder, FramingConfig, CLASSROOM_FRAMING};
pub use mock::{MockHandle, MockPort};
pub use port::{list_ports, NativePort, Parity, PortSettings, RawPort};
pub use transport::PortTransport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one OS-enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub path: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub pnp_id: Option<String>,
    pub location_id: Option<String>,
    pub product_id: Option<String>,
    pub vendor_id: Option<String>,
}

impl PortDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
            serial_number: None,
            pnp_id: None,
            location_id: None,
            product_id: None,
            vendor_id: None,
        }
    }
}

/// Lifecycle of a device and the transport under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Closed,
    Opening,
    Opened,
    Closing,
}

impl DeviceState {
    pub fn is_opened(self) -> bool {
        matches!(self, DeviceState::Opened)
    }
}

/// One received buffer stamped at delivery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedBytes {
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl TimestampedBytes {
    pub fn now(bytes: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Port already open")]
    AlreadyOpen,

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
