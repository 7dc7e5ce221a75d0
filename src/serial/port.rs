use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, SerialPortBuilderExt, SerialStream, StopBits};

use super::{PortDescriptor, Result, SerialError};

const READ_BUF_LEN: usize = 1024;

/// Parity bit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Line settings applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub parity: Parity,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            parity: Parity::None,
        }
    }
}

/// Adapter over one OS serial port.
///
/// Every failure is a return value; the adapter never closes itself, so the
/// caller owns all open/close policy. `read_chunk` distinguishes three
/// outcomes: `Ok(Some(bytes))` carries data, `Ok(None)` means the stream
/// ended, and `Err(SerialError::Timeout)` means the slice elapsed idle.
#[async_trait]
pub trait RawPort: Send {
    fn path(&self) -> &str;
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn is_readable(&self) -> bool;
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    async fn drain(&mut self) -> Result<()>;
    async fn read_chunk(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>>;
}

/// `RawPort` backed by a tokio-serial stream.
pub struct NativePort {
    path: String,
    settings: PortSettings,
    stream: Option<SerialStream>,
}

impl NativePort {
    pub fn new(path: impl Into<String>, settings: PortSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            stream: None,
        }
    }
}

#[async_trait]
impl RawPort for NativePort {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(SerialError::AlreadyOpen);
        }

        let stream = tokio_serial::new(&self.path, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(self.settings.parity.into())
            .flow_control(FlowControl::None)
            .open_native_async()?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the stream releases the file descriptor.
        self.stream = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn is_readable(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        let mut buf = vec![0u8; READ_BUF_LEN];

        match tokio::time::timeout(Duration::from_millis(timeout_ms), stream.read(&mut buf)).await {
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(read)) => {
                buf.truncate(read);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SerialError::Timeout),
        }
    }
}

fn not_open() -> SerialError {
    SerialError::ConnectionFailed("port is not open".to_string())
}

/// Enumerate every serial port the OS reports.
///
/// USB metadata is carried over where present; matching against a hardware
/// profile happens later, so nothing is filtered here.
pub fn list_ports() -> Result<Vec<PortDescriptor>> {
    let ports = serialport::available_ports()?;
    let mut descriptors = Vec::new();

    for port in ports {
        let mut descriptor = PortDescriptor::new(port.port_name.clone());

        if let SerialPortType::UsbPort(usb_info) = port.port_type {
            descriptor.manufacturer = usb_info.manufacturer.clone();
            descriptor.serial_number = usb_info.serial_number.clone();
            descriptor.product_id = Some(usb_id(usb_info.pid));
            descriptor.vendor_id = Some(usb_id(usb_info.vid));
        }

        descriptors.push(descriptor);
    }

    Ok(descriptors)
}

fn usb_id(id: u16) -> String {
    format!("{:04x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports_does_not_panic() {
        // Enumeration must succeed on machines with zero serial ports.
        let _ = list_ports();
    }

    #[test]
    fn test_usb_id_is_four_hex_digits() {
        assert_eq!(usb_id(0x1A86), "1a86");
        assert_eq!(usb_id(0x0001), "0001");
        assert_eq!(usb_id(0), "0000");
    }

    #[test]
    fn test_default_settings() {
        let settings = PortSettings::default();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.parity, Parity::None);
    }
}
