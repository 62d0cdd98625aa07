//! Serial port access.
//!
//! The rest of the driver never touches `tokio-serial` directly: it opens
//! ports through the [`PortOpener`] trait and works with boxed read/write
//! halves. Tests swap in `tokio::io::duplex` links wired to the emulator.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::debug;

pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An opened port, split into its two directions.
pub struct PortPair {
    pub reader: PortReader,
    pub writer: PortWriter,
}

/// Something that can open a named byte-stream link to the device.
pub trait PortOpener: Send + Sync {
    fn open(&self, name: &str) -> io::Result<PortPair>;
}

/// Real serial ports at 8N1.
pub struct SerialOpener {
    pub baud: u32,
}

impl PortOpener for SerialOpener {
    fn open(&self, name: &str) -> io::Result<PortPair> {
        let stream = tokio_serial::new(name, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(io::Error::other)?;
        debug!(port = name, baud = self.baud, "serial port opened");
        let (reader, writer) = tokio::io::split(stream);
        Ok(PortPair {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

/// Names of serial ports present on this machine.
pub fn available_ports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!(error = %e, "port enumeration failed");
            Vec::new()
        }
    }
}
