//! Byte-level links to devices.
//!
//! A [`Transport`] is whatever a device strategy talks to: a real serial port (behind the
//! `instrument_serial` feature), an emulator, or a test loopback. Widgets that share a
//! physical link share one [`LinkSlot`]; the primary widget of the group opens the link during
//! its handshake and releases it on close.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Largest reply read by [`Transport::read_until`] before giving up on the terminator.
pub const MAX_REPLY_LEN: usize = 4096;

/// A blocking byte link.
///
/// Reads return whatever arrived before the terminator or the link's timeout; an empty
/// vector means nothing arrived.
pub trait Transport: Send {
    /// Write every byte or fail.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including `terminator`.
    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>>;

    /// Read up to and including a newline.
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.read_until(b'\n')
    }

    /// Drop anything waiting in the input buffer.
    fn reset_input_buffer(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying device. Later calls may fail.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// A transport shared between every widget of a link group.
pub type LinkHandle = Arc<Mutex<Box<dyn Transport>>>;

/// How a widget reaches its device.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Serial port path, when the device has one
    pub port: Option<String>,
    /// Ignored by devices without a serial port
    pub baud_rate: u32,
    /// Read timeout
    pub timeout: Duration,
    /// Use the strategy's emulator instead of real hardware
    pub emulated: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            timeout: Duration::from_millis(500),
            emulated: false,
        }
    }
}

impl LinkSettings {
    /// Settings for a serial port at `baud_rate`.
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: Some(port.into()),
            baud_rate,
            ..Default::default()
        }
    }

    /// Settings that select the strategy's emulator.
    pub fn emulated() -> Self {
        Self {
            emulated: true,
            ..Default::default()
        }
    }
}

/// Holder of a link group's open transport.
#[derive(Default)]
pub struct LinkSlot {
    link: Mutex<Option<LinkHandle>>,
}

impl LinkSlot {
    /// The open transport, if any.
    pub fn current(&self) -> Option<LinkHandle> {
        self.link.lock().clone()
    }

    /// Install a new transport, closing any previous one.
    pub fn install(&self, transport: Box<dyn Transport>) -> LinkHandle {
        let handle: LinkHandle = Arc::new(Mutex::new(transport));
        let previous = self.link.lock().replace(handle.clone());
        if let Some(previous) = previous {
            close_link(&previous);
        }
        handle
    }

    /// Close and forget the current transport, if any.
    pub fn release(&self) {
        let taken = self.link.lock().take();
        if let Some(handle) = taken {
            close_link(&handle);
        }
    }

    /// Whether a transport is installed.
    pub fn is_open(&self) -> bool {
        self.link.lock().is_some()
    }
}

impl std::fmt::Debug for LinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSlot")
            .field("open", &self.is_open())
            .finish()
    }
}

fn close_link(handle: &LinkHandle) {
    let mut transport = handle.lock();
    let name = transport.describe();
    match transport.close() {
        Ok(()) => debug!("Closed link {}", name),
        Err(e) => warn!("Failed to close link {}: {}", name, e),
    }
}

/// Send `command` and read one reply terminated by `terminator`.
///
/// The input buffer is cleared afterwards so a late or partial reply cannot leak into the
/// next exchange.
pub fn query(
    link: &mut dyn Transport,
    device: &str,
    command: &[u8],
    terminator: u8,
) -> Result<String> {
    trace!(
        "Sending command to {}: '{}'",
        device,
        String::from_utf8_lossy(command).escape_default()
    );
    link.write_all(command)
        .with_context(|| format!("Failed to send command to '{}'", device))?;

    let reply = link
        .read_until(terminator)
        .with_context(|| format!("Failed to read reply from '{}'", device))?;
    link.reset_input_buffer()?;

    let reply = String::from_utf8_lossy(&reply).to_string();
    trace!(
        "Received response from {}: '{}'",
        device,
        reply.escape_default()
    );
    Ok(reply)
}

/// Open a serial port as a transport.
#[cfg(feature = "instrument_serial")]
pub fn open_serial(settings: &LinkSettings) -> Result<Box<dyn Transport>> {
    let port = settings
        .port
        .as_deref()
        .context("No serial port configured")?;
    let transport = serial::SerialTransport::open(port, settings.baud_rate, settings.timeout)?;
    Ok(Box::new(transport))
}

/// Open a serial port as a transport.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial(_settings: &LinkSettings) -> Result<Box<dyn Transport>> {
    Err(crate::error::PanelError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::{Transport, MAX_REPLY_LEN};
    use anyhow::{Context, Result};
    use serialport::{ClearBuffer, SerialPort};
    use std::io::{self, Read, Write};
    use std::time::Duration;

    /// A real serial port.
    pub struct SerialTransport {
        name: String,
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open `path` with the given read timeout.
        pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
            let port = serialport::new(path, baud_rate)
                .timeout(timeout)
                .open()
                .with_context(|| format!("Failed to open serial port '{}'", path))?;
            Ok(Self {
                name: path.to_string(),
                port,
            })
        }
    }

    impl Transport for SerialTransport {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.port.write_all(bytes)?;
            self.port.flush()
        }

        fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
            let mut reply = Vec::new();
            let mut byte = [0u8; 1];
            while reply.len() < MAX_REPLY_LEN {
                match self.port.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) => {
                        reply.push(byte[0]);
                        if byte[0] == terminator {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(reply)
        }

        fn reset_input_buffer(&mut self) -> io::Result<()> {
            self.port
                .clear(ClearBuffer::Input)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }

        fn describe(&self) -> String {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::LoopbackTransport;

    #[test]
    fn query_reads_reply_and_clears_buffer() {
        let mut link = LoopbackTransport::new("loop");
        let reply = query(&mut link, "loop", b"PING\nleftover", b'\n').unwrap();
        assert_eq!(reply, "PING\n");
        assert!(link.read_line().unwrap().is_empty());
    }

    #[test]
    fn slot_install_and_release() {
        let slot = LinkSlot::default();
        assert!(!slot.is_open());
        let transport = LoopbackTransport::new("loop");
        let closed = transport.closed_flag();
        slot.install(Box::new(transport));
        assert!(slot.is_open());
        assert!(slot.current().is_some());
        slot.release();
        assert!(!slot.is_open());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        // Releasing an empty slot is a no-op
        slot.release();
    }
}
