//! Port abstraction over the serial link to a device in download mode.
//!
//! The protocol layer is written against the `Port` trait so that the same
//! session engine runs over a real serial endpoint and over the scripted
//! in-memory double used by the test suite.
//!
//! ```text
//! +-------------------+     +-------------------+
//! |  Protocol Layer   |     |  Protocol Layer   |
//! | (frame, session)  |     | (frame, session)  |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    Port Trait     |     |    Port Trait     |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    NativePort     |     |     MockPort      |
//! |   (serialport)    |     |  (test double)    |
//! +-------------------+     +-------------------+
//! ```

pub mod native;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rate download mode devices enumerate at.
pub const DOWNLOAD_BAUD: u32 = 115_200;

/// Default read/write timeout for control traffic.
pub const TIMEOUT_DEFAULT: Duration = Duration::from_millis(5000);

/// Read timeout while an image larger than 100 MiB is streaming.
pub const TIMEOUT_LARGE_TRANSFER: Duration = Duration::from_millis(10_000);

/// Serial port configuration for a download-mode link.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for a download-mode device on the given port.
    pub fn download_mode(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DOWNLOAD_BAUD,
            timeout: TIMEOUT_DEFAULT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport backend for one exclusive serial link.
///
/// The trait covers exactly the operations the session engine needs: blocking
/// reads and writes via the `Read`/`Write` supertraits, non-blocking input
/// inspection, native buffer purging, and timeout control. A link is owned by
/// at most one session at a time.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Number of bytes currently buffered for input.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Purge the driver-side buffers.
    ///
    /// The native implementation maps to the OS composite that both discards
    /// the selected buffers and aborts in-flight overlapped I/O; this is the
    /// mechanism that unsticks a pending write after a stall.
    fn purge(&mut self, tx: bool, rx: bool) -> Result<()>;

    /// Retrieve and discard the hardware error state of the link.
    ///
    /// Fallback for platforms or conditions where `purge` itself fails.
    fn clear_errors(&mut self) -> Result<()>;

    /// Set DTR (Data Terminal Ready) line state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) line state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release the OS handle.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Non-blocking copy of whatever is currently buffered for input.
    ///
    /// Returns 0 when nothing is pending; never waits.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pending = self.bytes_to_read()?;
        if pending == 0 {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        let n = Read::read(self, &mut buf[..want])?;
        Ok(n)
    }

    /// Read until `buf` is full or `deadline` elapses.
    fn read_exact_timeout(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let previous = self.timeout();
        self.set_timeout(deadline)?;
        let result = Read::read_exact(self, buf);
        self.set_timeout(previous)?;
        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Error::Timeout(format!("read of {} bytes timed out", buf.len()))
            } else {
                Error::Io(e)
            }
        })
    }
}

// Re-export the backends.
pub use native::NativePort;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockPort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_download_mode_defaults() {
        let config = SerialConfig::download_mode("/dev/ttyACM0");
        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, DOWNLOAD_BAUD);
        assert_eq!(config.timeout, TIMEOUT_DEFAULT);
    }

    #[test]
    fn test_serial_config_with_timeout() {
        let config =
            SerialConfig::download_mode("COM3").with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_read_available_is_non_blocking_on_empty_input() {
        let mut port = mock::MockPort::new();
        let mut buf = [0u8; 16];
        assert_eq!(port.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_available_drains_pending_bytes() {
        let mut port = mock::MockPort::new();
        port.push_rx(&[0x01, 0x02, 0x03]);
        let mut buf = [0u8; 2];
        assert_eq!(port.read_available(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x01, 0x02]);
        let mut rest = [0u8; 8];
        assert_eq!(port.read_available(&mut rest).unwrap(), 1);
        assert_eq!(rest[0], 0x03);
    }

    #[test]
    fn test_read_exact_timeout_maps_silence_to_timeout() {
        let mut port = mock::MockPort::new();
        let mut buf = [0u8; 4];
        let err = port
            .read_exact_timeout(&mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
