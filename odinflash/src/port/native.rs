//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, SerialConfig},
    },
    log::trace,
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits},
    std::{
        io::{Read, Write},
        thread,
        time::Duration,
    },
};

/// Settling delay after opening before any traffic is allowed on the link.
///
/// Download-mode devices drop the first bytes written while the CDC endpoint
/// is still coming up; the delay is part of the link contract.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a download-mode link with the given configuration.
    ///
    /// The line is set to 8N1 with DTR and RTS asserted, and the call blocks
    /// for [`SETTLE_DELAY`] before returning so that the first control packet
    /// lands on a settled endpoint.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let mut port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        thread::sleep(SETTLE_DELAY);

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    /// Open a download-mode link with default settings.
    pub fn open_download_mode(port_name: &str) -> Result<Self> {
        Self::open(&SerialConfig::download_mode(port_name))
    }

    fn closed_error() -> serialport::Error {
        serialport::Error::new(serialport::ErrorKind::NoDevice, "Port is closed")
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        match self.port {
            Some(ref mut p) => Ok(p.bytes_to_read()? as usize),
            None => Err(Error::Serial(Self::closed_error())),
        }
    }

    fn purge(&mut self, tx: bool, rx: bool) -> Result<()> {
        let buffer = match (tx, rx) {
            (true, true) => ClearBuffer::All,
            (true, false) => ClearBuffer::Output,
            (false, true) => ClearBuffer::Input,
            (false, false) => return Ok(()),
        };
        trace!("purging {buffer:?} on {}", self.name);
        if let Some(ref mut p) = self.port {
            p.clear(buffer)?;
        }
        Ok(())
    }

    fn clear_errors(&mut self) -> Result<()> {
        // Querying the input queue refreshes the driver's comm status; the
        // clear then discards whatever the error condition left behind.
        if let Some(ref mut p) = self.port {
            let _ = p.bytes_to_read()?;
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        if let Some(ref mut p) = self.port {
            p.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_delay_matches_link_contract() {
        assert_eq!(SETTLE_DELAY, Duration::from_millis(500));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::download_mode("/dev/odinflash-does-not-exist");
        assert!(NativePort::open(&config).is_err());
    }
}
