//! Discovery of Samsung devices in download mode.
//!
//! Three strategies run in order, each falling through to the next:
//!
//! 1. enumeration filtered on the Samsung vendor id and the two known
//!    download-mode product ids;
//! 2. the same enumeration with the product-id filter dropped (some models
//!    expose additional PIDs);
//! 3. an active probe: open each remaining port with download-mode line
//!    settings, send one `ODIN` control packet, and accept a `LOKE` reply or
//!    a leading ACK byte within 1.5 s.
//!
//! The probe writes protocol bytes to every port it touches, so it only runs
//! when the caller asks for it; the passive strategies are what the port
//! monitor polls.

use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::port::{NativePort, Port, SerialConfig};
use crate::protocol::frame::{self, Command};

/// Samsung USB vendor id.
pub const SAMSUNG_VID: u16 = 0x04E8;

/// Product ids a device in download mode enumerates with.
pub const DOWNLOAD_MODE_PIDS: &[u16] = &[0x685D, 0x6860];

/// Read deadline for the active-probe reply.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Detected serial port with its USB identity.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether the port carries the Samsung vendor id.
    pub fn is_samsung(&self) -> bool {
        self.vid == Some(SAMSUNG_VID)
    }

    /// Whether the port matches a known download-mode VID/PID pair.
    pub fn is_download_mode(&self) -> bool {
        self.is_samsung()
            && self
                .pid
                .is_some_and(|pid| DOWNLOAD_MODE_PIDS.contains(&pid))
    }
}

/// Enumerate all serial ports with their USB metadata.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info.port_name.clone(),
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                        port_info.port_name,
                        usb_info.vid,
                        usb_info.pid
                    );
                }

                result.push(detected);
            }
        }
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        }
    }

    result
}

/// Passive lookup of a download-mode port (strategies 1 and 2).
pub fn find_download_port() -> Option<DetectedPort> {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.is_download_mode()) {
        debug!("download-mode device on {}", port.name);
        return Some(port.clone());
    }

    // Some models surface extra PIDs; the vendor id alone is still a strong
    // signal when the exact product id is absent.
    if let Some(port) = ports.iter().find(|p| p.is_samsung()) {
        debug!("Samsung device (unrecognised PID) on {}", port.name);
        return Some(port.clone());
    }

    None
}

/// Actively probe one port for a download-mode device.
///
/// Opens the port with download-mode line settings, purges, sends a single
/// `ODIN` packet and waits up to [`PROBE_TIMEOUT`] for `LOKE` or an ACK.
pub fn probe_port(name: &str) -> Result<bool> {
    let config = SerialConfig::download_mode(name).with_timeout(PROBE_TIMEOUT);
    let mut port = NativePort::open(&config)?;
    port.purge(true, true)?;
    port.write_all_bytes(&frame::encode(Command::Handshake, 0, 0))?;
    match frame::expect_greeting(&mut port, PROBE_TIMEOUT) {
        Ok(()) => Ok(true),
        Err(Error::Timeout(_)) | Err(Error::GreetFailed) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Locate a device in download mode.
///
/// Runs the passive strategies and, when `active_probe` is set, falls back to
/// probing every enumerated port. A port that fails to open or answer is
/// skipped, not an error; only a fully exhausted search reports
/// [`Error::DeviceNotFound`].
pub fn locate_device(active_probe: bool) -> Result<DetectedPort> {
    if let Some(port) = find_download_port() {
        info!("detected download-mode device: {}", port.name);
        return Ok(port);
    }

    if active_probe {
        for port in detect_ports() {
            match probe_port(&port.name) {
                Ok(true) => {
                    info!("probe answered on {}", port.name);
                    return Ok(port);
                }
                Ok(false) => trace!("no answer on {}", port.name),
                Err(e) => debug!("probe skipped {}: {e}", port.name),
            }
        }
    }

    Err(Error::DeviceNotFound)
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.is_download_mode() {
            " [download mode]".to_string()
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
