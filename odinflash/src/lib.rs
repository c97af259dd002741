//! # odinflash
//!
//! A library for flashing Samsung mobile devices in download mode.
//!
//! This crate implements the host side of the LOKE/Odin protocol spoken by
//! Samsung devices over their USB-CDC download-mode endpoint:
//!
//! - Device discovery by USB identity, with an active-probe fallback
//! - The LOKE session lifecycle (handshake, PIT read/write, image upload,
//!   end-session, reboot) over 500-byte control packets
//! - Streamed multi-gigabyte image uploads with keep-alives, stall recovery
//!   and backpressure-friendly chunking
//! - Sequential tar traversal that feeds embedded images straight into the
//!   protocol without extracting them
//! - A background monitor reporting device presence to the session owner
//!
//! ## Example
//!
//! ```rust,no_run
//! use odinflash::{ImageStream, LokeSession};
//!
//! fn main() -> odinflash::Result<()> {
//!     let port = odinflash::locate_device(false)?;
//!     let mut session = LokeSession::open(&port.name)?;
//!     session.greet()?;
//!
//!     let mut image = ImageStream::from_file("recovery.img")?;
//!     session.flash_image(&mut image, &mut |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!
//!     session.end()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod monitor;
pub mod pit;
pub mod port;
pub mod protocol;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Transfers are
/// cancelled between chunks only: the device expects the full declared
/// payload, so mid-chunk cancellation would leave the link unusable.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
pub use {
    device::{detect_ports, find_download_port, locate_device, DetectedPort},
    error::{Error, Result},
    image::{tar::TarStream, ImageStream},
    monitor::{MonitorConfig, PortEvent, PortMonitor},
    pit::{is_plausible_pit, write_backup},
    port::{NativePort, Port, SerialConfig},
    protocol::{
        frame::{Command, ACK, PACKET_LEN},
        session::{LokeSession, SessionState},
    },
};

#[cfg(feature = "mock")]
pub use port::MockPort;
