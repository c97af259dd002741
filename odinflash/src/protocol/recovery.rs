//! Link resynchronisation after a transient I/O stall.

use std::io::Read;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::port::Port;
use crate::protocol::frame::{self, Command};
use crate::protocol::GREET_TIMEOUT;

/// Stability window between the purge and the re-handshake.
pub const RESYNC_SETTLE: Duration = Duration::from_millis(500);

/// Bring a stalled link back to a greeted state.
///
/// Purges both directions (falling back to clear-errors plus an input drain
/// when the purge itself fails), waits out [`RESYNC_SETTLE`], then re-runs the
/// `ODIN` handshake. The caller retries its last chunk on success; any error
/// here means the session is lost.
pub fn resync<P: Port>(port: &mut P) -> Result<()> {
    debug!("resynchronising link on {}", port.name());

    if let Err(e) = port.purge(true, true) {
        warn!("purge failed ({e}); falling back to clear-errors");
        port.clear_errors()?;
        drain_input(port)?;
    }

    thread::sleep(RESYNC_SETTLE);

    port.write_all_bytes(&frame::encode(Command::Handshake, 0, 0))?;
    frame::expect_greeting(port, GREET_TIMEOUT)?;

    debug!("link on {} answered the re-handshake", port.name());
    Ok(())
}

/// Discard whatever the device has buffered for the host.
fn drain_input<P: Port>(port: &mut P) -> Result<()> {
    let mut scratch = [0u8; 256];
    while port.bytes_to_read()? > 0 {
        let _ = Read::read(port, &mut scratch)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::Op;
    use crate::port::MockPort;
    use crate::protocol::frame::ACK;

    #[test]
    fn test_resync_purges_then_regreets() {
        let mut port = MockPort::new().with_responder(|written| {
            if written.starts_with(b"ODIN") {
                vec![ACK]
            } else {
                Vec::new()
            }
        });
        port.push_rx(&[0xFF, 0xFF]); // stale bytes from the stalled transfer

        resync(&mut port).unwrap();

        // The purge comes first and discards the stale input; the handshake
        // packet follows it.
        assert_eq!(port.ops()[0], Op::Purge { tx: true, rx: true });
        let writes = port.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][..4], b"ODIN");
    }

    #[test]
    fn test_resync_fails_when_device_stays_silent() {
        let mut port = MockPort::new();
        assert!(resync(&mut port).is_err());
    }
}
