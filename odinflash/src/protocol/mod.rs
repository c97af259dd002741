//! LOKE protocol implementation: framing, session engine, bulk streaming and
//! stall recovery.

pub mod bulk;
pub mod frame;
pub mod recovery;
pub mod session;

use std::time::Duration;

/// Deadline for the LOKE/ACK reply to a handshake packet.
pub const GREET_TIMEOUT: Duration = Duration::from_millis(1000);

/// Deadline for the ACK to a control packet or PIT segment.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Polling interval while waiting on device output.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);
