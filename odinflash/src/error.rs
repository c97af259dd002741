//! Error types for odinflash.

use std::io;
use thiserror::Error;

/// Result type for odinflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for odinflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No Samsung device in download mode is present.
    #[error("No device in download mode found")]
    DeviceNotFound,

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient I/O stall on the link; a recovery attempt is warranted.
    #[error("Link stalled: {0}")]
    Stalled(String),

    /// The operation was cancelled by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,

    /// The device answered the handshake with neither LOKE nor an ACK byte.
    #[error("Greeting failed: device sent neither LOKE nor ACK")]
    GreetFailed,

    /// A required acknowledgement byte was missing or wrong.
    #[error("Missing or bad acknowledgement at {stage}")]
    BadAck {
        /// Protocol stage that expected the ACK.
        stage: String,
    },

    /// The device returned zero bytes for a PIT dump.
    #[error("Device returned an empty PIT")]
    PitEmpty,

    /// A candidate PIT blob failed the sanity check.
    #[error("PIT rejected: {0}")]
    PitInvalid(String),

    /// An operation was requested in a session state that does not permit it.
    #[error("{op} is not valid in the {state} state")]
    UnexpectedState {
        /// The requested operation.
        op: &'static str,
        /// The session state at the time of the request.
        state: &'static str,
    },

    /// Malformed tar archive.
    #[error("Corrupt tar archive: {0}")]
    TarCorrupt(String),
}

impl Error {
    /// Whether this error is a transient link condition that the recovery
    /// path (purge, settle, re-greet, retry last chunk) may clear.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Stalled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_is_recoverable() {
        assert!(Error::Stalled("write timed out".into()).is_recoverable());
    }

    #[test]
    fn test_fatal_kinds_are_not_recoverable() {
        assert!(!Error::GreetFailed.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
        assert!(!Error::PitEmpty.is_recoverable());
        assert!(!Error::Timeout("ack".into()).is_recoverable());
        assert!(
            !Error::BadAck {
                stage: "DATA start".into()
            }
            .is_recoverable()
        );
    }
}
