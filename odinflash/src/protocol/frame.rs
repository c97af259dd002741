//! LOKE control packet codec.
//!
//! Every command the host sends travels in a fixed 500-byte packet:
//!
//! ```text
//! +----------+--------------+----------+--------------------+
//! |   word   | payload size | sequence |      padding       |
//! +----------+--------------+----------+--------------------+
//! | 4 bytes  |   4 bytes    | 4 bytes  |     488 bytes      |
//! +----------+--------------+----------+--------------------+
//! |  ASCII   |  big-endian  |  little- |       zeroed       |
//! |          |              |  endian  |                    |
//! +----------+--------------+----------+--------------------+
//! ```
//!
//! The device acknowledges with a single `0x06` byte, or with the four ASCII
//! bytes `LOKE` in reply to the opening `ODIN` handshake.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::POLL_INTERVAL;

/// Fixed length of every control packet.
pub const PACKET_LEN: usize = 500;

/// Positive acknowledgement byte.
pub const ACK: u8 = 0x06;

/// Keep-alive byte sent when the host pauses between bulk chunks.
pub const KEEP_ALIVE: u8 = 0x64;

/// Reply to the `ODIN` handshake.
pub const GREETING_REPLY: &[u8; 4] = b"LOKE";

/// Command words recognised by a download-mode device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `ODIN`: open the session; the device answers `LOKE` or ACK.
    Handshake,
    /// `PITM`: enter PIT-write mode.
    PitMode,
    /// `PITR`: dump the partition table back to the host.
    PitDump,
    /// `DATA`: begin an image stream of `payload_size` bytes.
    Data,
    /// `ENDS`: end the session; the device reboots.
    EndSession,
    /// `REBT`: reboot to normal mode.
    Reboot,
}

impl Command {
    /// The four ASCII bytes carried at the start of the packet.
    pub fn word(self) -> &'static [u8; 4] {
        match self {
            Self::Handshake => b"ODIN",
            Self::PitMode => b"PITM",
            Self::PitDump => b"PITR",
            Self::Data => b"DATA",
            Self::EndSession => b"ENDS",
            Self::Reboot => b"REBT",
        }
    }

    /// Parse a command word.
    pub fn from_word(word: &[u8]) -> Option<Self> {
        match word {
            b"ODIN" => Some(Self::Handshake),
            b"PITM" => Some(Self::PitMode),
            b"PITR" => Some(Self::PitDump),
            b"DATA" => Some(Self::Data),
            b"ENDS" => Some(Self::EndSession),
            b"REBT" => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// Build a control packet.
///
/// The command word and the payload size are written MSB-first, the sequence
/// id LSB-first; the remaining 488 bytes are zero.
pub fn encode(cmd: Command, payload_size: u32, seq: u32) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[..4].copy_from_slice(cmd.word());
    BigEndian::write_u32(&mut packet[4..8], payload_size);
    LittleEndian::write_u32(&mut packet[8..12], seq);
    packet
}

/// Parse the head of a control packet back into `(command, size, seq)`.
///
/// Returns `None` when the packet is too short or carries an unknown word.
pub fn decode(packet: &[u8]) -> Option<(Command, u32, u32)> {
    if packet.len() < 12 {
        return None;
    }
    let cmd = Command::from_word(&packet[..4])?;
    let payload_size = BigEndian::read_u32(&packet[4..8]);
    let seq = LittleEndian::read_u32(&packet[8..12]);
    Some((cmd, payload_size, seq))
}

/// Wait up to `deadline` for a single device byte.
///
/// Silence is reported as `Ok(None)`, not as an error: some device models
/// only acknowledge the final chunk of a long stream, so the caller decides
/// whether an absent byte is fatal.
pub fn await_ack<P: Port>(port: &mut P, deadline: Duration) -> Result<Option<u8>> {
    let start = Instant::now();
    let mut byte = [0u8; 1];
    loop {
        if port.read_available(&mut byte)? == 1 {
            return Ok(Some(byte[0]));
        }
        if start.elapsed() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Wait for the reply to a handshake packet.
///
/// Succeeds when the device sends the four bytes `LOKE` or a bare ACK as its
/// first byte; both mean the session is live.
pub fn expect_greeting<P: Port>(port: &mut P, deadline: Duration) -> Result<()> {
    let first = match await_ack(port, deadline)? {
        Some(byte) => byte,
        None => return Err(Error::Timeout("no reply to handshake".into())),
    };
    if first == ACK {
        return Ok(());
    }
    let mut rest = [0u8; 3];
    port.read_exact_timeout(&mut rest, deadline)
        .map_err(|_| Error::GreetFailed)?;
    if first == GREETING_REPLY[0] && rest == GREETING_REPLY[1..] {
        Ok(())
    } else {
        Err(Error::GreetFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;

    #[test]
    fn test_packet_shape() {
        let packet = encode(Command::Data, 0x0102_0304, 0x0A0B_0C0D);
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(&packet[..4], b"DATA");
        // payload size big-endian
        assert_eq!(&packet[4..8], &[0x01, 0x02, 0x03, 0x04]);
        // sequence little-endian
        assert_eq!(&packet[8..12], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert!(packet[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_every_command_word() {
        assert_eq!(encode(Command::Handshake, 0, 0)[..4], *b"ODIN");
        assert_eq!(encode(Command::PitMode, 0, 0)[..4], *b"PITM");
        assert_eq!(encode(Command::PitDump, 0, 0)[..4], *b"PITR");
        assert_eq!(encode(Command::Data, 0, 0)[..4], *b"DATA");
        assert_eq!(encode(Command::EndSession, 0, 0)[..4], *b"ENDS");
        assert_eq!(encode(Command::Reboot, 0, 0)[..4], *b"REBT");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for cmd in [
            Command::Handshake,
            Command::PitMode,
            Command::PitDump,
            Command::Data,
            Command::EndSession,
            Command::Reboot,
        ] {
            let packet = encode(cmd, 157_286_400, 7);
            let (back, size, seq) = decode(&packet).unwrap();
            assert_eq!(back, cmd);
            assert_eq!(size, 157_286_400);
            assert_eq!(seq, 7);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_word_and_short_input() {
        let mut packet = encode(Command::Data, 1, 2);
        packet[..4].copy_from_slice(b"XXXX");
        assert!(decode(&packet).is_none());
        assert!(decode(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_await_ack_returns_byte() {
        let mut port = MockPort::new();
        port.push_rx(&[ACK]);
        let byte = await_ack(&mut port, Duration::from_millis(50)).unwrap();
        assert_eq!(byte, Some(ACK));
    }

    #[test]
    fn test_await_ack_silence_is_not_an_error() {
        let mut port = MockPort::new();
        let byte = await_ack(&mut port, Duration::from_millis(20)).unwrap();
        assert_eq!(byte, None);
    }

    #[test]
    fn test_greeting_accepts_loke() {
        let mut port = MockPort::new();
        port.push_rx(GREETING_REPLY);
        expect_greeting(&mut port, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_greeting_accepts_bare_ack() {
        let mut port = MockPort::new();
        port.push_rx(&[ACK]);
        expect_greeting(&mut port, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_greeting_rejects_other_words() {
        let mut port = MockPort::new();
        port.push_rx(b"NOPE");
        let err = expect_greeting(&mut port, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::GreetFailed));
    }

    #[test]
    fn test_greeting_times_out_on_silence() {
        let mut port = MockPort::new();
        let err = expect_greeting(&mut port, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
