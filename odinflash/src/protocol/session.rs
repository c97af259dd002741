//! LOKE session engine.
//!
//! A session exclusively owns its link and walks the download-mode protocol:
//!
//! ```text
//! Open      --greet----------> Greeted    (ODIN -> LOKE or ACK)
//! Greeted   --enter_pit_mode-> PitMode    (PITM -> ACK)
//! PitMode   --write_pit------> Greeted    (500-byte segments, ACK each)
//! Greeted   --read_pit-------> Greeted    (PITR -> bytes until 200 ms idle)
//! Greeted   --flash_image----> Greeted    (DATA -> ACK -> bulk stream)
//! Greeted   --end/reboot-----> Ended      (ENDS / REBT)
//! any       --failure--------> Faulted    (recover() re-greets)
//! ```
//!
//! Operations requested in a state that does not permit them fail with
//! [`Error::UnexpectedState`] without touching the link.

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::image::ImageStream;
use crate::port::{NativePort, Port, TIMEOUT_DEFAULT, TIMEOUT_LARGE_TRANSFER};
use crate::protocol::bulk::{BulkConfig, BulkTransfer, LARGE_IMAGE_THRESHOLD};
use crate::protocol::frame::{self, Command, ACK, PACKET_LEN};
use crate::protocol::{recovery, ACK_TIMEOUT, GREET_TIMEOUT, POLL_INTERVAL};

/// Idle window that terminates a PIT dump.
pub const PIT_IDLE_WINDOW: Duration = Duration::from_millis(200);

/// Settle window after the last PIT segment, while the flash controller
/// finishes repartitioning.
pub const PIT_STABILITY_WINDOW: Duration = Duration::from_millis(1000);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Link open, no handshake yet.
    Open,
    /// Handshake answered; commands are accepted.
    Greeted,
    /// Device is expecting PIT payload segments.
    PitMode,
    /// An image stream is in flight.
    Transferring,
    /// `ENDS` or `REBT` was sent; the link is spent.
    Ended,
    /// A fatal or unrecovered error occurred.
    Faulted,
}

impl SessionState {
    /// State name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Greeted => "greeted",
            Self::PitMode => "PIT mode",
            Self::Transferring => "transferring",
            Self::Ended => "ended",
            Self::Faulted => "faulted",
        }
    }
}

/// A LOKE session over an exclusive link.
pub struct LokeSession<P: Port> {
    port: P,
    state: SessionState,
}

impl<P: Port> LokeSession<P> {
    /// Wrap an already-opened (and settled) link.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: SessionState::Open,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mutable access to the underlying link.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the link.
    pub fn into_port(self) -> P {
        self.port
    }

    fn unexpected(&self, op: &'static str) -> Error {
        Error::UnexpectedState {
            op,
            state: self.state.name(),
        }
    }

    /// Run the `ODIN` handshake.
    ///
    /// Either a `LOKE` reply or a bare ACK means the session is live. A
    /// timeout earns one implicit retry behind a full purge; anything else
    /// faults the session.
    pub fn greet(&mut self) -> Result<()> {
        match self.state {
            SessionState::Open | SessionState::Greeted => {}
            _ => return Err(self.unexpected("greet")),
        }

        // Drop whatever the device emitted while the port settled.
        self.port.purge(false, true)?;

        if let Err(first) = self.try_greet() {
            match first {
                Error::Timeout(_) | Error::GreetFailed => {
                    warn!("handshake got no usable reply ({first}); purging and retrying once");
                    self.port.purge(true, true)?;
                    if let Err(second) = self.try_greet() {
                        debug!("handshake retry failed: {second}");
                        error!("Greeting failed on {}", self.port.name());
                        self.state = SessionState::Faulted;
                        return Err(Error::GreetFailed);
                    }
                }
                other => {
                    error!("Greeting failed on {}: {other}", self.port.name());
                    self.state = SessionState::Faulted;
                    return Err(other);
                }
            }
        }

        self.state = SessionState::Greeted;
        info!("device on {} answered ODIN; session live", self.port.name());
        Ok(())
    }

    fn try_greet(&mut self) -> Result<()> {
        self.port
            .write_all_bytes(&frame::encode(Command::Handshake, 0, 0))?;
        frame::expect_greeting(&mut self.port, GREET_TIMEOUT)
    }

    /// Put the device into PIT-write mode (`PITM`).
    pub fn enter_pit_mode(&mut self) -> Result<()> {
        if self.state != SessionState::Greeted {
            return Err(self.unexpected("enter_pit_mode"));
        }

        self.port
            .write_all_bytes(&frame::encode(Command::PitMode, 0, 0))?;
        match frame::await_ack(&mut self.port, ACK_TIMEOUT)? {
            Some(ACK) => {
                self.state = SessionState::PitMode;
                debug!("device accepted PIT mode");
                Ok(())
            }
            other => {
                self.state = SessionState::Faulted;
                error!("PIT mode entry refused (reply: {other:?})");
                Err(Error::BadAck {
                    stage: "PIT mode entry".into(),
                })
            }
        }
    }

    /// Upload a partition table.
    ///
    /// Every segment goes out padded to exactly 500 bytes and must be
    /// acknowledged; missing ACKs here are fatal, a repartition left half
    /// done bricks the device. After the last segment the stability window
    /// gives the flash controller time to commit.
    pub fn write_pit(&mut self, blob: &[u8]) -> Result<()> {
        if self.state != SessionState::PitMode {
            return Err(self.unexpected("write_pit"));
        }

        let mut segment = [0u8; PACKET_LEN];
        for (index, part) in blob.chunks(PACKET_LEN).enumerate() {
            segment.fill(0);
            segment[..part.len()].copy_from_slice(part);
            self.port.write_all_bytes(&segment)?;

            match frame::await_ack(&mut self.port, ACK_TIMEOUT)? {
                Some(ACK) => {}
                other => {
                    self.state = SessionState::Faulted;
                    error!("PIT write at segment {index} got {other:?}");
                    return Err(Error::BadAck {
                        stage: format!("PIT write segment {index}"),
                    });
                }
            }
        }

        thread::sleep(PIT_STABILITY_WINDOW);
        self.state = SessionState::Greeted;
        info!(
            "PIT written: {} bytes in {} segments",
            blob.len(),
            blob.chunks(PACKET_LEN).len()
        );
        Ok(())
    }

    /// Read the partition table back (`PITR`).
    ///
    /// The device streams the blob without a length header; accumulation
    /// stops once the link has been idle for [`PIT_IDLE_WINDOW`]. An empty
    /// result is an error.
    pub fn read_pit(&mut self) -> Result<Vec<u8>> {
        if self.state != SessionState::Greeted {
            return Err(self.unexpected("read_pit"));
        }

        self.port
            .write_all_bytes(&frame::encode(Command::PitDump, 0, 0))?;

        let mut blob = Vec::new();
        let mut scratch = [0u8; PACKET_LEN];
        let first_byte_deadline = self.port.timeout();
        let started = Instant::now();
        let mut last_data = Instant::now();

        loop {
            let n = self.port.read_available(&mut scratch)?;
            if n > 0 {
                blob.extend_from_slice(&scratch[..n]);
                last_data = Instant::now();
                continue;
            }
            if !blob.is_empty() {
                if last_data.elapsed() >= PIT_IDLE_WINDOW {
                    break;
                }
            } else if started.elapsed() >= first_byte_deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if blob.is_empty() {
            self.state = SessionState::Faulted;
            error!("PITR returned no data");
            return Err(Error::PitEmpty);
        }

        info!("PIT read: {} bytes", blob.len());
        Ok(blob)
    }

    /// Stream one image to the device (`DATA` + raw payload).
    ///
    /// The declared payload size is the image size truncated to 32 bits;
    /// devices stream past the field for larger images, so the cast is the
    /// observed wire behaviour, not a bug to fix with a wider field.
    pub fn flash_image<R: Read>(
        &mut self,
        image: &mut ImageStream<R>,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        if self.state != SessionState::Greeted {
            return Err(self.unexpected("flash_image"));
        }

        info!("DATA stream for {} ({} bytes)", image.name(), image.size());
        self.port
            .write_all_bytes(&frame::encode(Command::Data, image.size() as u32, 0))?;
        match frame::await_ack(&mut self.port, ACK_TIMEOUT)? {
            Some(ACK) => {}
            other => {
                self.state = SessionState::Faulted;
                error!("DATA start for {} got {other:?}", image.name());
                return Err(Error::BadAck {
                    stage: format!("DATA start for {}", image.name()),
                });
            }
        }

        self.state = SessionState::Transferring;

        // Long flash phases answer slowly; widen the read deadline for them.
        let large = image.size() > LARGE_IMAGE_THRESHOLD;
        if large {
            self.port.set_timeout(TIMEOUT_LARGE_TRANSFER)?;
        }
        let result = BulkTransfer::with_config(&mut self.port, BulkConfig::default()).stream(
            image,
            progress,
            &mut |port| recovery::resync(port),
        );
        if large {
            let _ = self.port.set_timeout(TIMEOUT_DEFAULT);
        }

        match result {
            Ok(()) => {
                // Some models acknowledge the completed stream; consume it so
                // it cannot be mistaken for the next command's reply.
                if let Some(byte) = frame::await_ack(&mut self.port, Duration::from_millis(100))? {
                    debug!("post-stream status byte {byte:#04x}");
                }
                self.state = SessionState::Greeted;
                info!("{} flashed", image.name());
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Faulted;
                error!("DATA stream for {} failed: {e}", image.name());
                Err(e)
            }
        }
    }

    /// End the session (`ENDS`); the device closes up and reboots.
    pub fn end(&mut self) -> Result<()> {
        if self.state != SessionState::Greeted {
            return Err(self.unexpected("end"));
        }
        self.port
            .write_all_bytes(&frame::encode(Command::EndSession, 0, 0))?;
        self.state = SessionState::Ended;
        info!("session ended; device is rebooting");
        Ok(())
    }

    /// Reboot to normal mode (`REBT`).
    pub fn reboot(&mut self) -> Result<()> {
        if self.state != SessionState::Greeted {
            return Err(self.unexpected("reboot"));
        }
        self.port
            .write_all_bytes(&frame::encode(Command::Reboot, 0, 0))?;
        self.state = SessionState::Ended;
        info!("reboot requested; device is leaving download mode");
        Ok(())
    }

    /// Try to bring a faulted session back to `Greeted`.
    ///
    /// Runs the purge/settle/re-greet procedure on the existing handle. A
    /// failed recovery leaves the session faulted.
    pub fn recover(&mut self) -> Result<()> {
        match self.state {
            SessionState::Faulted | SessionState::Greeted => {}
            _ => return Err(self.unexpected("recover")),
        }
        match recovery::resync(&mut self.port) {
            Ok(()) => {
                self.state = SessionState::Greeted;
                info!("session recovered");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Faulted;
                Err(e)
            }
        }
    }
}

impl LokeSession<NativePort> {
    /// Open the named port with download-mode settings and wrap it.
    ///
    /// The port open blocks through the settling window, so the caller can
    /// `greet()` immediately.
    pub fn open(port_name: &str) -> Result<Self> {
        let port = NativePort::open_download_mode(port_name)?;
        Ok(Self::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use crate::protocol::frame::{decode, GREETING_REPLY};

    /// Device double: answers ODIN with LOKE and every other control packet
    /// with ACK; stays silent on bulk payload.
    fn friendly_device() -> MockPort {
        MockPort::new().with_responder(|written| {
            if written.len() != PACKET_LEN {
                return Vec::new();
            }
            match &written[..4] {
                b"ODIN" => GREETING_REPLY.to_vec(),
                b"PITM" | b"DATA" => vec![ACK],
                _ => Vec::new(),
            }
        })
    }

    #[test]
    fn test_greet_with_loke_reply() {
        let mut session = LokeSession::new(friendly_device());
        session.greet().unwrap();
        assert_eq!(session.state(), SessionState::Greeted);

        let port = session.into_port();
        let writes = port.writes();
        assert_eq!(writes.len(), 1);
        let (cmd, size, seq) = decode(writes[0]).unwrap();
        assert_eq!(cmd, Command::Handshake);
        assert_eq!((size, seq), (0, 0));
    }

    #[test]
    fn test_greet_with_bare_ack_reply() {
        let port = MockPort::new().with_responder(|written| {
            if written.starts_with(b"ODIN") {
                vec![ACK]
            } else {
                Vec::new()
            }
        });
        let mut session = LokeSession::new(port);
        session.greet().unwrap();
        assert_eq!(session.state(), SessionState::Greeted);
    }

    #[test]
    fn test_greet_retries_once_then_faults() {
        let mut session = LokeSession::new(MockPort::new());
        let err = session.greet().unwrap_err();
        assert!(matches!(err, Error::GreetFailed));
        assert_eq!(session.state(), SessionState::Faulted);

        // One packet per attempt, with purges around them.
        let port = session.into_port();
        assert_eq!(port.writes().len(), 2);
        assert!(port.purge_count() >= 2);
    }

    #[test]
    fn test_pit_round_trip() {
        // On PITR the device streams 1024 bytes starting 01 02 03, then goes
        // idle; segment writes and mode entry are ACKed.
        let mut pit_reply = vec![0x01u8, 0x02, 0x03];
        pit_reply.extend(vec![0xEE; 1021]);
        let reply_for_responder = pit_reply.clone();

        let port = MockPort::new().with_responder(move |written| {
            if written.len() != PACKET_LEN {
                return Vec::new();
            }
            match &written[..4] {
                b"ODIN" => GREETING_REPLY.to_vec(),
                b"PITM" => vec![ACK],
                b"PITR" => reply_for_responder.clone(),
                _ => Vec::new(),
            }
        });

        let mut session = LokeSession::new(port);
        session.greet().unwrap();

        let blob = session.read_pit().unwrap();
        assert_eq!(blob.len(), 1024);
        assert_eq!(&blob[..3], &[0x01, 0x02, 0x03]);
        assert_eq!(session.state(), SessionState::Greeted);
    }

    #[test]
    fn test_write_pit_pads_segments_to_packet_len() {
        let port = MockPort::new().with_responder(|written| {
            if written.starts_with(b"ODIN") {
                GREETING_REPLY.to_vec()
            } else {
                vec![ACK]
            }
        });
        let mut session = LokeSession::new(port);
        session.greet().unwrap();
        session.enter_pit_mode().unwrap();

        let blob: Vec<u8> = (0..1234u32).map(|i| i as u8).collect();
        session.write_pit(&blob).unwrap();
        assert_eq!(session.state(), SessionState::Greeted);

        let port = session.into_port();
        let writes = port.writes();
        // ODIN, PITM, then three padded segments.
        assert_eq!(writes.len(), 5);
        for segment in &writes[2..] {
            assert_eq!(segment.len(), PACKET_LEN);
        }
        assert_eq!(&writes[2][..500], &blob[..500]);
        assert_eq!(&writes[4][..234], &blob[1000..]);
        assert!(writes[4][234..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_missing_pit_ack_is_fatal() {
        let port = MockPort::new().with_responder(|written| {
            if written.len() == PACKET_LEN && written.starts_with(b"ODIN") {
                GREETING_REPLY.to_vec()
            } else if written.len() == PACKET_LEN && written.starts_with(b"PITM") {
                vec![ACK]
            } else {
                Vec::new() // never ACK payload segments
            }
        });
        let mut session = LokeSession::new(port);
        session.greet().unwrap();
        session.enter_pit_mode().unwrap();

        let err = session.write_pit(&[0xAB; 100]).unwrap_err();
        assert!(matches!(err, Error::BadAck { .. }));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_empty_pit_dump_is_an_error() {
        let mut session = LokeSession::new(friendly_device());
        session.greet().unwrap();
        // friendly_device stays silent on PITR; shorten the first-byte
        // deadline so the test does not sit out the full link timeout.
        session
            .port_mut()
            .set_timeout(Duration::from_millis(50))
            .unwrap();
        let err = session.read_pit().unwrap_err();
        assert!(matches!(err, Error::PitEmpty));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_small_image_flash() {
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
        let mut image = ImageStream::new("param.bin", 600, payload.as_slice());

        let mut session = LokeSession::new(friendly_device());
        session.greet().unwrap();
        session.flash_image(&mut image, &mut |_, _| {}).unwrap();
        assert_eq!(session.state(), SessionState::Greeted);

        let port = session.into_port();
        let writes = port.writes();
        // ODIN, DATA, then two raw chunks (500 + 100), no keep-alive.
        assert_eq!(writes.len(), 4);
        let (cmd, size, seq) = decode(writes[1]).unwrap();
        assert_eq!(cmd, Command::Data);
        assert_eq!(size, 600);
        assert_eq!(seq, 0);
        let streamed: Vec<u8> = writes[2..].concat();
        assert_eq!(streamed, payload);
    }

    #[test]
    fn test_stall_recovery_rewrites_chunk_and_completes() {
        use crate::protocol::bulk::BULK_CHUNK;

        let size = 20 * BULK_CHUNK as u64;
        let payload: Vec<u8> = (0..size).map(|i| (i % 249) as u8).collect();
        let mut image = ImageStream::new("ap.img", size, payload.as_slice());

        let mut port = MockPort::new().with_responder(|written| {
            if written.len() != PACKET_LEN {
                return Vec::new();
            }
            match &written[..4] {
                // The re-handshake during recovery is answered with a bare
                // ACK, like a device that lost its greeting state.
                b"ODIN" => vec![ACK],
                b"DATA" => vec![ACK],
                _ => Vec::new(),
            }
        });
        // Writes: 0 = ODIN, 1 = DATA, 2.. = chunks; fail chunk 7 once.
        port.fail_write_at(8);

        let mut session = LokeSession::new(port);
        session.greet().unwrap();
        session.flash_image(&mut image, &mut |_, _| {}).unwrap();
        assert_eq!(session.state(), SessionState::Greeted);

        let port = session.into_port();
        // The recovery purge ran between the stall and the retry.
        assert!(port.purge_count() >= 1);
        // Concatenated successful chunk writes reproduce the payload: the
        // stalled write never landed and its retry went out verbatim.
        let streamed: Vec<u8> = port
            .writes()
            .into_iter()
            .filter(|&w| w.len() != PACKET_LEN || decode(w).is_none())
            .flat_map(|w| w.to_vec())
            .collect();
        assert_eq!(streamed.len() as u64, size);
        assert_eq!(streamed, payload);
    }

    #[test]
    fn test_data_without_ack_is_fatal() {
        let port = MockPort::new().with_responder(|written| {
            if written.starts_with(b"ODIN") {
                GREETING_REPLY.to_vec()
            } else {
                Vec::new()
            }
        });
        let mut session = LokeSession::new(port);
        session.greet().unwrap();

        let mut image = ImageStream::new("x.bin", 4, [0u8; 4].as_slice());
        let err = session.flash_image(&mut image, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::BadAck { .. }));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_end_twice_leaves_link_untouched() {
        let mut session = LokeSession::new(friendly_device());
        session.greet().unwrap();
        session.end().unwrap();
        assert_eq!(session.state(), SessionState::Ended);

        let writes_after_first = session.port_mut().writes().len();
        let err = session.end().unwrap_err();
        assert!(matches!(err, Error::UnexpectedState { .. }));
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.port_mut().writes().len(), writes_after_first);
    }

    #[test]
    fn test_reboot_sends_rebt_and_ends() {
        let mut session = LokeSession::new(friendly_device());
        session.greet().unwrap();
        session.reboot().unwrap();
        assert_eq!(session.state(), SessionState::Ended);

        let port = session.into_port();
        let last = port.writes().last().unwrap().to_vec();
        assert_eq!(&last[..4], b"REBT");
    }

    #[test]
    fn test_operations_guard_their_states() {
        let mut session = LokeSession::new(MockPort::new());
        // Nothing is valid before the greeting except greet itself.
        assert!(matches!(
            session.enter_pit_mode().unwrap_err(),
            Error::UnexpectedState { .. }
        ));
        assert!(matches!(
            session.read_pit().unwrap_err(),
            Error::UnexpectedState { .. }
        ));
        assert!(matches!(
            session.end().unwrap_err(),
            Error::UnexpectedState { .. }
        ));
        assert!(matches!(
            session.write_pit(&[0; 4]).unwrap_err(),
            Error::UnexpectedState { .. }
        ));
        // And no bytes ever hit the link.
        assert!(session.port_mut().writes().is_empty());
    }

    #[test]
    fn test_recover_regreets_a_faulted_session() {
        // The device ignores the first two handshakes (the greet and its
        // retry), then starts answering: exactly the shape of a device that
        // needed a purge to get unstuck.
        let mut odin_count = 0u32;
        let port = MockPort::new().with_responder(move |written| {
            if written.len() == PACKET_LEN && written.starts_with(b"ODIN") {
                odin_count += 1;
                if odin_count >= 3 {
                    return vec![ACK];
                }
            }
            Vec::new()
        });

        let mut session = LokeSession::new(port);
        assert!(session.greet().is_err());
        assert_eq!(session.state(), SessionState::Faulted);

        session.recover().unwrap();
        assert_eq!(session.state(), SessionState::Greeted);
    }
}
