//! Bulk image streaming over an open, greeted link.
//!
//! Control traffic moves in 500-byte packets, but image payload is raw: the
//! engine reads the source in chunks and writes them verbatim. Two chunk
//! sizes exist, 128 KiB for anything over 1 MiB and the control size of 500
//! bytes below that. The 128 KiB figure is load-bearing: larger writes
//! saturate the host-side CDC driver.
//!
//! The engine also owns the three quirks of long transfers:
//!
//! - a `0x64` keep-alive byte when the host pauses too long between chunks,
//!   so the device does not conclude the host hung;
//! - a periodic best-effort ACK poll (devices differ on whether and how often
//!   they acknowledge bulk chunks, so a wrong byte is only a warning);
//! - a post-transfer purge-and-settle for images over 100 MiB, giving the
//!   flash controller room before the next `DATA` command.

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::ImageStream;
use crate::port::Port;
use crate::protocol::frame::{ACK, KEEP_ALIVE, PACKET_LEN};

/// Chunk size for images larger than [`BULK_THRESHOLD`].
pub const BULK_CHUNK: usize = 128 * 1024;

/// Chunk size for small images.
pub const CONTROL_CHUNK: usize = PACKET_LEN;

/// Image size above which the bulk chunk size applies.
pub const BULK_THRESHOLD: u64 = 1024 * 1024;

/// Image size above which the post-transfer purge-and-settle runs.
pub const LARGE_IMAGE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Pick the write granularity for an image of the given size.
pub fn chunk_size_for(size: u64) -> usize {
    if size > BULK_THRESHOLD {
        BULK_CHUNK
    } else {
        CONTROL_CHUNK
    }
}

/// Tunables of the streaming loop.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Idle gap after which a keep-alive byte precedes the next chunk.
    pub keepalive_gap: Duration,
    /// Poll for a device status byte every this many chunks.
    pub ack_poll_every: u64,
    /// Emit progress at most once per this many bytes.
    pub progress_step: u64,
    /// Image size that triggers the epilogue purge.
    pub large_threshold: u64,
    /// Settle time after the epilogue purge.
    pub epilogue_settle: Duration,
    /// Consult the process-wide interrupt checker between chunks.
    pub check_interrupt: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            keepalive_gap: Duration::from_millis(400),
            ack_poll_every: 10,
            progress_step: 1024 * 1024,
            large_threshold: LARGE_IMAGE_THRESHOLD,
            epilogue_settle: Duration::from_millis(500),
            check_interrupt: true,
        }
    }
}

/// Streaming engine borrowing the session's link.
pub struct BulkTransfer<'a, P: Port> {
    port: &'a mut P,
    config: BulkConfig,
}

impl<'a, P: Port> BulkTransfer<'a, P> {
    /// Create an engine with default tunables.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, BulkConfig::default())
    }

    /// Create an engine with custom tunables.
    pub fn with_config(port: &'a mut P, config: BulkConfig) -> Self {
        Self { port, config }
    }

    /// Stream the whole image to the device.
    ///
    /// `progress` receives `(bytes_sent, total)` at most once per
    /// `progress_step` bytes plus once at completion; it must not block.
    /// On a transient write stall, `resync` is given the link once and the
    /// failing chunk is re-written verbatim; a second stall on the same chunk
    /// surfaces the error.
    pub fn stream<R: Read>(
        &mut self,
        image: &mut ImageStream<R>,
        progress: &mut dyn FnMut(u64, u64),
        resync: &mut dyn FnMut(&mut P) -> Result<()>,
    ) -> Result<()> {
        let total = image.size();
        let chunk_size = chunk_size_for(total);
        let mut buf = vec![0u8; chunk_size];

        debug!(
            "streaming {} ({} bytes) in {} byte chunks",
            image.name(),
            total,
            chunk_size
        );

        let mut sent: u64 = 0;
        let mut chunk_index: u64 = 0;
        let mut last_emitted: Option<u64> = None;
        let mut last_write = Instant::now();

        while sent < total {
            if self.config.check_interrupt && crate::is_interrupt_requested() {
                return Err(Error::Cancelled);
            }

            let want = chunk_size.min((total - sent) as usize);
            read_full(image, &mut buf[..want])?;

            // The device assumes a silent host has hung; nudge it if the
            // source stream made us pause and it has nothing queued for us.
            if last_write.elapsed() > self.config.keepalive_gap && self.port.bytes_to_read()? == 0
            {
                self.port.write_all_bytes(&[KEEP_ALIVE])?;
            }

            if let Err(err) = self.write_chunk(&buf[..want]) {
                if !err.is_recoverable() {
                    return Err(err);
                }
                warn!(
                    "chunk {} of {} stalled: {err}; resynchronising link",
                    chunk_index,
                    image.name()
                );
                resync(self.port)?;
                self.write_chunk(&buf[..want])?;
            }
            last_write = Instant::now();
            sent += want as u64;
            chunk_index += 1;

            if chunk_index % self.config.ack_poll_every == 0 {
                self.poll_status(image.name())?;
            }

            let due = match last_emitted {
                Some(mark) => sent - mark >= self.config.progress_step,
                None => sent >= self.config.progress_step,
            };
            if due || sent == total {
                progress(sent, total);
                last_emitted = Some(sent);
            }
        }

        if last_emitted != Some(total) {
            progress(sent, total);
        }

        if total > self.config.large_threshold {
            debug!("large image epilogue: purging link after {}", image.name());
            self.port.purge(true, true)?;
            thread::sleep(self.config.epilogue_settle);
        }

        info!("{}: {sent} bytes streamed", image.name());
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self.port.write_all_bytes(chunk) {
            Ok(()) => Ok(()),
            Err(Error::Io(e)) if is_stall_kind(e.kind()) => {
                Err(Error::Stalled(format!("bulk write: {e}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Consume one buffered status byte if the device sent any.
    fn poll_status(&mut self, name: &str) -> Result<()> {
        let mut byte = [0u8; 1];
        if self.port.read_available(&mut byte)? == 1 && byte[0] != ACK {
            // Occasional garbled status bytes are expected mid-stream.
            warn!(
                "unexpected status byte {:#04x} during {name} (ignored)",
                byte[0]
            );
        }
        Ok(())
    }
}

fn is_stall_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "image source ended before its declared size",
            )));
        }
        filled += n;
    }
    Ok(())
}
