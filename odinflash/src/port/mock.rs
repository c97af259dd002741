//! Scripted in-memory port backend.
//!
//! `MockPort` plays the device side of the link for tests: a responder
//! closure maps each host write to the bytes the device queues back, writes
//! can be made to fail once at a given index to simulate a stall, and every
//! link operation is recorded so tests can assert ordering (for example that
//! the large-transfer epilogue purge happens after the final payload byte).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

/// One recorded link operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// A host write of `len` bytes. `data` is empty when recording is
    /// running in count-only mode.
    Write {
        /// Number of bytes written.
        len: usize,
        /// The written bytes, when data recording is enabled.
        data: Vec<u8>,
    },
    /// A buffer purge.
    Purge {
        /// TX buffer was purged.
        tx: bool,
        /// RX buffer was purged.
        rx: bool,
    },
    /// A clear-errors call.
    ClearErrors,
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Scripted port double implementing [`Port`].
pub struct MockPort {
    name: String,
    rx: VecDeque<u8>,
    responder: Option<Responder>,
    fail_writes: VecDeque<u64>,
    write_index: u64,
    keep_data: bool,
    ops: Vec<Op>,
    total_written: u64,
    timeout: Duration,
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPort {
    /// Create an idle mock port with no scripted device behaviour.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            rx: VecDeque::new(),
            responder: None,
            fail_writes: VecDeque::new(),
            write_index: 0,
            keep_data: true,
            ops: Vec::new(),
            total_written: 0,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Install the device-side responder: called once per host write with the
    /// written bytes; whatever it returns is queued as device output.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Stop recording write payloads; only lengths are kept. Used by
    /// large-transfer tests that would otherwise hold the whole stream.
    #[must_use]
    pub fn count_only(mut self) -> Self {
        self.keep_data = false;
        self
    }

    /// Make the write with the given 0-based index fail once with a timeout.
    pub fn fail_write_at(&mut self, index: u64) {
        self.fail_writes.push_back(index);
    }

    /// Queue bytes as pending device output.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// All recorded operations, in order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// The payloads of all recorded writes, in order.
    pub fn writes(&self) -> Vec<&[u8]> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// Lengths of all recorded writes, in order.
    pub fn write_lens(&self) -> Vec<usize> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { len, .. } => Some(*len),
                _ => None,
            })
            .collect()
    }

    /// Total bytes written over the lifetime of the port.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Number of purges recorded.
    pub fn purge_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::Purge { .. }))
            .count()
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self.rx.len())
    }

    fn purge(&mut self, tx: bool, rx: bool) -> Result<()> {
        self.ops.push(Op::Purge { tx, rx });
        if rx {
            self.rx.clear();
        }
        Ok(())
    }

    fn clear_errors(&mut self) -> Result<()> {
        self.ops.push(Op::ClearErrors);
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            // A real port blocks until its timeout elapses; the double fails
            // fast with the same error kind.
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no device data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let index = self.write_index;
        self.write_index += 1;

        if self.fail_writes.front() == Some(&index) {
            self.fail_writes.pop_front();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled"));
        }

        let data = if self.keep_data {
            buf.to_vec()
        } else {
            Vec::new()
        };
        self.ops.push(Op::Write {
            len: buf.len(),
            data,
        });
        self.total_written += buf.len() as u64;

        if let Some(ref mut responder) = self.responder {
            let reply = responder(buf);
            self.rx.extend(reply);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_queues_device_reply() {
        let mut port = MockPort::new().with_responder(|written| {
            if written.starts_with(b"PING") {
                b"PONG".to_vec()
            } else {
                Vec::new()
            }
        });

        port.write_all(b"PING").unwrap();
        let mut buf = [0u8; 4];
        port.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"PONG");
    }

    #[test]
    fn test_fail_write_at_fails_exactly_once() {
        let mut port = MockPort::new();
        port.fail_write_at(1);

        assert!(port.write(b"a").is_ok());
        assert!(port.write(b"b").is_err());
        assert!(port.write(b"b").is_ok());
        assert_eq!(port.write_lens(), vec![1, 1]);
    }

    #[test]
    fn test_purge_discards_rx_and_is_recorded() {
        let mut port = MockPort::new();
        port.push_rx(&[1, 2, 3]);
        port.purge(true, true).unwrap();
        assert_eq!(port.bytes_to_read().unwrap(), 0);
        assert_eq!(port.purge_count(), 1);
    }

    #[test]
    fn test_count_only_records_lengths_without_data() {
        let mut port = MockPort::new().count_only();
        port.write_all(&[0u8; 64]).unwrap();
        assert_eq!(port.total_written(), 64);
        assert_eq!(port.write_lens(), vec![64]);
        assert!(port.writes().iter().all(|w| w.is_empty()));
    }
}
