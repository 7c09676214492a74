//! Fixed-size message buffer for non-blocking streams.
//!
//! Messages never change size within a connection, so a single buffer plus
//! a byte offset is enough to resume partial reads and writes.

use std::io::{self, ErrorKind, Read, Write};
use tracing::trace;

/// Outcome of a single transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The whole message has been transferred; the offset is back at 0.
    Complete,
    /// Some bytes moved but the message is not finished.
    Partial,
    /// The socket is not ready; nothing moved.
    Blocked,
    /// The peer closed the connection.
    Closed,
}

#[derive(Debug)]
pub struct TransferBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl TransferBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            offset: 0,
        }
    }

    /// True when no message is partially transferred.
    pub fn is_idle(&self) -> bool {
        self.offset == 0
    }

    /// The message contents. Meaningful after a [`Progress::Complete`] read.
    pub fn message(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access for filling in an outgoing message before the first write.
    pub fn message_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Performs one read covering at most the rest of the current message.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<Progress> {
        loop {
            match reader.read(&mut self.buf[self.offset..]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => {
                    trace!(bytes = n, offset = self.offset, "Read bytes");
                    return Ok(self.advance(n));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) => return Err(e),
            }
        }
    }

    /// Performs one write covering at most the rest of the current message.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Progress> {
        loop {
            match writer.write(&self.buf[self.offset..]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => {
                    trace!(bytes = n, offset = self.offset, "Wrote bytes");
                    return Ok(self.advance(n));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) => return Err(e),
            }
        }
    }

    fn advance(&mut self, n: usize) -> Progress {
        self.offset += n;
        if self.offset == self.buf.len() {
            self.offset = 0;
            Progress::Complete
        } else {
            Progress::Partial
        }
    }
}
