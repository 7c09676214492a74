//! TCP wire messages.
//!
//! Every field is a fixed-width little-endian `u64`. Requests and responses
//! occupy the front of a buffer that is zero-padded to the size negotiated
//! in the [`SetupHeader`].

use crate::protocol::error::{ProtocolError, Result};
use tracing::trace;

const WORD: usize = std::mem::size_of::<u64>();

/// Size of an encoded [`SetupHeader`] in bytes
pub const SETUP_SIZE: usize = 4 * WORD;

/// Size of the server's setup acknowledgement (one timestamp)
pub const SETUP_ACK_SIZE: usize = WORD;

/// Size of an encoded [`RequestHeader`] in bytes
pub const REQUEST_HEADER_SIZE: usize = 2 * WORD;

/// Size of an encoded [`ResponseHeader`] in bytes
pub const RESPONSE_HEADER_SIZE: usize = 8 * WORD;

/// Largest request or response a setup may ask for (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest number of requests a setup may allow in flight
pub const MAX_CONCURRENCY: u64 = 65_536;

fn check_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        trace!(expected, actual = bytes.len(), "Message too short");
        return Err(ProtocolError::InvalidMessageSize {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

pub(crate) fn put_words(buf: &mut [u8], words: &[u64]) {
    for (chunk, word) in buf.chunks_exact_mut(WORD).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

pub(crate) fn get_word(bytes: &[u8], index: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&bytes[index * WORD..(index + 1) * WORD]);
    u64::from_le_bytes(word)
}

/// Parameters of a TCP run, sent once by the client after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    /// Number of requests in the run, 0 for unbounded
    pub request_count: u64,
    pub request_size: u64,
    pub response_size: u64,
    pub concurrency: u64,
}

impl SetupHeader {
    pub fn encode(&self) -> [u8; SETUP_SIZE] {
        let mut buf = [0u8; SETUP_SIZE];
        put_words(
            &mut buf,
            &[
                self.request_count,
                self.request_size,
                self.response_size,
                self.concurrency,
            ],
        );
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, SETUP_SIZE)?;
        Ok(Self {
            request_count: get_word(bytes, 0),
            request_size: get_word(bytes, 1),
            response_size: get_word(bytes, 2),
            concurrency: get_word(bytes, 3),
        })
    }

    /// Checks the header describes a run both sides can carry out.
    pub fn validate(&self) -> Result<()> {
        if self.request_size < REQUEST_HEADER_SIZE as u64 {
            return Err(ProtocolError::InvalidSetup(format!(
                "request size {} is below the {} byte header",
                self.request_size, REQUEST_HEADER_SIZE
            )));
        }
        if self.response_size < RESPONSE_HEADER_SIZE as u64 {
            return Err(ProtocolError::InvalidSetup(format!(
                "response size {} is below the {} byte header",
                self.response_size, RESPONSE_HEADER_SIZE
            )));
        }
        for (name, size) in [
            ("request", self.request_size),
            ("response", self.response_size),
        ] {
            if size > MAX_MESSAGE_SIZE as u64 {
                return Err(ProtocolError::InvalidSetup(format!(
                    "{} size {} exceeds the {} byte limit",
                    name, size, MAX_MESSAGE_SIZE
                )));
            }
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ProtocolError::InvalidSetup(format!(
                "concurrency {} must be between 1 and {}",
                self.concurrency, MAX_CONCURRENCY
            )));
        }
        Ok(())
    }
}

/// The server's reply to the setup: the time it finished reading it.
pub fn encode_setup_ack(server_time: u64) -> [u8; SETUP_ACK_SIZE] {
    server_time.to_le_bytes()
}

pub fn decode_setup_ack(bytes: &[u8]) -> Result<u64> {
    check_len(bytes, SETUP_ACK_SIZE)?;
    Ok(get_word(bytes, 0))
}

/// Client to server: identifies the request and the sender's ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub seq: u64,
    /// 1-based slot position in the client's ring
    pub slot: u64,
}

impl RequestHeader {
    /// Writes the header into the front of `buf`, which must hold at least
    /// [`REQUEST_HEADER_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_words(&mut buf[..REQUEST_HEADER_SIZE], &[self.seq, self.slot]);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, REQUEST_HEADER_SIZE)?;
        Ok(Self {
            seq: get_word(bytes, 0),
            slot: get_word(bytes, 1),
        })
    }
}

/// Completion of an earlier response, carried inside the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Piggyback {
    /// 0 means nothing has completed yet
    pub seq: u64,
    pub slot: u64,
    pub write_end: u64,
}

impl Piggyback {
    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }
}

/// Server to client: the answered request's server-side timestamps plus the
/// previous response's write completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub prev: Piggyback,
    /// 0 marks the trailer that only carries `prev`
    pub seq: u64,
    pub slot: u64,
    pub read_start: u64,
    pub read_end: u64,
    pub write_start: u64,
}

impl ResponseHeader {
    /// Builds the trailer sent after the last response of a bounded run.
    pub fn trailer(prev: Piggyback, write_start: u64) -> Self {
        Self {
            prev,
            write_start,
            ..Self::default()
        }
    }

    pub fn is_trailer(&self) -> bool {
        self.seq == 0
    }

    /// Writes the header into the front of `buf`, which must hold at least
    /// [`RESPONSE_HEADER_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_words(
            &mut buf[..RESPONSE_HEADER_SIZE],
            &[
                self.prev.seq,
                self.prev.slot,
                self.prev.write_end,
                self.seq,
                self.slot,
                self.read_start,
                self.read_end,
                self.write_start,
            ],
        );
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, RESPONSE_HEADER_SIZE)?;
        Ok(Self {
            prev: Piggyback {
                seq: get_word(bytes, 0),
                slot: get_word(bytes, 1),
                write_end: get_word(bytes, 2),
            },
            seq: get_word(bytes, 3),
            slot: get_word(bytes, 4),
            read_start: get_word(bytes, 5),
            read_end: get_word(bytes, 6),
            write_start: get_word(bytes, 7),
        })
    }
}
