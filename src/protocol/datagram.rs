//! UDP probe datagram.
//!
//! A probe carries everything needed to score one exchange, so neither side
//! keeps per-request state.

use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::message::{get_word, put_words};

/// Size of an encoded [`Probe`] in bytes
pub const PROBE_SIZE: usize = 11 * std::mem::size_of::<u64>();

/// Largest payload a UDP datagram can carry over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Probe {
    pub seq: u64,
    /// Length the client wants the echoed datagram to have
    pub response_len: u64,
    pub request_write_start: u64,
    /// When the server started waiting for this datagram
    pub request_wait_start: u64,
    pub request_rcvd: u64,
    pub request_read_start: u64,
    pub request_read_end: u64,
    pub response_write_start: u64,
    pub response_rcvd: u64,
    pub response_read_start: u64,
    pub response_read_end: u64,
}

impl Probe {
    pub fn new(seq: u64, response_len: u64) -> Self {
        Self {
            seq,
            response_len,
            ..Self::default()
        }
    }

    /// Writes the probe into the front of `buf`, which must hold at least
    /// [`PROBE_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_words(
            &mut buf[..PROBE_SIZE],
            &[
                self.seq,
                self.response_len,
                self.request_write_start,
                self.request_wait_start,
                self.request_rcvd,
                self.request_read_start,
                self.request_read_end,
                self.response_write_start,
                self.response_rcvd,
                self.response_read_start,
                self.response_read_end,
            ],
        );
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PROBE_SIZE {
            return Err(ProtocolError::InvalidMessageSize {
                expected: PROBE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            seq: get_word(bytes, 0),
            response_len: get_word(bytes, 1),
            request_write_start: get_word(bytes, 2),
            request_wait_start: get_word(bytes, 3),
            request_rcvd: get_word(bytes, 4),
            request_read_start: get_word(bytes, 5),
            request_read_end: get_word(bytes, 6),
            response_write_start: get_word(bytes, 7),
            response_rcvd: get_word(bytes, 8),
            response_read_start: get_word(bytes, 9),
            response_read_end: get_word(bytes, 10),
        })
    }

    /// Clamps the requested response length into what a server with the
    /// given packet limit can send back.
    pub fn clamp_response_len(&mut self, max_packet: usize) -> bool {
        let clamped = self
            .response_len
            .clamp(PROBE_SIZE as u64, max_packet as u64);
        let changed = clamped != self.response_len;
        self.response_len = clamped;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_size() {
        assert_eq!(PROBE_SIZE, 88);
    }

    #[test]
    fn test_probe_encode_decode() {
        let probe = Probe {
            seq: 7,
            response_len: 128,
            request_write_start: 1,
            request_wait_start: 2,
            request_rcvd: 3,
            request_read_start: 4,
            request_read_end: 5,
            response_write_start: 6,
            response_rcvd: 7,
            response_read_start: 8,
            response_read_end: 9,
        };
        let mut buf = vec![0u8; 256];
        probe.encode_into(&mut buf);
        assert_eq!(Probe::decode(&buf).unwrap(), probe);
    }

    #[test]
    fn test_undersized_probe() {
        let buf = [0u8; PROBE_SIZE - 1];
        assert!(matches!(
            Probe::decode(&buf),
            Err(ProtocolError::InvalidMessageSize { actual, .. }) if actual == PROBE_SIZE - 1
        ));
    }

    #[test]
    fn test_clamp_response_len() {
        let mut probe = Probe::new(1, 4096);
        assert!(probe.clamp_response_len(1024));
        assert_eq!(probe.response_len, 1024);

        let mut probe = Probe::new(1, 10);
        assert!(probe.clamp_response_len(1024));
        assert_eq!(probe.response_len, PROBE_SIZE as u64);

        let mut probe = Probe::new(1, 200);
        assert!(!probe.clamp_response_len(1024));
        assert_eq!(probe.response_len, 200);
    }
}
