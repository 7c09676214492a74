//! Server-side request queue for one TCP connection.
//!
//! Requests are answered strictly in arrival order. Each response carries
//! the write completion of the response before it; the first one carries
//! the time the connection entered its loop.

use crate::protocol::{Piggyback, ProtocolError, RequestHeader, ResponseHeader, SetupHeader};
use std::collections::VecDeque;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub seq: u64,
    pub slot: u64,
    pub read_start: u64,
    pub read_end: u64,
}

#[derive(Debug)]
pub struct ServerSession {
    setup: SetupHeader,
    queue: VecDeque<PendingRequest>,
    capacity: usize,
    /// Completion of the last response fully written.
    prev: Piggyback,
    /// Response whose write has started but not finished.
    writing: Option<Piggyback>,
    received: u64,
    answered: u64,
    trailer_sent: bool,
}

impl ServerSession {
    pub fn new(setup: SetupHeader, loop_start: u64) -> Self {
        let capacity = setup.concurrency.saturating_add(1) as usize;
        Self {
            setup,
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            prev: Piggyback {
                write_end: loop_start,
                ..Piggyback::default()
            },
            writing: None,
            received: 0,
            answered: 0,
            trailer_sent: false,
        }
    }

    fn bounded(&self) -> bool {
        self.setup.request_count != 0
    }

    /// True while more requests are expected.
    pub fn wants_read(&self) -> bool {
        !self.bounded() || self.received < self.setup.request_count
    }

    /// Queues a fully read request.
    pub fn accept_request(
        &mut self,
        header: RequestHeader,
        read_start: u64,
        read_end: u64,
    ) -> Result<(), ProtocolError> {
        let unanswered = self.queue.len() as u64 + u64::from(self.writing.is_some());
        if unanswered >= self.setup.concurrency || self.queue.len() >= self.capacity {
            return Err(ProtocolError::QueueOverflow {
                concurrency: self.setup.concurrency,
            });
        }
        trace!(seq = header.seq, slot = header.slot, "Request queued");
        self.queue.push_back(PendingRequest {
            seq: header.seq,
            slot: header.slot,
            read_start,
            read_end,
        });
        self.received += 1;
        Ok(())
    }

    /// Starts the next response if none is being written: the oldest queued
    /// request, or the trailer once a bounded run has been fully answered.
    pub fn start_response(&mut self, now: u64) -> Option<ResponseHeader> {
        if self.writing.is_some() {
            return None;
        }
        if let Some(request) = self.queue.pop_front() {
            self.writing = Some(Piggyback {
                seq: request.seq,
                slot: request.slot,
                write_end: 0,
            });
            return Some(ResponseHeader {
                prev: self.prev,
                seq: request.seq,
                slot: request.slot,
                read_start: request.read_start,
                read_end: request.read_end,
                write_start: now,
            });
        }
        if self.bounded() && !self.trailer_sent && self.answered == self.setup.request_count {
            self.writing = Some(Piggyback::default());
            debug!(prev_seq = self.prev.seq, "Sending trailer");
            return Some(ResponseHeader::trailer(self.prev, now));
        }
        None
    }

    /// Marks the response in flight as fully written.
    pub fn finish_response(&mut self, write_end: u64) {
        match self.writing.take() {
            Some(response) if response.is_empty() => self.trailer_sent = true,
            Some(response) => {
                self.prev = Piggyback {
                    write_end,
                    ..response
                };
                self.answered += 1;
            }
            None => {}
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writing.is_some()
    }

    /// A response is in flight or could start right now.
    pub fn has_output(&self) -> bool {
        self.writing.is_some()
            || !self.queue.is_empty()
            || (self.bounded() && !self.trailer_sent && self.answered == self.setup.request_count)
    }

    /// Bounded run answered and trailer written.
    pub fn is_done(&self) -> bool {
        self.bounded() && self.trailer_sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn answered(&self) -> u64 {
        self.answered
    }
}
