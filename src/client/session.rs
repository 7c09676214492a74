//! Client-side request bookkeeping, independent of any socket.
//!
//! The pipeline drivers feed timestamps and decoded headers in; the session
//! decides when a new request may start, tracks slots, runs the offset
//! estimator and hands back completed metrics lines.

use crate::client::slots::SlotRing;
use crate::clock::{OffsetBounds, OffsetUpdate};
use crate::metrics::MetricsLine;
use crate::protocol::{ProtocolError, RequestHeader, ResponseHeader};
use tracing::{debug, warn};

/// Whether a new request may start right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Open,
    /// Only the delay gate is shut; it opens after this many microseconds.
    Wait(u64),
    /// Nothing may be sent until a response arrives (or ever, once the
    /// request budget is spent).
    Closed,
}

/// Minimum spacing between consecutive request sends.
#[derive(Debug, Clone, Copy)]
pub struct DelayGate {
    delay: u64,
    last: Option<u64>,
}

impl DelayGate {
    pub fn new(delay_us: u64) -> Self {
        Self {
            delay: delay_us,
            last: None,
        }
    }

    /// Microseconds until the gate opens, or `None` if it is open.
    pub fn remaining(&self, now: u64) -> Option<u64> {
        let last = self.last?;
        let elapsed = now.saturating_sub(last);
        (elapsed < self.delay).then(|| self.delay - elapsed)
    }

    pub fn mark(&mut self, sent_at: u64) {
        self.last = Some(sent_at);
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// Run shape agreed with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// 0 for unbounded
    pub request_count: u64,
    pub concurrency: u64,
    pub delay_us: u64,
}

#[derive(Debug)]
pub struct ClientSession {
    limits: SessionLimits,
    ring: SlotRing,
    gate: DelayGate,
    bounds: OffsetBounds,
    /// Requests whose write has begun; also the last seq handed out.
    started: u64,
    /// Requests fully written.
    sent: u64,
    acked: u64,
    writing: Option<u64>,
    drift_resets: u64,
    peak_outstanding: u64,
}

impl ClientSession {
    pub fn new(limits: SessionLimits, bounds: OffsetBounds) -> Self {
        Self {
            ring: SlotRing::new(limits.concurrency as usize),
            gate: DelayGate::new(limits.delay_us),
            limits,
            bounds,
            started: 0,
            sent: 0,
            acked: 0,
            writing: None,
            drift_resets: 0,
            peak_outstanding: 0,
        }
    }

    pub fn admission(&self, now: u64) -> Admission {
        if self.writing.is_some() {
            return Admission::Open;
        }
        if self.budget_spent() || self.outstanding() >= self.limits.concurrency {
            return Admission::Closed;
        }
        match self.gate.remaining(now) {
            Some(wait) => Admission::Wait(wait),
            None => Admission::Open,
        }
    }

    /// Starts the next request if none is being written, returning its header.
    /// Returns `None` when a partially written request should be resumed instead.
    pub fn begin_request(&mut self, now: u64) -> Result<Option<RequestHeader>, ProtocolError> {
        if self.writing.is_some() {
            return Ok(None);
        }
        let seq = self.started + 1;
        let slot = self
            .ring
            .allocate(seq, now)
            .ok_or(ProtocolError::QueueOverflow {
                concurrency: self.limits.concurrency,
            })?;
        self.started = seq;
        self.writing = Some(slot);
        debug!(seq, slot, "Starting request");
        Ok(Some(RequestHeader { seq, slot }))
    }

    /// Records the end of a partial write of the current request.
    pub fn request_progress(&mut self, now: u64) {
        if let Some(slot) = self.writing {
            if let Ok(slot) = self.ring.claim(slot, self.started) {
                slot.request.write_end = now;
            }
        }
    }

    /// Marks the current request as fully written.
    pub fn finish_request(&mut self, now: u64) {
        self.request_progress(now);
        if self.writing.take().is_some() {
            self.sent += 1;
            self.gate.mark(now);
            self.peak_outstanding = self.peak_outstanding.max(self.outstanding());
        }
    }

    /// Applies a response, returning the metrics line for the request whose
    /// completion the response piggybacks, if any.
    pub fn accept_response(
        &mut self,
        header: &ResponseHeader,
        read_start: u64,
        read_end: u64,
    ) -> Result<Option<MetricsLine>, ProtocolError> {
        let mut completed = None;

        if !header.prev.is_empty() {
            let slot = self.ring.claim(header.prev.slot, header.prev.seq)?;
            if slot.response.read_end == 0 {
                return Err(ProtocolError::CompletedBeforeResponse {
                    seq: header.prev.seq,
                });
            }
            slot.response.write_end = header.prev.write_end;
            let (seq, request, response) = (slot.seq, slot.request, slot.response);

            let update = self.bounds.update(
                request.write_start,
                request.read_end,
                response.write_start,
                response.read_end,
            );
            if update == OffsetUpdate::Drift {
                self.drift_resets += 1;
                warn!(
                    seq,
                    lower = self.bounds.lower(),
                    upper = self.bounds.upper(),
                    "Clock offset drifted, bounds reset"
                );
            }

            completed = Some(MetricsLine::new(seq, request, response, self.bounds));
            self.ring.release(header.prev.slot);
        }

        if !header.is_trailer() {
            let slot = self.ring.claim(header.slot, header.seq)?;
            if slot.response.read_end != 0 {
                return Err(ProtocolError::DuplicateResponse { seq: header.seq });
            }
            slot.request.read_start = header.read_start;
            slot.request.read_end = header.read_end;
            slot.response.write_start = header.write_start;
            slot.response.read_start = read_start;
            slot.response.read_end = read_end.max(1);
            self.acked += 1;
            debug!(seq = header.seq, slot = header.slot, "Response received");
        }

        Ok(completed)
    }

    fn budget_spent(&self) -> bool {
        self.limits.request_count != 0 && self.started >= self.limits.request_count
    }

    /// True once every request of a bounded run has been sent.
    pub fn all_sent(&self) -> bool {
        self.budget_spent() && self.writing.is_none()
    }

    /// Every request answered and every completion reported.
    pub fn is_finished(&self) -> bool {
        self.all_sent() && self.acked == self.limits.request_count && self.ring.live() == 0
    }

    /// Sent but not yet answered.
    pub fn outstanding(&self) -> u64 {
        self.sent - self.acked
    }

    pub fn peak_outstanding(&self) -> u64 {
        self.peak_outstanding
    }

    /// Requests still waiting for either their response or their completion.
    pub fn unresolved(&self) -> usize {
        self.ring.live()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn last_send(&self) -> Option<u64> {
        self.gate.last()
    }

    pub fn bounds(&self) -> OffsetBounds {
        self.bounds
    }

    pub fn drift_resets(&self) -> u64 {
        self.drift_resets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Piggyback;

    fn limits(request_count: u64, concurrency: u64, delay_us: u64) -> SessionLimits {
        SessionLimits {
            request_count,
            concurrency,
            delay_us,
        }
    }

    fn send(session: &mut ClientSession, at: u64) -> RequestHeader {
        let header = session.begin_request(at).unwrap().unwrap();
        session.finish_request(at + 1);
        header
    }

    fn response(req: RequestHeader, prev: Piggyback, at: u64) -> ResponseHeader {
        ResponseHeader {
            prev,
            seq: req.seq,
            slot: req.slot,
            read_start: at,
            read_end: at + 1,
            write_start: at + 2,
        }
    }

    #[test]
    fn test_delay_gate() {
        let mut gate = DelayGate::new(100);
        assert_eq!(gate.remaining(0), None);
        gate.mark(1_000);
        assert_eq!(gate.remaining(1_030), Some(70));
        assert_eq!(gate.remaining(1_100), None);
    }

    #[test]
    fn test_admission_respects_concurrency() {
        let mut session = ClientSession::new(limits(0, 2, 0), OffsetBounds::unbounded());
        assert_eq!(session.admission(0), Admission::Open);
        send(&mut session, 10);
        assert_eq!(session.admission(20), Admission::Open);
        send(&mut session, 20);
        assert_eq!(session.outstanding(), 2);
        assert_eq!(session.admission(30), Admission::Closed);
    }

    #[test]
    fn test_admission_waits_for_delay() {
        let mut session = ClientSession::new(limits(0, 4, 500), OffsetBounds::unbounded());
        send(&mut session, 1_000);
        assert_eq!(session.admission(1_101), Admission::Wait(400));
        assert_eq!(session.admission(1_501), Admission::Open);
    }

    #[test]
    fn test_partial_write_keeps_admission_open() {
        let mut session = ClientSession::new(limits(1, 1, 0), OffsetBounds::unbounded());
        session.begin_request(5).unwrap().unwrap();
        assert_eq!(session.admission(6), Admission::Open);
        assert_eq!(session.begin_request(6).unwrap(), None);
        session.finish_request(7);
        assert!(session.all_sent());
        assert_eq!(session.admission(8), Admission::Closed);
    }

    #[test]
    fn test_piggyback_completes_previous_request() {
        let mut session = ClientSession::new(limits(2, 1, 0), OffsetBounds::unbounded());

        let first = send(&mut session, 100);
        let reply = response(first, Piggyback::default(), 150);
        assert_eq!(session.accept_response(&reply, 200, 201).unwrap(), None);
        assert_eq!(session.acked(), 1);

        let second = send(&mut session, 300);
        let prev = Piggyback {
            seq: first.seq,
            slot: first.slot,
            write_end: 153,
        };
        let line = session
            .accept_response(&response(second, prev, 350), 400, 401)
            .unwrap()
            .unwrap();
        assert_eq!(line.seq, 1);
        assert_eq!(line.request.write_start, 100);
        assert_eq!(line.request.write_end, 101);
        assert_eq!(line.request.read_end, 151);
        assert_eq!(line.response.write_start, 152);
        assert_eq!(line.response.write_end, 153);
        assert_eq!(line.response.read_end, 201);
        assert!(line.lower <= line.upper);
        assert!(!session.is_finished());

        let prev = Piggyback {
            seq: second.seq,
            slot: second.slot,
            write_end: 353,
        };
        let line = session
            .accept_response(&ResponseHeader::trailer(prev, 360), 410, 411)
            .unwrap()
            .unwrap();
        assert_eq!(line.seq, 2);
        assert!(session.is_finished());
        assert_eq!(session.unresolved(), 0);
    }

    #[test]
    fn test_seq_mismatch_is_protocol_error() {
        let mut session = ClientSession::new(limits(0, 1, 0), OffsetBounds::unbounded());
        let req = send(&mut session, 100);
        let mut reply = response(req, Piggyback::default(), 150);
        reply.seq = 99;
        assert!(matches!(
            session.accept_response(&reply, 200, 201),
            Err(ProtocolError::SlotMismatch { claimed: 99, .. })
        ));
    }

    #[test]
    fn test_duplicate_response_rejected() {
        let mut session = ClientSession::new(limits(0, 2, 0), OffsetBounds::unbounded());
        let req = send(&mut session, 100);
        let reply = response(req, Piggyback::default(), 150);
        session.accept_response(&reply, 200, 201).unwrap();
        assert_eq!(
            session.accept_response(&reply, 202, 203),
            Err(ProtocolError::DuplicateResponse { seq: req.seq })
        );
    }

    #[test]
    fn test_completion_before_response_rejected() {
        let mut session = ClientSession::new(limits(0, 2, 0), OffsetBounds::unbounded());
        let first = send(&mut session, 100);
        let second = send(&mut session, 110);
        let prev = Piggyback {
            seq: first.seq,
            slot: first.slot,
            write_end: 160,
        };
        assert_eq!(
            session.accept_response(&response(second, prev, 150), 200, 201),
            Err(ProtocolError::CompletedBeforeResponse { seq: 1 })
        );
    }

    #[test]
    fn test_ring_never_overflows_under_admission() {
        let concurrency = 3;
        let mut session =
            ClientSession::new(limits(50, concurrency, 0), OffsetBounds::unbounded());
        let mut in_flight = std::collections::VecDeque::new();
        let mut prev = Piggyback::default();
        let mut now = 1_000;
        let mut lines = 0;

        while !session.is_finished() {
            now += 10;
            if session.admission(now) == Admission::Open && !session.all_sent() {
                in_flight.push_back(send(&mut session, now));
                assert!(session.outstanding() <= concurrency);
                continue;
            }
            if let Some(req) = in_flight.pop_front() {
                let line = session
                    .accept_response(&response(req, prev, now), now + 5, now + 6)
                    .unwrap();
                lines += line.is_some() as u64;
                prev = Piggyback {
                    seq: req.seq,
                    slot: req.slot,
                    write_end: now + 3,
                };
            } else {
                let line = session
                    .accept_response(&ResponseHeader::trailer(prev, now), now + 5, now + 6)
                    .unwrap();
                lines += line.is_some() as u64;
            }
        }
        assert_eq!(lines, 50);
        assert_eq!(session.peak_outstanding(), concurrency);
    }
}
