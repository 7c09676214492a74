//! UDP probe client.
//!
//! Every exchange is one self-describing datagram each way, so the client
//! only remembers which sequence numbers are still unanswered. The delay
//! gate alone limits the send rate.

use crate::client::config::ClientSettings;
use crate::client::reporter::{RunOutcome, RunSummary};
use crate::client::session::DelayGate;
use crate::client::slots::Leg;
use crate::client::statistics::Statistics;
use crate::client::tcp::wait_for_input;
use crate::clock::{now_micros, OffsetBounds, OffsetUpdate};
use crate::error::{ProbeError, Result};
use crate::metrics::{MetricsLine, MetricsSink};
use crate::protocol::{Probe, PROBE_SIZE};
use crate::socket::{open_udp, resolve, Role};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashSet;
use std::io::{self, ErrorKind};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SOCKET: Token = Token(0);

pub fn run_udp_client<S: MetricsSink>(settings: &ClientSettings, sink: &mut S) -> Result<RunSummary> {
    let addr = resolve(&settings.host, settings.port)?;
    info!(
        %addr,
        request_size = settings.request_size,
        response_size = settings.response_size,
        requests = settings.limits.request_count,
        delay_us = settings.limits.delay_us,
        "Sending UDP probes"
    );
    let socket = open_udp(Role::Connector, addr, &settings.socket)?;
    if settings.wait_for_input {
        wait_for_input()?;
    }
    socket.set_nonblocking(true)?;
    UdpPipeline::new(UdpSocket::from_std(socket), settings)?.run(sink)
}

/// Builds the metrics line for a probe that made the full round trip.
pub fn probe_line(probe: &Probe, bounds: OffsetBounds) -> MetricsLine {
    MetricsLine::new(
        probe.seq,
        Leg {
            write_start: probe.request_write_start,
            write_end: probe.request_rcvd,
            read_start: probe.request_read_start,
            read_end: probe.request_read_end,
        },
        Leg {
            write_start: probe.response_write_start,
            write_end: probe.response_rcvd,
            read_start: probe.response_read_start,
            read_end: probe.response_read_end,
        },
        bounds,
    )
}

struct UdpPipeline {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    request_count: u64,
    response_len: u64,
    drain_us: Option<u64>,
    gate: DelayGate,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    write_blocked: bool,
    bounds: OffsetBounds,
    sent: u64,
    received: u64,
    /// Sequence numbers sent and not yet answered
    pending: HashSet<u64>,
    drift_resets: u64,
    stats: Statistics,
}

impl UdpPipeline {
    fn new(mut socket: UdpSocket, settings: &ClientSettings) -> Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(16),
            request_count: settings.limits.request_count,
            response_len: settings.response_size as u64,
            drain_us: settings.drain_us,
            gate: DelayGate::new(settings.limits.delay_us),
            send_buf: vec![0u8; settings.request_size.max(PROBE_SIZE)],
            recv_buf: vec![0u8; settings.response_size.max(PROBE_SIZE)],
            write_blocked: false,
            bounds: OffsetBounds::unbounded(),
            sent: 0,
            received: 0,
            pending: HashSet::new(),
            drift_resets: 0,
            stats: Statistics::new()?,
        })
    }

    fn all_sent(&self) -> bool {
        self.request_count != 0 && self.sent >= self.request_count
    }

    fn run<S: MetricsSink>(mut self, sink: &mut S) -> Result<RunSummary> {
        let started = Instant::now();
        let outcome = loop {
            let now = now_micros();
            if self.all_sent() {
                if self.pending.is_empty() {
                    break RunOutcome::Completed;
                }
                let deadline = self
                    .drain_us
                    .zip(self.gate.last())
                    .map(|(drain, last)| last.saturating_add(drain));
                if deadline.is_some_and(|deadline| now >= deadline) {
                    let abandoned = self.pending.len() as u64;
                    warn!(abandoned, "Drain period expired with probes unanswered");
                    break RunOutcome::Drained { abandoned };
                }
            }

            let timeout = self.timeout(now);
            let (readable, writable, woke) = self.wait(timeout)?;
            if writable {
                self.write_blocked = false;
            }
            if readable {
                self.receive_probes(sink, woke)?;
            }
            if !self.all_sent() && !self.write_blocked && self.gate.remaining(now_micros()).is_none() {
                self.send_probe()?;
            }
        };

        Ok(RunSummary {
            outcome,
            sent: self.sent,
            acked: self.received,
            lines: self.received,
            peak_outstanding: 0,
            drift_resets: self.drift_resets,
            bounds: self.bounds,
            elapsed: started.elapsed(),
            stats: self.stats,
        })
    }

    fn timeout(&self, now: u64) -> Option<Duration> {
        if self.all_sent() {
            return self
                .drain_us
                .zip(self.gate.last())
                .map(|(drain, last)| Duration::from_micros(last.saturating_add(drain).saturating_sub(now)));
        }
        if self.write_blocked {
            return None;
        }
        Some(Duration::from_micros(self.gate.remaining(now).unwrap_or(0)))
    }

    /// Returns readiness plus the time the wait returned, used as the
    /// receive stamp.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<(bool, bool, u64)> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let woke = now_micros();
        let (mut readable, mut writable) = (false, false);
        for event in self.events.iter() {
            readable |= event.is_readable() || event.is_error();
            writable |= event.is_writable();
        }
        Ok((readable, writable, woke))
    }

    fn send_probe(&mut self) -> Result<()> {
        let seq = self.sent + 1;
        let mut probe = Probe::new(seq, self.response_len);
        probe.request_write_start = now_micros();
        probe.encode_into(&mut self.send_buf);
        match self.socket.send(&self.send_buf) {
            Ok(_) => {
                self.sent = seq;
                self.pending.insert(seq);
                self.gate.mark(probe.request_write_start);
                debug!(seq, "Probe sent");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.write_blocked = true;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive_probes<S: MetricsSink>(&mut self, sink: &mut S, woke: u64) -> Result<()> {
        loop {
            let read_start = now_micros();
            let len = match self.socket.recv(&mut self.recv_buf) {
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let read_end = now_micros();

            let mut probe = match Probe::decode(&self.recv_buf[..len]) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed response datagram");
                    continue;
                }
            };
            if !self.pending.remove(&probe.seq) {
                warn!(seq = probe.seq, sent = self.sent, "Ignoring unexpected or duplicate probe");
                continue;
            }
            probe.response_rcvd = woke;
            probe.response_read_start = read_start;
            probe.response_read_end = read_end;
            self.received += 1;

            let update = self.bounds.update(
                probe.request_write_start,
                probe.request_read_end,
                probe.response_write_start,
                probe.response_read_end,
            );
            if update == OffsetUpdate::Drift {
                self.drift_resets += 1;
                warn!(
                    seq = probe.seq,
                    lower = self.bounds.lower(),
                    upper = self.bounds.upper(),
                    "Clock offset drifted, bounds reset"
                );
            }

            let line = probe_line(&probe, self.bounds);
            self.stats.record(line.round_trip())?;
            sink.record(&line).map_err(ProbeError::Io)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_line_mapping() {
        let probe = Probe {
            seq: 4,
            response_len: 88,
            request_write_start: 100,
            request_wait_start: 90,
            request_rcvd: 140,
            request_read_start: 141,
            request_read_end: 142,
            response_write_start: 150,
            response_rcvd: 190,
            response_read_start: 191,
            response_read_end: 192,
        };
        let mut bounds = OffsetBounds::unbounded();
        bounds.update(100, 142, 150, 192);
        let line = probe_line(&probe, bounds);
        assert_eq!(line.seq, 4);
        assert_eq!(line.request.write_end, 140);
        assert_eq!(line.response.write_end, 190);
        assert_eq!(line.round_trip(), 92);
        assert!(line.lower <= line.upper);
    }
}
