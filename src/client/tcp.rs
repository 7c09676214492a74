//! Pipelined TCP client.
//!
//! After a blocking setup exchange the stream is switched to non-blocking
//! mode and driven by a single mio readiness loop: requests are written
//! whenever admission allows, responses are read as they arrive, and each
//! response's piggyback completes an earlier request.

use crate::client::config::ClientSettings;
use crate::client::reporter::{RunOutcome, RunSummary};
use crate::client::session::{Admission, ClientSession};
use crate::client::statistics::Statistics;
use crate::clock::{now_micros, OffsetBounds};
use crate::error::{ProbeError, Result};
use crate::metrics::{MetricsLine, MetricsSink};
use crate::protocol::{
    decode_setup_ack, Progress, ResponseHeader, SetupHeader, TransferBuffer, SETUP_ACK_SIZE,
};
use crate::socket::{connect_tcp, rearm_quickack, resolve, SocketOptions};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STREAM: Token = Token(0);

/// Connects, runs the configured number of requests and reports every
/// completed one to `sink`.
pub fn run_tcp_client<S: MetricsSink>(settings: &ClientSettings, sink: &mut S) -> Result<RunSummary> {
    let addr = resolve(&settings.host, settings.port)?;
    info!(
        %addr,
        request_size = settings.request_size,
        response_size = settings.response_size,
        requests = settings.limits.request_count,
        concurrency = settings.limits.concurrency,
        delay_us = settings.limits.delay_us,
        "Connecting"
    );
    let mut stream = connect_tcp(addr, &settings.socket)?;

    if settings.wait_for_input {
        wait_for_input()?;
    }

    let bounds = handshake(&mut stream, settings)?;
    stream.set_nonblocking(true)?;
    TcpPipeline::new(TcpStream::from_std(stream), settings, bounds)?.run(sink)
}

pub(crate) fn wait_for_input() -> Result<()> {
    info!("Waiting for a line on stdin before starting");
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(())
}

/// Sends the setup and reads the server's receipt timestamp, which gives
/// the first offset sample.
fn handshake(stream: &mut std::net::TcpStream, settings: &ClientSettings) -> Result<OffsetBounds> {
    let setup = SetupHeader {
        request_count: settings.limits.request_count,
        request_size: settings.request_size as u64,
        response_size: settings.response_size as u64,
        concurrency: settings.limits.concurrency,
    };
    setup.validate()?;

    let write_start = now_micros();
    stream.write_all(&setup.encode())?;
    let mut ack = [0u8; SETUP_ACK_SIZE];
    stream.read_exact(&mut ack)?;
    let read_end = now_micros();
    let server_time = decode_setup_ack(&ack)?;

    let mut bounds = OffsetBounds::unbounded();
    bounds.update(write_start, server_time, server_time, read_end);
    debug!(
        server_time,
        lower = bounds.lower(),
        upper = bounds.upper(),
        "Setup acknowledged"
    );
    Ok(bounds)
}

struct TcpPipeline<'a> {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    interest: Interest,
    options: &'a SocketOptions,
    drain_us: Option<u64>,
    session: ClientSession,
    request: TransferBuffer,
    response: TransferBuffer,
    /// Set when a write hit `WouldBlock`; cleared by the next writable event.
    write_blocked: bool,
    /// Read start of the response currently being assembled.
    response_started: u64,
    stats: Statistics,
    lines: u64,
}

impl<'a> TcpPipeline<'a> {
    fn new(mut stream: TcpStream, settings: &'a ClientSettings, bounds: OffsetBounds) -> Result<Self> {
        let poll = Poll::new()?;
        let interest = Interest::READABLE;
        poll.registry().register(&mut stream, STREAM, interest)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(16),
            interest,
            options: &settings.socket,
            drain_us: settings.drain_us,
            session: ClientSession::new(settings.limits, bounds),
            request: TransferBuffer::new(settings.request_size),
            response: TransferBuffer::new(settings.response_size),
            write_blocked: false,
            response_started: 0,
            stats: Statistics::new()?,
            lines: 0,
        })
    }

    fn run<S: MetricsSink>(mut self, sink: &mut S) -> Result<RunSummary> {
        let started = Instant::now();
        let outcome = loop {
            if self.session.is_finished() {
                break RunOutcome::Completed;
            }
            let now = now_micros();
            let deadline = self.drain_deadline();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let abandoned = self.session.unresolved() as u64;
                warn!(abandoned, "Drain period expired with requests unresolved");
                break RunOutcome::Drained { abandoned };
            }

            let admission = self.session.admission(now);
            let can_write = admission == Admission::Open && !self.write_blocked;
            self.set_writable_interest(admission == Admission::Open)?;

            let timeout = if can_write {
                Some(Duration::ZERO)
            } else {
                match admission {
                    Admission::Wait(us) => Some(Duration::from_micros(us)),
                    Admission::Open => None,
                    Admission::Closed => deadline.map(|d| Duration::from_micros(d - now)),
                }
            };

            let (readable, writable) = self.wait(timeout)?;
            if writable {
                self.write_blocked = false;
            }
            if readable {
                if let Some(outcome) = self.read_responses(sink)? {
                    break outcome;
                }
            }
            if self.session.admission(now_micros()) == Admission::Open && !self.write_blocked {
                self.write_request()?;
            }
        };

        if outcome == RunOutcome::PeerClosed && !self.session.is_finished() {
            info!(
                unresolved = self.session.unresolved(),
                "Server closed the connection"
            );
        }
        Ok(RunSummary {
            outcome,
            sent: self.session.sent(),
            acked: self.session.acked(),
            lines: self.lines,
            peak_outstanding: self.session.peak_outstanding(),
            drift_resets: self.session.drift_resets(),
            bounds: self.session.bounds(),
            elapsed: started.elapsed(),
            stats: self.stats,
        })
    }

    /// Absolute time after which stragglers are abandoned, once every
    /// request has gone out.
    fn drain_deadline(&self) -> Option<u64> {
        if !self.session.all_sent() {
            return None;
        }
        let drain = self.drain_us?;
        let last = self.session.last_send()?;
        Some(last.saturating_add(drain))
    }

    fn set_writable_interest(&mut self, writable: bool) -> io::Result<()> {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != self.interest {
            self.poll
                .registry()
                .reregister(&mut self.stream, STREAM, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<(bool, bool)> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let (mut readable, mut writable) = (false, false);
        for event in self.events.iter() {
            // Errors and hangups surface through the next read.
            readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            writable |= event.is_writable() || event.is_write_closed();
        }
        Ok((readable, writable))
    }

    fn write_request(&mut self) -> Result<()> {
        if self.request.is_idle() {
            if let Some(header) = self.session.begin_request(now_micros())? {
                header.encode_into(self.request.message_mut());
            }
        }
        match self.request.write_to(&mut self.stream)? {
            Progress::Complete => {
                self.session.finish_request(now_micros());
                rearm_quickack(&self.stream, self.options);
            }
            Progress::Partial => {
                self.session.request_progress(now_micros());
                rearm_quickack(&self.stream, self.options);
            }
            Progress::Blocked => self.write_blocked = true,
            Progress::Closed => return Err(io::Error::from(ErrorKind::WriteZero).into()),
        }
        Ok(())
    }

    /// Reads until the socket would block. Returns an outcome when the peer
    /// closed the stream.
    fn read_responses<S: MetricsSink>(&mut self, sink: &mut S) -> Result<Option<RunOutcome>> {
        loop {
            let was_idle = self.response.is_idle();
            let read_start = now_micros();
            match self.response.read_from(&mut self.stream)? {
                Progress::Complete => {
                    let read_end = now_micros();
                    let read_start = if was_idle {
                        read_start
                    } else {
                        self.response_started
                    };
                    let header = ResponseHeader::decode(self.response.message())?;
                    if let Some(line) = self.session.accept_response(&header, read_start, read_end)? {
                        self.emit(sink, &line)?;
                    }
                    if self.session.is_finished() {
                        return Ok(None);
                    }
                }
                Progress::Partial => {
                    if was_idle {
                        self.response_started = read_start;
                    }
                }
                Progress::Blocked => return Ok(None),
                Progress::Closed => return Ok(Some(RunOutcome::PeerClosed)),
            }
        }
    }

    fn emit<S: MetricsSink>(&mut self, sink: &mut S, line: &MetricsLine) -> Result<()> {
        self.stats.record(line.round_trip())?;
        self.lines += 1;
        sink.record(line).map_err(ProbeError::Io)
    }
}
