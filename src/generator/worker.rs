//! One load-generating connection.
//!
//! Each worker owns a TCP connection and a [`WorkerStats`] cell. Workers
//! share the configured delay: with `N` workers each one waits `N * delay`
//! between its own requests, and worker `i` starts `i * delay` after the
//! first, so the combined stream is evenly spaced.

use crate::clock::now_micros;
use crate::client::DelayGate;
use crate::error::Result;
use crate::generator::config::GeneratorSettings;
use crate::generator::monitor::WorkerStats;
use crate::socket::{connect_tcp, resolve, SocketOptions};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const STREAM: Token = Token(0);

const READ_CHUNK: usize = 16 * 1024;

/// How a worker's connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every request was sent and the linger period elapsed
    Finished,
    /// The server closed the connection first
    PeerClosed,
}

/// Requests worker `id` sends out of `total`, spread as evenly as possible.
pub fn share_of(total: Option<u64>, workers: usize, id: usize) -> u64 {
    let Some(total) = total else {
        return u64::MAX;
    };
    let workers = workers as u64;
    let id = id as u64;
    total / workers + u64::from(total % workers > id)
}

pub fn run_worker(id: usize, settings: &GeneratorSettings, stats: Arc<WorkerStats>) -> Result<WorkerOutcome> {
    let addr = resolve(&settings.host, settings.port)?;
    let options = SocketOptions {
        nodelay: Some(true),
        ..SocketOptions::default()
    };
    let stream = connect_tcp(addr, &options)?;
    stream.set_nonblocking(true)?;
    debug!(worker = id, %addr, "Worker connected");

    let outcome = Worker::new(id, settings, stats, TcpStream::from_std(stream))?.run()?;
    info!(worker = id, ?outcome, "Worker done");
    Ok(outcome)
}

struct Worker<'a> {
    id: u64,
    settings: &'a GeneratorSettings,
    stats: Arc<WorkerStats>,
    stream: TcpStream,
    poll: Poll,
    events: Events,
    interest: Interest,
    gate: DelayGate,
    target: u64,
    sent: u64,
    /// Request being written and how much of it has gone out
    out: Vec<u8>,
    written: usize,
    write_blocked: bool,
    read_buf: Vec<u8>,
}

impl<'a> Worker<'a> {
    fn new(
        id: usize,
        settings: &'a GeneratorSettings,
        stats: Arc<WorkerStats>,
        mut stream: TcpStream,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let interest = Interest::READABLE;
        poll.registry().register(&mut stream, STREAM, interest)?;

        let workers = settings.workers.max(1) as u64;
        let interval = settings.delay_us.saturating_mul(workers);
        let mut gate = DelayGate::new(interval);
        // Pretend the previous send happened so that the first one lands
        // `id * delay` from now.
        let first_send = now_micros().saturating_add(settings.delay_us.saturating_mul(id as u64));
        gate.mark(first_send.saturating_sub(interval));

        Ok(Self {
            id: id as u64,
            settings,
            stats,
            stream,
            poll,
            events: Events::with_capacity(16),
            interest,
            gate,
            target: share_of(settings.requests, settings.workers.max(1), id),
            sent: 0,
            out: Vec::new(),
            written: 0,
            write_blocked: false,
            read_buf: vec![0u8; READ_CHUNK],
        })
    }

    fn run(mut self) -> Result<WorkerOutcome> {
        while self.sent < self.target || !self.out.is_empty() {
            let now = now_micros();
            let ready = !self.out.is_empty() || self.gate.remaining(now).is_none();
            self.set_writable_interest(ready)?;

            let timeout = if ready {
                (!self.write_blocked).then_some(Duration::ZERO)
            } else {
                self.gate.remaining(now).map(Duration::from_micros)
            };
            let (readable, writable) = self.wait(timeout)?;
            if writable {
                self.write_blocked = false;
            }
            if readable && self.read_available()? {
                return Ok(WorkerOutcome::PeerClosed);
            }
            let ready = !self.out.is_empty() || self.gate.remaining(now_micros()).is_none();
            if ready && !self.write_blocked && self.write_request()? {
                return Ok(WorkerOutcome::PeerClosed);
            }
        }
        self.linger()
    }

    /// Keeps reading stragglers until the linger period after the last send
    /// has passed.
    fn linger(mut self) -> Result<WorkerOutcome> {
        self.set_writable_interest(false)?;
        let last = self.gate.last().unwrap_or_else(now_micros);
        let deadline = last.saturating_add(self.settings.linger_us);
        loop {
            let now = now_micros();
            if now >= deadline {
                return Ok(WorkerOutcome::Finished);
            }
            let (readable, _) = self.wait(Some(Duration::from_micros(deadline - now)))?;
            if readable && self.read_available()? {
                return Ok(WorkerOutcome::PeerClosed);
            }
        }
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
            readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            writable |= event.is_writable() || event.is_write_closed();
        }
        Ok((readable, writable))
    }

    /// Counts whatever the server has sent. Returns true once it closed.
    fn read_available(&mut self) -> io::Result<bool> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    info!(worker = self.id, "Connection closed by server");
                    return Ok(true);
                }
                Ok(n) => self.stats.add_response_bytes(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes (or resumes writing) the next request. Returns true if the
    /// connection can no longer be written to.
    fn write_request(&mut self) -> io::Result<bool> {
        if self.out.is_empty() {
            let workers = self.settings.workers as u64;
            let request_id = self.sent.saturating_mul(workers).saturating_add(self.id);
            self.settings
                .template
                .render_into(request_id, &self.settings.name, &mut self.out);
            self.written = 0;
        }
        match self.stream.write(&self.out[self.written..]) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                self.written += n;
                if self.written == self.out.len() {
                    self.out.clear();
                    self.sent += 1;
                    self.stats.add_request();
                    self.gate.mark(now_micros());
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => self.write_blocked = true,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        Ok(false)
    }
}
