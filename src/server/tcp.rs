//! Pipelined TCP server.
//!
//! Every accepted connection runs on its own thread with its own mio loop,
//! so a misbehaving client only ever takes down its own connection. A
//! reaper thread joins finished handlers without involving the accept loop.

use crate::clock::now_micros;
use crate::error::{ProbeError, Result};
use crate::protocol::{
    encode_setup_ack, Progress, RequestHeader, SetupHeader, TransferBuffer, SETUP_SIZE,
};
use crate::server::config::ServerSettings;
use crate::server::monitor::ServerCounters;
use crate::server::session::ServerSession;
use crate::socket::{apply_options, listen_tcp, rearm_quickack, resolve, SocketOptions};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STREAM: Token = Token(0);

pub struct TcpServer {
    listener: TcpListener,
    options: SocketOptions,
    counters: ServerCounters,
}

impl TcpServer {
    pub fn bind(settings: &ServerSettings, counters: ServerCounters) -> Result<Self> {
        let addr = resolve(&settings.bind, settings.port)?;
        let listener = listen_tcp(addr, &settings.socket)?;
        info!(address = %listener.local_addr()?, "TCP server listening");
        Ok(Self {
            listener,
            options: settings.socket,
            counters,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, one handler thread per connection.
    pub fn serve(self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reaper_counters = self.counters.clone();
        thread::Builder::new()
            .name("reaper".into())
            .spawn(move || reap(rx, reaper_counters))?;

        let mut next_id = 0u64;
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.counters.increment_errors();
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            self.counters.increment_connections();
            info!(connection = id, %peer, "Client connected");

            let options = self.options;
            let counters = self.counters.clone();
            let guard = FinishGuard { id, tx: tx.clone() };
            let spawned = thread::Builder::new()
                .name(format!("conn-{}", id))
                .spawn(move || {
                    let _guard = guard;
                    run_connection(id, stream, options, &counters);
                });
            match spawned {
                Ok(handle) => {
                    // The reaper outlives the accept loop; a send only fails
                    // if it panicked, in which case the handle just detaches.
                    let _ = tx.send(ReaperEvent::Spawned(id, handle));
                }
                Err(e) => {
                    self.counters.increment_errors();
                    error!(connection = id, error = %e, "Failed to spawn connection handler");
                }
            }
        }
    }
}

enum ReaperEvent {
    Spawned(u64, JoinHandle<()>),
    Finished(u64),
}

/// Reports the handler's end to the reaper, including on panic.
struct FinishGuard {
    id: u64,
    tx: Sender<ReaperEvent>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(ReaperEvent::Finished(self.id));
    }
}

/// Joins handler threads as they finish. Either event may arrive first.
fn reap(rx: Receiver<ReaperEvent>, counters: ServerCounters) {
    let mut running: HashMap<u64, JoinHandle<()>> = HashMap::new();
    let mut finished: HashSet<u64> = HashSet::new();

    let join = |id: u64, handle: JoinHandle<()>| {
        if handle.join().is_err() {
            counters.increment_errors();
            error!(connection = id, "Connection handler panicked");
        } else {
            debug!(connection = id, "Connection handler reaped");
        }
    };

    for event in rx {
        match event {
            ReaperEvent::Spawned(id, handle) => {
                if finished.remove(&id) {
                    join(id, handle);
                } else {
                    running.insert(id, handle);
                }
            }
            ReaperEvent::Finished(id) => match running.remove(&id) {
                Some(handle) => join(id, handle),
                None => {
                    finished.insert(id);
                }
            },
        }
    }
}

fn run_connection(id: u64, stream: std::net::TcpStream, options: SocketOptions, counters: &ServerCounters) {
    match handle_connection(stream, options, counters) {
        Ok(()) => info!(connection = id, "Connection closed"),
        Err(ProbeError::Protocol(e)) => {
            counters.increment_errors();
            warn!(connection = id, error = %e, "Protocol error, dropping connection");
        }
        Err(e) => {
            counters.increment_errors();
            error!(connection = id, error = %e, "Connection failed");
        }
    }
}

/// Serves one connection: setup exchange, then the response pipeline.
pub fn handle_connection(
    mut stream: std::net::TcpStream,
    options: SocketOptions,
    counters: &ServerCounters,
) -> Result<()> {
    apply_options(&stream, &options, true)?;
    let setup = match read_setup(&mut stream) {
        Err(ProbeError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
            debug!("Client disconnected before setup");
            return Ok(());
        }
        other => other?,
    };
    stream.set_nonblocking(true)?;
    ServerPipeline::new(TcpStream::from_std(stream), setup, options, counters)?.run()
}

fn read_setup(stream: &mut std::net::TcpStream) -> Result<SetupHeader> {
    let mut buf = [0u8; SETUP_SIZE];
    stream.read_exact(&mut buf)?;
    let read_end = now_micros();
    let setup = SetupHeader::decode(&buf)?;
    setup.validate()?;
    stream.write_all(&encode_setup_ack(read_end))?;
    info!(
        requests = setup.request_count,
        request_size = setup.request_size,
        response_size = setup.response_size,
        concurrency = setup.concurrency,
        "Setup received"
    );
    Ok(setup)
}

struct ServerPipeline<'a> {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    interest: Option<Interest>,
    options: SocketOptions,
    counters: &'a ServerCounters,
    session: ServerSession,
    request: TransferBuffer,
    response: TransferBuffer,
    write_blocked: bool,
    request_started: u64,
}

impl<'a> ServerPipeline<'a> {
    fn new(
        stream: TcpStream,
        setup: SetupHeader,
        options: SocketOptions,
        counters: &'a ServerCounters,
    ) -> Result<Self> {
        Ok(Self {
            stream,
            poll: Poll::new()?,
            events: Events::with_capacity(16),
            interest: None,
            options,
            counters,
            request: TransferBuffer::new(setup.request_size as usize),
            response: TransferBuffer::new(setup.response_size as usize),
            session: ServerSession::new(setup, now_micros()),
            write_blocked: false,
            request_started: 0,
        })
    }

    fn run(mut self) -> Result<()> {
        loop {
            if self.session.is_done() {
                debug!(answered = self.session.answered(), "Run complete");
                return Ok(());
            }
            if !self.update_interest()? {
                return Ok(());
            }

            let can_write = self.session.has_output() && !self.write_blocked;
            let timeout = can_write.then_some(Duration::ZERO);
            let (readable, writable) = self.wait(timeout)?;
            if writable {
                self.write_blocked = false;
            }
            if readable && self.read_requests()? {
                debug!(received = self.session.received(), "Client closed the connection");
                return Ok(());
            }
            if self.session.has_output() && !self.write_blocked {
                self.write_response()?;
            }
        }
    }

    /// Registers for what the session currently needs. Returns false when
    /// it needs nothing more.
    fn update_interest(&mut self) -> io::Result<bool> {
        let read = self.session.wants_read().then_some(Interest::READABLE);
        let write = self.session.has_output().then_some(Interest::WRITABLE);
        let interest = match (read, write) {
            (Some(r), Some(w)) => r | w,
            (Some(i), None) | (None, Some(i)) => i,
            (None, None) => return Ok(false),
        };
        match self.interest {
            Some(current) if current == interest => {}
            Some(_) => self
                .poll
                .registry()
                .reregister(&mut self.stream, STREAM, interest)?,
            None => self
                .poll
                .registry()
                .register(&mut self.stream, STREAM, interest)?,
        }
        self.interest = Some(interest);
        Ok(true)
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

    /// Reads until the socket would block or no more requests are expected.
    /// Returns true when the client closed the stream.
    fn read_requests(&mut self) -> Result<bool> {
        while self.session.wants_read() {
            let was_idle = self.request.is_idle();
            let read_start = now_micros();
            match self.request.read_from(&mut self.stream)? {
                Progress::Complete => {
                    let read_end = now_micros();
                    let read_start = if was_idle {
                        read_start
                    } else {
                        self.request_started
                    };
                    let header = RequestHeader::decode(self.request.message())?;
                    self.session.accept_request(header, read_start, read_end)?;
                    self.counters.increment_requests();
                }
                Progress::Partial => {
                    if was_idle {
                        self.request_started = read_start;
                    }
                }
                Progress::Blocked => return Ok(false),
                Progress::Closed => return Ok(true),
            }
        }
        Ok(false)
    }

    fn write_response(&mut self) -> Result<()> {
        if !self.session.is_writing() {
            match self.session.start_response(now_micros()) {
                Some(header) => header.encode_into(self.response.message_mut()),
                None => return Ok(()),
            }
        }
        match self.response.write_to(&mut self.stream)? {
            Progress::Complete => {
                self.session.finish_response(now_micros());
                self.counters.increment_responses();
                rearm_quickack(&self.stream, &self.options);
            }
            Progress::Partial => rearm_quickack(&self.stream, &self.options),
            Progress::Blocked => self.write_blocked = true,
            Progress::Closed => return Err(io::Error::from(ErrorKind::WriteZero).into()),
        }
        Ok(())
    }
}
