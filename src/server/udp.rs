//! UDP probe reflector.
//!
//! Stateless across datagrams: each probe is stamped and sent straight back
//! to whoever sent it.

use crate::clock::now_micros;
use crate::error::Result;
use crate::protocol::{Probe, PROBE_SIZE};
use crate::server::config::ServerSettings;
use crate::server::monitor::ServerCounters;
use crate::socket::{open_udp, resolve, Role};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

const SOCKET: Token = Token(0);

/// Largest datagram we can receive
pub const MAX_DATAGRAM: usize = 65_536;

pub struct UdpServer {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    max_packet: usize,
    buf: Vec<u8>,
    counters: ServerCounters,
}

impl UdpServer {
    pub fn bind(settings: &ServerSettings, counters: ServerCounters) -> Result<Self> {
        let addr = resolve(&settings.bind, settings.port)?;
        let socket = open_udp(Role::Listener, addr, &settings.socket)?;
        socket.set_nonblocking(true)?;
        let mut socket = UdpSocket::from_std(socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;
        info!(
            address = %socket.local_addr()?,
            max_packet = settings.max_packet,
            "UDP server listening"
        );
        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(16),
            max_packet: settings.max_packet.clamp(PROBE_SIZE, MAX_DATAGRAM),
            buf: vec![0u8; MAX_DATAGRAM],
            counters,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answers probes forever.
    pub fn serve(mut self) -> Result<()> {
        loop {
            let wait_start = now_micros();
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            let rcvd = now_micros();
            self.drain(wait_start, rcvd);
        }
    }

    /// Handles every queued datagram. Per-datagram failures are logged and
    /// counted; none of them stop the server.
    fn drain(&mut self, wait_start: u64, rcvd: u64) {
        loop {
            let read_start = now_micros();
            let (len, peer) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.counters.increment_errors();
                    warn!(error = %e, "Receive failed");
                    continue;
                }
            };
            let read_end = now_micros();

            let mut probe = match Probe::decode(&self.buf[..len]) {
                Ok(probe) => probe,
                Err(e) => {
                    self.counters.increment_dropped();
                    warn!(%peer, len, error = %e, "Dropping undersized datagram");
                    continue;
                }
            };
            self.counters.increment_requests();
            probe.request_wait_start = wait_start;
            probe.request_rcvd = rcvd;
            probe.request_read_start = read_start;
            probe.request_read_end = read_end;
            if probe.clamp_response_len(self.max_packet) {
                debug!(seq = probe.seq, response_len = probe.response_len, "Clamped response length");
            }

            let response_len = probe.response_len as usize;
            if response_len > len {
                self.buf[len..response_len].fill(0);
            }
            probe.response_write_start = now_micros();
            probe.encode_into(&mut self.buf);

            match self.socket.send_to(&self.buf[..response_len], peer) {
                Ok(_) => {
                    self.counters.increment_responses();
                    debug!(seq = probe.seq, %peer, "Probe answered");
                }
                Err(e) => {
                    self.counters.increment_errors();
                    warn!(seq = probe.seq, %peer, error = %e, "Failed to send response");
                }
            }
        }
    }
}
