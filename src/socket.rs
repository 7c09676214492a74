//! Socket setup shared by clients and servers.
//!
//! Every transport option is applied before the first timestamped read or
//! write so that option changes never land inside a measurement.

use crate::error::{ProbeError, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsFd, AsRawFd};
use tracing::{debug, warn};

/// Pending connections the kernel queues for a listener
const LISTEN_BACKLOG: i32 = 8;

/// Whether the endpoint accepts peers or reaches out to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

/// Tri-state transport options: `None` leaves the kernel default alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub nodelay: Option<bool>,
    pub quickack: Option<bool>,
    pub priority: Option<bool>,
}

/// Resolves `host:port`, preferring an IPv4 address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let target = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ProbeError::Connect {
            addr: target.clone(),
            source,
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeError::Connect {
            addr: target,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        })
}

fn connect_error(addr: SocketAddr) -> impl FnOnce(io::Error) -> ProbeError {
    move |source| ProbeError::Connect {
        addr: addr.to_string(),
        source,
    }
}

/// Opens a TCP socket in the given role.
///
/// A listener is bound with `SO_REUSEADDR` and listening; a connector is
/// connected. Options are set right after the socket is created.
pub fn open_tcp(role: Role, addr: SocketAddr, options: &SocketOptions) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(connect_error(addr))?;
    apply_options(&socket, options, true)?;

    match role {
        Role::Listener => {
            socket
                .set_reuse_address(true)
                .map_err(connect_error(addr))?;
            socket.bind(&addr.into()).map_err(connect_error(addr))?;
            socket
                .listen(LISTEN_BACKLOG)
                .map_err(connect_error(addr))?;
            debug!(%addr, "TCP listener bound");
        }
        Role::Connector => {
            socket.connect(&addr.into()).map_err(connect_error(addr))?;
            debug!(%addr, "TCP connection established");
        }
    }
    Ok(socket)
}

pub fn listen_tcp(addr: SocketAddr, options: &SocketOptions) -> Result<TcpListener> {
    open_tcp(Role::Listener, addr, options).map(Into::into)
}

pub fn connect_tcp(addr: SocketAddr, options: &SocketOptions) -> Result<TcpStream> {
    open_tcp(Role::Connector, addr, options).map(Into::into)
}

/// Opens a UDP socket: a listener binds to `addr`, a connector binds an
/// ephemeral port and connects to `addr`.
pub fn open_udp(role: Role, addr: SocketAddr, options: &SocketOptions) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(connect_error(addr))?;
    apply_options(&socket, options, false)?;

    match role {
        Role::Listener => {
            socket
                .set_reuse_address(true)
                .map_err(connect_error(addr))?;
            socket.bind(&addr.into()).map_err(connect_error(addr))?;
            debug!(%addr, "UDP socket bound");
        }
        Role::Connector => {
            let local: IpAddr = if addr.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            let local = SocketAddr::new(local, 0);
            socket.bind(&local.into()).map_err(connect_error(addr))?;
            socket.connect(&addr.into()).map_err(connect_error(addr))?;
            debug!(%addr, "UDP socket connected");
        }
    }
    Ok(socket.into())
}

/// Applies the configured options. `stream` selects whether TCP-only
/// options are relevant.
pub fn apply_options<S: AsFd + AsRawFd>(
    socket: &S,
    options: &SocketOptions,
    stream: bool,
) -> io::Result<()> {
    if let Some(priority) = options.priority {
        set_priority(socket, priority)?;
        debug!(priority, "Set SO_PRIORITY");
    }
    if !stream {
        return Ok(());
    }
    if let Some(nodelay) = options.nodelay {
        SockRef::from(socket).set_nodelay(nodelay)?;
        debug!(nodelay, "Set TCP_NODELAY");
    }
    if let Some(quickack) = options.quickack {
        set_quickack(socket, quickack)?;
        debug!(quickack, "Set TCP_QUICKACK");
    }
    Ok(())
}

/// The kernel drops out of quick-ack mode on its own, so callers re-arm it
/// after each write.
pub fn rearm_quickack<S: AsFd>(socket: &S, options: &SocketOptions) {
    if let Some(quickack) = options.quickack {
        if let Err(e) = set_quickack(socket, quickack) {
            warn!(error = %e, "Failed to re-arm TCP_QUICKACK");
        }
    }
}

#[cfg(target_os = "linux")]
fn set_quickack<S: AsFd>(socket: &S, enabled: bool) -> io::Result<()> {
    SockRef::from(socket).set_quickack(enabled)
}

/// socket2 has no setter for `SO_PRIORITY`.
#[cfg(target_os = "linux")]
fn set_priority<S: AsRawFd>(socket: &S, enabled: bool) -> io::Result<()> {
    let value = enabled as libc::c_int;
    // SAFETY: the fd is valid for the lifetime of `socket` and the option
    // value is a plain int whose size we pass alongside it.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_quickack<S: AsFd>(_socket: &S, _enabled: bool) -> io::Result<()> {
    warn!("TCP_QUICKACK is not supported on this platform, ignoring");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_priority<S: AsRawFd>(_socket: &S, _enabled: bool) -> io::Result<()> {
    warn!("SO_PRIORITY is not supported on this platform, ignoring");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("localhost", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_failure_is_connect_error() {
        let err = resolve("no such host.invalid", 1).unwrap_err();
        assert!(matches!(err, ProbeError::Connect { .. }));
    }

    #[test]
    fn test_listener_and_connector() -> Result<()> {
        let options = SocketOptions {
            nodelay: Some(true),
            ..SocketOptions::default()
        };
        let listener = listen_tcp(resolve("127.0.0.1", 0)?, &options)?;
        let addr = listener.local_addr()?;

        let mut client = connect_tcp(addr, &options)?;
        let (mut server, _) = listener.accept()?;
        assert!(SockRef::from(&client).nodelay()?);

        client.write_all(b"ping")?;
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ping");
        Ok(())
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = resolve("127.0.0.1", port).unwrap();
        assert!(matches!(
            connect_tcp(addr, &SocketOptions::default()),
            Err(ProbeError::Connect { .. })
        ));
    }

    #[test]
    fn test_udp_pair() -> Result<()> {
        let server = open_udp(
            Role::Listener,
            resolve("127.0.0.1", 0)?,
            &SocketOptions::default(),
        )?;
        let client = open_udp(
            Role::Connector,
            server.local_addr()?,
            &SocketOptions::default(),
        )?;
        client.send(b"hello")?;
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, client.local_addr()?);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_quickack_and_priority() -> Result<()> {
        let options = SocketOptions {
            nodelay: Some(true),
            quickack: Some(true),
            priority: Some(true),
        };
        let listener = listen_tcp(resolve("127.0.0.1", 0)?, &SocketOptions::default())?;
        let client = connect_tcp(listener.local_addr()?, &options)?;
        assert!(SockRef::from(&client).quickack()?);
        rearm_quickack(&client, &options);
        assert!(SockRef::from(&client).quickack()?);
        Ok(())
    }
}
