//! Server configuration module
//!
//! CLI argument parsing and validation for the TCP and UDP servers.

use crate::config::{LogArgs, PriorityArgs, SocketArgs};
use crate::error::{ProbeError, Result};
use crate::protocol::{MAX_UDP_PAYLOAD, PROBE_SIZE};
use crate::socket::SocketOptions;
use clap::Parser;
use std::time::Duration;
use tracing::debug;

/// Default largest UDP response a server will send
pub const DEFAULT_MAX_PACKET: usize = 1024;

/// Runtime parameters handed to a server loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub socket: SocketOptions,
    /// Largest datagram the UDP server sends back
    pub max_packet: usize,
    pub status_interval: Option<Duration>,
}

impl ServerSettings {
    /// Settings for a server bound to `bind:port` with kernel-default options.
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            socket: SocketOptions::default(),
            max_packet: DEFAULT_MAX_PACKET,
            status_interval: None,
        }
    }
}

fn validate_common(port: u16, status_interval: Option<u64>, log: &LogArgs) -> Result<()> {
    log.validate()?;
    if port == 0 {
        return Err(ProbeError::Config("port must be > 0".into()));
    }
    if status_interval == Some(0) {
        return Err(ProbeError::Config("status interval must be > 0".into()));
    }
    Ok(())
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tcp-server")]
#[command(about = "Pipelined TCP latency server")]
pub struct TcpServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Redraw a status line on stderr every this many milliseconds
    #[arg(long)]
    pub status_interval: Option<u64>,

    #[command(flatten)]
    pub socket: SocketArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl TcpServerConfig {
    /// Validates the configuration values
    pub fn validate(&self) -> Result<()> {
        debug!("Validating server configuration");
        validate_common(self.port, self.status_interval, &self.log)
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            bind: self.bind.clone(),
            port: self.port,
            socket: self.socket.options(),
            max_packet: DEFAULT_MAX_PACKET,
            status_interval: self.status_interval.map(Duration::from_millis),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "udp-server")]
#[command(about = "UDP latency probe reflector")]
pub struct UdpServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Largest response datagram in bytes
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_PACKET)]
    pub max_packet: usize,

    /// Redraw a status line on stderr every this many milliseconds
    #[arg(long)]
    pub status_interval: Option<u64>,

    #[command(flatten)]
    pub socket: PriorityArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl UdpServerConfig {
    /// Validates the configuration values
    pub fn validate(&self) -> Result<()> {
        validate_common(self.port, self.status_interval, &self.log)?;
        if !(PROBE_SIZE..=MAX_UDP_PAYLOAD).contains(&self.max_packet) {
            return Err(ProbeError::Config(format!(
                "max packet ({}) must be between {} and {}",
                self.max_packet, PROBE_SIZE, MAX_UDP_PAYLOAD
            )));
        }
        Ok(())
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            bind: self.bind.clone(),
            port: self.port,
            socket: self.socket.options(),
            max_packet: self.max_packet,
            status_interval: self.status_interval.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_defaults() {
        let config = TcpServerConfig::try_parse_from(["tcp-server", "9000"]).unwrap();
        assert!(config.validate().is_ok());
        let settings = config.settings();
        assert_eq!(settings.bind, "0.0.0.0");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.socket, SocketOptions::default());
        assert_eq!(settings.status_interval, None);
    }

    #[test]
    fn test_tcp_options() {
        let config = TcpServerConfig::try_parse_from([
            "tcp-server",
            "9000",
            "-a",
            "-P",
            "--status-interval",
            "250",
            "--bind",
            "127.0.0.1",
        ])
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.socket.quickack, Some(true));
        assert_eq!(settings.socket.priority, Some(false));
        assert_eq!(settings.status_interval, Some(Duration::from_millis(250)));
        assert_eq!(settings.bind, "127.0.0.1");
    }

    #[test]
    fn test_invalid_port() {
        let config = TcpServerConfig::try_parse_from(["tcp-server", "0"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_udp_max_packet() {
        let config = UdpServerConfig::try_parse_from(["udp-server", "9000"]).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.settings().max_packet, DEFAULT_MAX_PACKET);

        let config = UdpServerConfig::try_parse_from(["udp-server", "9000", "-m", "64"]).unwrap();
        assert!(config.validate().is_err());

        let config =
            UdpServerConfig::try_parse_from(["udp-server", "9000", "-m", "70000"]).unwrap();
        assert!(config.validate().is_err());
    }
}
