use crate::client::session::SessionLimits;
use crate::config::{LogArgs, PriorityArgs, SocketArgs};
use crate::error::{ProbeError, Result};
use crate::protocol::{
    MAX_CONCURRENCY, MAX_MESSAGE_SIZE, MAX_UDP_PAYLOAD, PROBE_SIZE, REQUEST_HEADER_SIZE,
    RESPONSE_HEADER_SIZE,
};
use crate::socket::SocketOptions;
use clap::Parser;
use tracing::debug;

/// Runtime parameters handed to a client pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub request_size: usize,
    pub response_size: usize,
    pub limits: SessionLimits,
    /// How long to wait for stragglers after the last send, in microseconds
    pub drain_us: Option<u64>,
    /// Block on a line from stdin before the first request
    pub wait_for_input: bool,
    pub socket: SocketOptions,
    /// Print the coloured summary at the end of the run
    pub summary: bool,
}

fn check_size(name: &str, size: usize, min: usize, max: usize) -> Result<()> {
    if !(min..=max).contains(&size) {
        return Err(ProbeError::Config(format!(
            "{} ({}) must be between {} and {}",
            name, size, min, max
        )));
    }
    Ok(())
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tcp-client")]
#[command(about = "Pipelined TCP latency client with clock offset estimation")]
pub struct TcpClientConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Request size in bytes
    pub request_size: usize,

    /// Response size in bytes
    pub response_size: usize,

    /// Minimum delay between consecutive requests in microseconds
    #[arg(short = 'd', long, default_value_t = 0)]
    pub delay: u64,

    /// Number of requests to send (0 = no limit)
    #[arg(short = 'r', long, default_value_t = 0)]
    pub requests: u64,

    /// Requests allowed in flight at the same time
    #[arg(short = 's', long, default_value_t = 1)]
    pub concurrency: u64,

    /// Microseconds to wait for outstanding responses after the last request
    #[arg(short = 'c', long)]
    pub drain: Option<u64>,

    /// Wait for input on stdin after connecting, before sending requests
    #[arg(short = 'w', long)]
    pub wait: bool,

    #[command(flatten)]
    pub socket: SocketArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl TcpClientConfig {
    /// Validates the configuration values
    pub fn validate(&self) -> Result<()> {
        debug!("Validating client configuration");
        self.log.validate()?;
        check_size("REQUEST_SIZE", self.request_size, REQUEST_HEADER_SIZE, MAX_MESSAGE_SIZE)?;
        check_size("RESPONSE_SIZE", self.response_size, RESPONSE_HEADER_SIZE, MAX_MESSAGE_SIZE)?;
        if self.concurrency == 0 {
            return Err(ProbeError::Config("concurrency must be > 0".into()));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(ProbeError::Config(format!(
                "concurrency ({}) must be at most {}",
                self.concurrency, MAX_CONCURRENCY
            )));
        }
        debug!("Client configuration validated successfully");
        Ok(())
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            host: self.host.clone(),
            port: self.port,
            request_size: self.request_size,
            response_size: self.response_size,
            limits: SessionLimits {
                request_count: self.requests,
                concurrency: self.concurrency,
                delay_us: self.delay,
            },
            drain_us: self.drain,
            wait_for_input: self.wait,
            socket: self.socket.options(),
            summary: !self.log.quiet,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "udp-client")]
#[command(about = "UDP latency client with clock offset estimation")]
pub struct UdpClientConfig {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Request datagram size in bytes
    pub request_size: usize,

    /// Response datagram size in bytes
    pub response_size: usize,

    /// Minimum delay between consecutive requests in microseconds
    #[arg(short = 'd', long, default_value_t = 0)]
    pub delay: u64,

    /// Number of requests to send (0 = no limit)
    #[arg(short = 'r', long, default_value_t = 0)]
    pub requests: u64,

    /// Microseconds to wait for outstanding responses after the last request
    #[arg(short = 'c', long)]
    pub drain: Option<u64>,

    /// Wait for input on stdin before sending requests
    #[arg(short = 'w', long)]
    pub wait: bool,

    #[command(flatten)]
    pub socket: PriorityArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl UdpClientConfig {
    /// Validates the configuration values
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        check_size("REQUEST_SIZE", self.request_size, PROBE_SIZE, MAX_UDP_PAYLOAD)?;
        check_size("RESPONSE_SIZE", self.response_size, PROBE_SIZE, MAX_UDP_PAYLOAD)
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            host: self.host.clone(),
            port: self.port,
            request_size: self.request_size,
            response_size: self.response_size,
            limits: SessionLimits {
                request_count: self.requests,
                // Datagrams are independent; only the delay gate applies.
                concurrency: u64::MAX,
                delay_us: self.delay,
            },
            drain_us: self.drain,
            wait_for_input: self.wait,
            socket: self.socket.options(),
            summary: !self.log.quiet,
        }
    }
}
