//! Latency servers

pub mod config;
pub mod monitor;
pub mod session;
pub mod tcp;
pub mod udp;

pub use config::{ServerSettings, TcpServerConfig, UdpServerConfig};
pub use monitor::{ServerCounters, ServerMonitor, ServerStats};
pub use session::ServerSession;
pub use tcp::TcpServer;
pub use udp::UdpServer;
