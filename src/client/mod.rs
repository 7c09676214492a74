//! Latency clients

pub mod config;
pub mod constants;
pub mod reporter;
pub mod session;
pub mod slots;
pub mod statistics;
pub mod tcp;
pub mod udp;

pub use config::{ClientSettings, TcpClientConfig, UdpClientConfig};
pub use constants::*;
pub use reporter::{Reporter, RunOutcome, RunSummary};
pub use session::{Admission, ClientSession, DelayGate, SessionLimits};
pub use slots::{Leg, SlotRing};
pub use statistics::Statistics;
pub use tcp::run_tcp_client;
pub use udp::run_udp_client;
