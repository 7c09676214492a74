//! Skewprobe - pipelined request/response latency measurement
//!
//! Paired clients and servers exchange fixed-size messages over TCP or UDP
//! and report per-request timestamps together with bounds on the clock
//! offset between the two hosts, so one-way latencies can be derived.
//! A multi-worker traffic generator produces background load from a
//! request template.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod socket;

pub use error::{ProbeError, Result};
