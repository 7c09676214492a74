//! Wire protocol for skewprobe

pub mod buffer;
pub mod datagram;
pub mod error;
pub mod message;

pub use buffer::{Progress, TransferBuffer};
pub use datagram::{Probe, MAX_UDP_PAYLOAD, PROBE_SIZE};
pub use error::{ProtocolError, Result as ProtocolResult};
pub use message::{
    decode_setup_ack, encode_setup_ack, Piggyback, RequestHeader, ResponseHeader, SetupHeader,
    MAX_CONCURRENCY, MAX_MESSAGE_SIZE, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE, SETUP_ACK_SIZE,
    SETUP_SIZE,
};
