use thiserror::Error;

/// Protocol-level errors for message encoding/decoding and slot bookkeeping
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message size: expected at least {expected}, got {actual}")]
    InvalidMessageSize { expected: usize, actual: usize },

    #[error("Slot index {index} is out of range (ring holds {capacity} slots)")]
    SlotOutOfRange { index: u64, capacity: usize },

    #[error("Slot {index} contains seq {stored} (received {claimed})")]
    SlotMismatch { index: u64, stored: u64, claimed: u64 },

    #[error("Response for seq {seq} was already received")]
    DuplicateResponse { seq: u64 },

    #[error("Completion reported for seq {seq} before its response")]
    CompletedBeforeResponse { seq: u64 },

    #[error("More than {concurrency} requests are awaiting a response")]
    QueueOverflow { concurrency: u64 },

    #[error("Invalid setup: {0}")]
    InvalidSetup(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
