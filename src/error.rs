//! Error types for the event bus.

use crate::types::EventId;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable write failed; the event was not published.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid category: {0}")]
    InvalidCategory(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A damaged record with more data after it. Replay cannot continue.
    #[error("Corrupt log record at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("Out of order event id {got} after {previous} at offset {offset}")]
    OutOfOrder {
        offset: u64,
        previous: EventId,
        got: EventId,
    },

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Event log is locked by another process")]
    Locked,

    #[error("Event bus is shut down")]
    ShutDown,
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BusError::Deserialization(e.to_string())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
