use thiserror::Error;

use crate::packet::SendOption;

/// All errors produced by the TetherStream engines.
#[derive(Debug, Error)]
pub enum TetherStreamError {
    #[error("malformed packet: expected at least {expected} bytes, got {actual}")]
    MalformedPacket { expected: usize, actual: usize },

    #[error("unknown send option: 0x{0:02x}")]
    UnknownSendOption(u8),

    #[error("invalid sequence number {0} (must be below 255)")]
    InvalidSequence(u8),

    #[error("invalid fragment {index}/{total} for message {message_id}")]
    InvalidFragment {
        message_id: u16,
        index: u16,
        total: u16,
    },

    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("reliable id {0} is still awaiting acknowledgement")]
    ReliableWindowFull(u16),

    #[error("unexpected packet: {0:?}")]
    UnexpectedPacket(SendOption),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("connection is not connected")]
    NotConnected,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TetherStreamError>;
