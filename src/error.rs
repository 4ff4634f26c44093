//! Error kinds shared across the fabric.

use thiserror::Error;

/// Errors raised while decoding a packet from its wire representation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet truncated: need {needed} bytes, have {have}")]
    TruncatedPacket { needed: usize, have: usize },
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),
    #[error("invalid length field: {0}")]
    InvalidLength(usize),
}

/// Top-level error type for the fabric core.
#[derive(Debug, Error)]
pub enum CxlError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid opcode {0:#06x} on CCI channel")]
    InvalidOpcode(u16),

    #[error("invalid LD id {0}")]
    InvalidLdId(u8),

    #[error("vPPB index {index} out of range (counts = {counts})")]
    VppbOutOfRange { index: usize, counts: usize },

    #[error("physical port {port} is not of the required type")]
    PortTypeMismatch { port: usize },

    #[error("vPPB {0} is already bound")]
    AlreadyBound(usize),

    #[error("physical port {0} is already bound to another vPPB")]
    PortAlreadyBound(usize),

    #[error("vPPB {0} is not bound")]
    NotBound(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CxlError>;
