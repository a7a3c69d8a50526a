//! Custom error types for [crate::p2p]

use std::time::Duration;

use super::PeerId;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("framing error: {0}")]
    Framing(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}
pub type TransportResult<Success> = Result<Success, TransportError>;
