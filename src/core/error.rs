//! Error types for the transport and link layers.

use thiserror::Error;

/// Errors that can occur when transmitting a frame or a beacon.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// The supplied frame is too large to transmit on this link.
    #[error("frame too large for this link")]
    TooLarge,

    /// There was an error transmitting the frame.
    #[error("link transmit failure")]
    Failed,
}

/// Errors that can occur when receiving a frame.
///
/// "Nothing ready" is not an error: [`Link::receive`](crate::link::Link::receive)
/// reports it as `Ok(None)`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    /// There was an error receiving the frame.
    #[error("link receive failure")]
    Failed,
}

/// Errors that can occur when sending a payload through the transport.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The deadline expired before the peer acknowledged every fragment.
    #[error("send timed out before all fragments were acknowledged")]
    Timeout,

    /// The payload cannot be represented on this link: either the link
    /// payload is too small, or a sub-frame would need more sequence ids
    /// than the wire format can carry.
    #[error("payload too large for this link")]
    TooLarge,

    /// The payload could not be serialized. The transport itself never
    /// produces this; it is reserved for callers composing structured
    /// messages above the transport.
    #[error("payload could not be serialized")]
    InvalidFrame,

    /// Unrecoverable link transmit failure.
    #[error("transmit failed: {0}")]
    Transmit(#[from] TransmitError),

    /// Unrecoverable link receive failure.
    #[error("receive failed: {0}")]
    Receive(#[from] ReceiveError),
}
