use std::time::Duration;

use crate::shutdown::ShutdownCause;

/// Errors that can occur in client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mqwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] mqwire_frame::FrameError),

    /// The peer rejected connection negotiation.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// No free channel numbers, or the peer refused the channel.
    #[error("channel allocation failed: {0}")]
    ChannelAllocation(String),

    /// A synchronous call exceeded its wait bound. The request may still
    /// have reached the peer; it is not retried.
    #[error("rpc timed out after {0:?}")]
    RpcTimeout(Duration),

    /// The peer violated framing or content rules. Always escalated to
    /// connection scope.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection or channel is shut down; carries the original cause.
    #[error("shut down: {0}")]
    ShutDown(ShutdownCause),
}

pub type Result<T> = std::result::Result<T, Error>;
