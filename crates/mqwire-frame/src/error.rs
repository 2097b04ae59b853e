/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header carries an unknown frame type octet.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// The frame did not end with the frame-end octet.
    #[error("bad frame end octet 0x{0:02x} (expected 0xce)")]
    BadFrameEnd(u8),

    /// The frame payload exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A heartbeat frame carried a non-zero channel or a payload.
    #[error("malformed heartbeat frame (channel {channel}, {len} payload bytes)")]
    BadHeartbeat { channel: u16, len: usize },

    /// A method or content payload could not be decoded.
    #[error("malformed {context}")]
    Malformed { context: &'static str },

    /// The payload names a method this client does not know.
    #[error("unknown method (class {class}, method {method})")]
    UnknownMethod { class: u16, method: u16 },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
