//! Wire framing and method codec for the mqwire protocol.
//!
//! This is the mechanical layer: every unit of wire data is a frame with
//! - a 1-byte frame type (method, content header, content body, heartbeat)
//! - a 2-byte big-endian channel number for multiplexing
//! - a 4-byte big-endian payload length
//! - the payload, then a fixed end octet for stream-synchronization checks
//!
//! Method arguments and content headers have their own payload codecs in
//! [`method`] and [`content`]. No partial reads, no buffer management in
//! user code.

mod args;
pub mod codec;
pub mod content;
pub mod error;
pub mod method;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameType, CONTROL_CHANNEL,
    DEFAULT_MAX_FRAME, FRAME_END, FRAME_OVERHEAD, HEADER_SIZE, MIN_MAX_FRAME,
    PROTOCOL_PREAMBLE,
};
pub use content::{ContentHeader, Properties};
pub use error::{FrameError, Result};
pub use method::{Method, CLASS_BASIC, CLASS_CHANNEL, CLASS_CONNECTION, REPLY_INTERNAL_ERROR, REPLY_SUCCESS};
pub use reader::FrameReader;
pub use writer::FrameWriter;
