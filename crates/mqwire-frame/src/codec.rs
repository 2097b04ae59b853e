use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: type (1) + channel (2) + payload length (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Total per-frame overhead: header plus the trailing frame-end octet.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Every frame ends with this octet; anything else means the stream has
/// lost frame synchronization.
pub const FRAME_END: u8 = 0xCE;

/// Protocol preamble sent once, before any frame: "MQWP" NUL major minor.
pub const PROTOCOL_PREAMBLE: [u8; 7] = [b'M', b'Q', b'W', b'P', 0x00, 0x01, 0x00];

/// Default maximum frame size before tuning: 128 KiB.
pub const DEFAULT_MAX_FRAME: usize = 128 * 1024;

/// Smallest maximum frame size a peer may negotiate down to.
///
/// Every method the client sends must fit in one frame, so the floor has to
/// accommodate the longest method with full-length short strings.
pub const MIN_MAX_FRAME: usize = 4096;

/// The connection-control channel. Never carries deliveries.
pub const CONTROL_CHANNEL: u16 = 0;

/// Kinds of atomic wire units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A protocol method with its arguments.
    Method = 1,
    /// A content header announcing a body size and message properties.
    Header = 2,
    /// A chunk of content body bytes.
    Body = 3,
    /// Liveness signal; empty payload on channel 0.
    Heartbeat = 8,
}

impl FrameType {
    fn from_octet(octet: u8) -> Result<Self> {
        match octet {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// One atomic unit of wire data, tagged with a channel number and a type.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    /// The channel this frame belongs to.
    pub channel: u16,
    /// The undecoded frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            channel,
            payload: payload.into(),
        }
    }

    /// A heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, CONTROL_CHANNEL, Bytes::new())
    }

    /// The total wire size of this frame (header + payload + end octet).
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (all integers big-endian):
/// ```text
/// ┌───────────┬──────────────┬─────────────┬──────────────────┬───────────┐
/// │ Type (1B) │ Channel (2B) │ Length (4B) │ Payload          │ End (1B)  │
/// │ 1/2/3/8   │              │             │ (Length bytes)   │ 0xCE      │
/// └───────────┴──────────────┴─────────────┴──────────────────┴───────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_u8(frame.frame_type as u8);
    dst.put_u16(frame.channel);
    dst.put_u32(frame.payload.len() as u32);
    dst.put_slice(&frame.payload);
    dst.put_u8(FRAME_END);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let frame_type = FrameType::from_octet(src[0])?;
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len + FRAME_OVERHEAD > max_frame {
        return Err(FrameError::FrameTooLarge {
            size: payload_len + FRAME_OVERHEAD,
            max: max_frame,
        });
    }

    let total = FRAME_OVERHEAD + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    let end = src.get_u8();
    if end != FRAME_END {
        return Err(FrameError::BadFrameEnd(end));
    }

    if frame_type == FrameType::Heartbeat && (channel != CONTROL_CHANNEL || !payload.is_empty()) {
        return Err(FrameError::BadHeartbeat {
            channel,
            len: payload.len(),
        });
    }

    Ok(Some(Frame {
        frame_type,
        channel,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum total frame size in bytes. Default: 128 KiB.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let frame = Frame::new(FrameType::Method, 3, &b"payload"[..]);

        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_OVERHEAD + 7);

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Method);
        assert_eq!(decoded.channel, 3);
        assert_eq!(decoded.payload.as_ref(), b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_header() {
        let mut buf = BytesMut::from(&[1u8, 0, 1][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(FrameType::Body, 1, &b"hello"[..]), &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decode_unknown_frame_type() {
        let mut buf = BytesMut::from(&[0x77u8, 0, 0, 0, 0, 0, 0][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(FrameError::UnknownFrameType(0x77))));
    }

    #[test]
    fn decode_bad_frame_end() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(FrameType::Method, 1, &b"x"[..]), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(FrameError::BadFrameEnd(0x00))));
    }

    #[test]
    fn decode_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::Body as u8);
        buf.put_u16(1);
        buf.put_u32(1024 * 1024);

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn decode_rejects_heartbeat_on_nonzero_channel() {
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::new(FrameType::Heartbeat, 2, Bytes::new()),
            &mut buf,
        )
        .unwrap();

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(
            result,
            Err(FrameError::BadHeartbeat { channel: 2, .. })
        ));
    }

    #[test]
    fn decode_rejects_heartbeat_with_payload() {
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::new(FrameType::Heartbeat, 0, &b"x"[..]),
            &mut buf,
        )
        .unwrap();

        let result = decode_frame(&mut buf, DEFAULT_MAX_FRAME);
        assert!(matches!(
            result,
            Err(FrameError::BadHeartbeat { len: 1, .. })
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(FrameType::Method, 1, &b"first"[..]), &mut buf).unwrap();
        encode_frame(&Frame::new(FrameType::Body, 2, &b"second"[..]), &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!((f1.channel, f1.payload.as_ref()), (1, b"first".as_ref()));

        let f2 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!((f2.channel, f2.payload.as_ref()), (2, b"second".as_ref()));

        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::heartbeat(), &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Heartbeat);
        assert_eq!(frame.channel, CONTROL_CHANNEL);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn frame_wire_size() {
        let frame = Frame::new(FrameType::Method, 1, Bytes::from_static(b"test"));
        assert_eq!(frame.wire_size(), FRAME_OVERHEAD + 4);
    }
}
