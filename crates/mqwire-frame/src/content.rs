//! Content header codec.
//!
//! A content-bearing method (`basic.publish`, `basic.deliver`) is followed
//! by exactly one header frame announcing the total body size and the
//! message properties, then zero or more body frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::args::{put_shortstr, take_shortstr, take_u16, take_u64, take_u8};
use crate::codec::{Frame, FrameType};
use crate::error::{FrameError, Result};
use crate::method::CLASS_BASIC;

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CORRELATION_ID: u16 = 1 << 14;
const FLAG_REPLY_TO: u16 = 1 << 13;
const FLAG_MESSAGE_ID: u16 = 1 << 12;
const FLAG_DELIVERY_MODE: u16 = 1 << 11;

/// Optional per-message properties carried in the content header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
}

/// A decoded content header frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub class_id: u16,
    /// Total body size across all following body frames.
    pub body_size: u64,
    pub properties: Properties,
}

impl ContentHeader {
    /// Header for a basic-class message body.
    pub fn basic(body_size: u64, properties: Properties) -> Self {
        Self {
            class_id: CLASS_BASIC,
            body_size,
            properties,
        }
    }

    /// Encode into a header frame payload: `class:u16 0:u16 body-size:u64
    /// flags:u16 properties…`.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(32);
        dst.put_u16(self.class_id);
        dst.put_u16(0);
        dst.put_u64(self.body_size);

        let p = &self.properties;
        let mut flags = 0u16;
        if p.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if p.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if p.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if p.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if p.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        dst.put_u16(flags);

        if let Some(value) = &p.content_type {
            put_shortstr(&mut dst, value)?;
        }
        if let Some(value) = &p.correlation_id {
            put_shortstr(&mut dst, value)?;
        }
        if let Some(value) = &p.reply_to {
            put_shortstr(&mut dst, value)?;
        }
        if let Some(value) = &p.message_id {
            put_shortstr(&mut dst, value)?;
        }
        if let Some(value) = p.delivery_mode {
            dst.put_u8(value);
        }

        Ok(dst.freeze())
    }

    /// Decode a header frame payload.
    pub fn decode(payload: &[u8]) -> Result<ContentHeader> {
        let mut src = payload;
        let class_id = take_u16(&mut src, "content header class")?;
        let weight = take_u16(&mut src, "content header weight")?;
        if weight != 0 {
            return Err(FrameError::Malformed {
                context: "content header weight",
            });
        }
        let body_size = take_u64(&mut src, "content header body size")?;
        let flags = take_u16(&mut src, "content header flags")?;

        let mut properties = Properties::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(take_shortstr(&mut src, "content-type property")?);
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(take_shortstr(&mut src, "correlation-id property")?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(take_shortstr(&mut src, "reply-to property")?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(take_shortstr(&mut src, "message-id property")?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(take_u8(&mut src, "delivery-mode property")?);
        }

        Ok(ContentHeader {
            class_id,
            body_size,
            properties,
        })
    }

    /// Wrap this header in a frame for the given channel.
    pub fn into_frame(self, channel: u16) -> Result<Frame> {
        let payload = self.encode()?;
        Ok(Frame::new(FrameType::Header, channel, payload))
    }
}
