//! The protocol method set the client routes.
//!
//! A method payload is `class:u16 method:u16` followed by the argument
//! list for that method. Boolean arguments are packed into a single flag
//! octet, lowest bit first.

use bytes::{BufMut, Bytes, BytesMut};

use crate::args::{put_longstr, put_shortstr, take_longstr, take_shortstr, take_u16, take_u32, take_u64, take_u8};
use crate::codec::{Frame, FrameType};
use crate::error::{FrameError, Result};

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_BASIC: u16 = 60;

/// Reply code for a clean, application-initiated close.
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code for an internal client error (e.g. a crashing consumer).
pub const REPLY_INTERNAL_ERROR: u16 = 541;

/// A decoded protocol method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        mechanisms: Vec<u8>,
        locales: Vec<u8>,
    },
    ConnectionStartOk {
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_ack: bool,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
}

impl Method {
    pub fn class_id(&self) -> u16 {
        match self {
            Method::ConnectionStart { .. }
            | Method::ConnectionStartOk { .. }
            | Method::ConnectionTune { .. }
            | Method::ConnectionTuneOk { .. }
            | Method::ConnectionOpen { .. }
            | Method::ConnectionOpenOk
            | Method::ConnectionClose { .. }
            | Method::ConnectionCloseOk => CLASS_CONNECTION,
            Method::ChannelOpen
            | Method::ChannelOpenOk
            | Method::ChannelClose { .. }
            | Method::ChannelCloseOk => CLASS_CHANNEL,
            _ => CLASS_BASIC,
        }
    }

    pub fn method_id(&self) -> u16 {
        match self {
            Method::ConnectionStart { .. } => 10,
            Method::ConnectionStartOk { .. } => 11,
            Method::ConnectionTune { .. } => 30,
            Method::ConnectionTuneOk { .. } => 31,
            Method::ConnectionOpen { .. } => 40,
            Method::ConnectionOpenOk => 41,
            Method::ConnectionClose { .. } => 50,
            Method::ConnectionCloseOk => 51,
            Method::ChannelOpen => 10,
            Method::ChannelOpenOk => 11,
            Method::ChannelClose { .. } => 40,
            Method::ChannelCloseOk => 41,
            Method::BasicQos { .. } => 10,
            Method::BasicQosOk => 11,
            Method::BasicConsume { .. } => 20,
            Method::BasicConsumeOk { .. } => 21,
            Method::BasicCancel { .. } => 30,
            Method::BasicCancelOk { .. } => 31,
            Method::BasicPublish { .. } => 40,
            Method::BasicDeliver { .. } => 60,
            Method::BasicAck { .. } => 80,
            Method::BasicRecover { .. } => 110,
            Method::BasicRecoverOk => 111,
        }
    }

    /// Stable method name, used in logs and fault reports.
    pub fn name(&self) -> &'static str {
        match self {
            Method::ConnectionStart { .. } => "connection.start",
            Method::ConnectionStartOk { .. } => "connection.start-ok",
            Method::ConnectionTune { .. } => "connection.tune",
            Method::ConnectionTuneOk { .. } => "connection.tune-ok",
            Method::ConnectionOpen { .. } => "connection.open",
            Method::ConnectionOpenOk => "connection.open-ok",
            Method::ConnectionClose { .. } => "connection.close",
            Method::ConnectionCloseOk => "connection.close-ok",
            Method::ChannelOpen => "channel.open",
            Method::ChannelOpenOk => "channel.open-ok",
            Method::ChannelClose { .. } => "channel.close",
            Method::ChannelCloseOk => "channel.close-ok",
            Method::BasicQos { .. } => "basic.qos",
            Method::BasicQosOk => "basic.qos-ok",
            Method::BasicConsume { .. } => "basic.consume",
            Method::BasicConsumeOk { .. } => "basic.consume-ok",
            Method::BasicCancel { .. } => "basic.cancel",
            Method::BasicCancelOk { .. } => "basic.cancel-ok",
            Method::BasicPublish { .. } => "basic.publish",
            Method::BasicDeliver { .. } => "basic.deliver",
            Method::BasicAck { .. } => "basic.ack",
            Method::BasicRecover { .. } => "basic.recover",
            Method::BasicRecoverOk => "basic.recover-ok",
        }
    }

    /// True if this method is followed by a content header and body frames.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish { .. } | Method::BasicDeliver { .. }
        )
    }

    /// Encode this method into a payload suitable for a method frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_u16(self.class_id());
        dst.put_u16(self.method_id());

        match self {
            Method::ConnectionStart {
                version_major,
                version_minor,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                put_longstr(&mut dst, mechanisms);
                put_longstr(&mut dst, locales);
            }
            Method::ConnectionStartOk {
                mechanism,
                response,
                locale,
            } => {
                put_shortstr(&mut dst, mechanism)?;
                put_longstr(&mut dst, response);
                put_shortstr(&mut dst, locale)?;
            }
            Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | Method::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            Method::ConnectionOpen { virtual_host } => {
                put_shortstr(&mut dst, virtual_host)?;
            }
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                put_shortstr(&mut dst, reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                dst.put_u32(*prefetch_size);
                dst.put_u16(*prefetch_count);
                dst.put_u8(u8::from(*global));
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_ack,
            } => {
                put_shortstr(&mut dst, queue)?;
                put_shortstr(&mut dst, consumer_tag)?;
                dst.put_u8(u8::from(*no_ack));
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancel { consumer_tag }
            | Method::BasicCancelOk { consumer_tag } => {
                put_shortstr(&mut dst, consumer_tag)?;
            }
            Method::BasicPublish {
                exchange,
                routing_key,
            } => {
                put_shortstr(&mut dst, exchange)?;
                put_shortstr(&mut dst, routing_key)?;
            }
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                put_shortstr(&mut dst, consumer_tag)?;
                dst.put_u64(*delivery_tag);
                dst.put_u8(u8::from(*redelivered));
                put_shortstr(&mut dst, exchange)?;
                put_shortstr(&mut dst, routing_key)?;
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(u8::from(*multiple));
            }
            Method::BasicRecover { requeue } => {
                dst.put_u8(u8::from(*requeue));
            }
            // Argument-free methods encode as class + method id only.
            Method::ConnectionOpenOk
            | Method::ConnectionCloseOk
            | Method::ChannelOpen
            | Method::ChannelOpenOk
            | Method::ChannelCloseOk
            | Method::BasicQosOk
            | Method::BasicRecoverOk => {}
        }

        Ok(dst.freeze())
    }

    /// Decode a method frame payload.
    pub fn decode(payload: &[u8]) -> Result<Method> {
        let mut src = payload;
        let class = take_u16(&mut src, "method class id")?;
        let method = take_u16(&mut src, "method id")?;

        let decoded = match (class, method) {
            (CLASS_CONNECTION, 10) => Method::ConnectionStart {
                version_major: take_u8(&mut src, "connection.start")?,
                version_minor: take_u8(&mut src, "connection.start")?,
                mechanisms: take_longstr(&mut src, "connection.start")?,
                locales: take_longstr(&mut src, "connection.start")?,
            },
            (CLASS_CONNECTION, 11) => Method::ConnectionStartOk {
                mechanism: take_shortstr(&mut src, "connection.start-ok")?,
                response: take_longstr(&mut src, "connection.start-ok")?,
                locale: take_shortstr(&mut src, "connection.start-ok")?,
            },
            (CLASS_CONNECTION, 30) => Method::ConnectionTune {
                channel_max: take_u16(&mut src, "connection.tune")?,
                frame_max: take_u32(&mut src, "connection.tune")?,
                heartbeat: take_u16(&mut src, "connection.tune")?,
            },
            (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: take_u16(&mut src, "connection.tune-ok")?,
                frame_max: take_u32(&mut src, "connection.tune-ok")?,
                heartbeat: take_u16(&mut src, "connection.tune-ok")?,
            },
            (CLASS_CONNECTION, 40) => Method::ConnectionOpen {
                virtual_host: take_shortstr(&mut src, "connection.open")?,
            },
            (CLASS_CONNECTION, 41) => Method::ConnectionOpenOk,
            (CLASS_CONNECTION, 50) => Method::ConnectionClose {
                reply_code: take_u16(&mut src, "connection.close")?,
                reply_text: take_shortstr(&mut src, "connection.close")?,
                class_id: take_u16(&mut src, "connection.close")?,
                method_id: take_u16(&mut src, "connection.close")?,
            },
            (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,

            (CLASS_CHANNEL, 10) => Method::ChannelOpen,
            (CLASS_CHANNEL, 11) => Method::ChannelOpenOk,
            (CLASS_CHANNEL, 40) => Method::ChannelClose {
                reply_code: take_u16(&mut src, "channel.close")?,
                reply_text: take_shortstr(&mut src, "channel.close")?,
                class_id: take_u16(&mut src, "channel.close")?,
                method_id: take_u16(&mut src, "channel.close")?,
            },
            (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,

            (CLASS_BASIC, 10) => Method::BasicQos {
                prefetch_size: take_u32(&mut src, "basic.qos")?,
                prefetch_count: take_u16(&mut src, "basic.qos")?,
                global: take_u8(&mut src, "basic.qos")? & 1 != 0,
            },
            (CLASS_BASIC, 11) => Method::BasicQosOk,
            (CLASS_BASIC, 20) => Method::BasicConsume {
                queue: take_shortstr(&mut src, "basic.consume")?,
                consumer_tag: take_shortstr(&mut src, "basic.consume")?,
                no_ack: take_u8(&mut src, "basic.consume")? & 1 != 0,
            },
            (CLASS_BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: take_shortstr(&mut src, "basic.consume-ok")?,
            },
            (CLASS_BASIC, 30) => Method::BasicCancel {
                consumer_tag: take_shortstr(&mut src, "basic.cancel")?,
            },
            (CLASS_BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: take_shortstr(&mut src, "basic.cancel-ok")?,
            },
            (CLASS_BASIC, 40) => Method::BasicPublish {
                exchange: take_shortstr(&mut src, "basic.publish")?,
                routing_key: take_shortstr(&mut src, "basic.publish")?,
            },
            (CLASS_BASIC, 60) => Method::BasicDeliver {
                consumer_tag: take_shortstr(&mut src, "basic.deliver")?,
                delivery_tag: take_u64(&mut src, "basic.deliver")?,
                redelivered: take_u8(&mut src, "basic.deliver")? & 1 != 0,
                exchange: take_shortstr(&mut src, "basic.deliver")?,
                routing_key: take_shortstr(&mut src, "basic.deliver")?,
            },
            (CLASS_BASIC, 80) => Method::BasicAck {
                delivery_tag: take_u64(&mut src, "basic.ack")?,
                multiple: take_u8(&mut src, "basic.ack")? & 1 != 0,
            },
            (CLASS_BASIC, 110) => Method::BasicRecover {
                requeue: take_u8(&mut src, "basic.recover")? & 1 != 0,
            },
            (CLASS_BASIC, 111) => Method::BasicRecoverOk,

            (class, method) => return Err(FrameError::UnknownMethod { class, method }),
        };

        Ok(decoded)
    }

    /// Wrap this method in a frame for the given channel.
    pub fn into_frame(self, channel: u16) -> Result<Frame> {
        let payload = self.encode()?;
        Ok(Frame::new(FrameType::Method, channel, payload))
    }
}
