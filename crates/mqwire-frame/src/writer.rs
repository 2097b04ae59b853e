use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use mqwire_transport::WireStream;

use crate::codec::{encode_frame, Frame, FrameConfig, FrameType, FRAME_OVERHEAD};
use crate::content::ContentHeader;
use crate::error::{FrameError, Result};
use crate::method::Method;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking).
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        if frame.wire_size() > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: frame.wire_size(),
                max: self.config.max_frame_size,
            });
        }

        self.buf.clear();
        encode_frame(frame, &mut self.buf)?;
        self.write_buffered()?;
        self.flush()
    }

    /// Encode and send a method frame.
    pub fn send_method(&mut self, channel: u16, method: &Method) -> Result<()> {
        let payload = method.encode()?;
        self.send(&Frame::new(FrameType::Method, channel, payload))
    }

    /// Send a content header followed by the body split into frames that
    /// respect the negotiated maximum frame size.
    ///
    /// The caller is responsible for sending the announcing method frame
    /// first and for holding the writer across the whole sequence so other
    /// writers cannot interleave.
    pub fn send_content(&mut self, channel: u16, header: &ContentHeader, body: &[u8]) -> Result<()> {
        let payload = header.encode()?;
        self.send(&Frame::new(FrameType::Header, channel, payload))?;

        let chunk_size = self.config.max_frame_size - FRAME_OVERHEAD;
        for chunk in body.chunks(chunk_size) {
            self.send(&Frame::new(FrameType::Body, channel, chunk.to_vec()))?;
        }
        Ok(())
    }

    /// Send a heartbeat frame.
    pub fn send_heartbeat(&mut self) -> Result<()> {
        self.send(&Frame::heartbeat())
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum frame size for subsequent encoding.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<WireStream> {
    /// Create a frame writer for a `WireStream` and apply the configured
    /// write timeout to the socket.
    pub fn with_config_stream(inner: WireStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(|err| FrameError::Io(std::io::Error::other(err.to_string())))?;
        Ok(Self::with_config(inner, config))
    }

    /// Write the protocol preamble. Sent once, before any frame.
    pub fn send_preamble(&mut self) -> Result<()> {
        self.buf.clear();
        self.buf
            .extend_from_slice(&crate::codec::PROTOCOL_PREAMBLE);
        self.write_buffered()?;
        self.flush()
    }
}
