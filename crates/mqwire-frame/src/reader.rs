use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use mqwire_transport::WireStream;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached. A
    /// read timeout on the underlying stream surfaces as `FrameError::Io`
    /// with kind `WouldBlock` or `TimedOut`; buffered partial frame bytes
    /// are kept, so the caller may simply call again.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_frame_size)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
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

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum frame size for subsequent decoding.
    ///
    /// Applied after tuning negotiates the final frame limit.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<WireStream> {
    /// Create a frame reader for a `WireStream` and apply the configured
    /// read timeout to the socket.
    pub fn with_config_stream(inner: WireStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Update the socket read timeout in place.
    ///
    /// The receive loop uses this to wake at heartbeat granularity.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.config.read_timeout = timeout;
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)
    }
}

fn transport_to_frame_error(err: mqwire_transport::TransportError) -> FrameError {
    match err {
        mqwire_transport::TransportError::Io(io) => FrameError::Io(io),
        mqwire_transport::TransportError::Connect { source, .. }
        | mqwire_transport::TransportError::Resolve { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, FrameType, FRAME_END, HEADER_SIZE};

    fn wire_with(frames: &[(FrameType, u16, &[u8])]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for (frame_type, channel, payload) in frames {
            encode_frame(&Frame::new(*frame_type, *channel, payload.to_vec()), &mut wire)
                .unwrap();
        }
        wire.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let wire = wire_with(&[(FrameType::Method, 1, b"hello")]);
        let mut reader = FrameReader::new(Cursor::new(wire));

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let wire = wire_with(&[
            (FrameType::Method, 1, b"one"),
            (FrameType::Header, 2, b"two"),
            (FrameType::Body, 3, b"three"),
        ]);
        let mut reader = FrameReader::new(Cursor::new(wire));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.channel, f1.payload.as_ref()), (1, b"one".as_ref()));
        assert_eq!((f2.channel, f2.payload.as_ref()), (2, b"two".as_ref()));
        assert_eq!((f3.channel, f3.payload.as_ref()), (3, b"three".as_ref()));
    }

    #[test]
    fn partial_read_handling() {
        let wire = wire_with(&[(FrameType::Body, 4, b"slow")]);
        let byte_reader = ByteByByteReader { bytes: wire, pos: 0 };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let wire = wire_with(&[(FrameType::Method, 2, b"only-part")]);
        let mut reader = FrameReader::new(Cursor::new(wire[..HEADER_SIZE + 3].to_vec()));

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn desynchronized_stream_is_detected() {
        let mut wire = BytesMut::new();
        wire.put_u8(FrameType::Method as u8);
        wire.put_u16(1);
        wire.put_u32(2);
        wire.put_slice(b"ab");
        wire.put_u8(0x00); // wrong end octet
        wire.put_u8(FRAME_END);

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::BadFrameEnd(0x00)));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let wire = wire_with(&[(FrameType::Body, 1, &[0xAB; 1024])]);
        let cfg = FrameConfig {
            max_frame_size: 64,
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config(Cursor::new(wire), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn interrupted_read_retries() {
        let wire = wire_with(&[(FrameType::Method, 8, b"ok")]);
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: wire,
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);

        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.channel, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn timeout_keeps_partial_bytes_for_the_next_call() {
        let wire = wire_with(&[(FrameType::Method, 6, b"resume")]);
        let split = HEADER_SIZE + 2;
        let reader = TimeoutMidway {
            first: wire[..split].to_vec(),
            second: wire[split..].to_vec(),
            state: 0,
        };
        let mut framed = FrameReader::new(reader);

        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));

        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.channel, 6);
        assert_eq!(frame.payload.as_ref(), b"resume");
    }

    #[test]
    fn roundtrip_over_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer_thread = std::thread::spawn(move || {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            let mut writer =
                crate::writer::FrameWriter::new(WireStream::from_tcp(stream).unwrap());
            writer.send(&Frame::new(FrameType::Method, 1, &b"ping"[..])).unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        let mut reader = FrameReader::new(WireStream::from_tcp(stream).unwrap());
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"ping");
        writer_thread.join().unwrap();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct TimeoutMidway {
        first: Vec<u8>,
        second: Vec<u8>,
        state: u8,
    }

    impl Read for TimeoutMidway {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.state {
                0 => {
                    self.state = 1;
                    let n = self.first.len().min(buf.len());
                    buf[..n].copy_from_slice(&self.first[..n]);
                    Ok(n)
                }
                1 => {
                    self.state = 2;
                    Err(std::io::Error::from(ErrorKind::WouldBlock))
                }
                _ => {
                    let n = self.second.len().min(buf.len());
                    buf[..n].copy_from_slice(&self.second[..n]);
                    self.second.drain(..n);
                    Ok(n)
                }
            }
        }
    }
}
