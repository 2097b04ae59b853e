use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};

/// A connected wire stream implementing Read + Write.
///
/// This is the fundamental I/O type the client builds on. It wraps a TCP
/// stream with Nagle disabled, since the protocol writes complete frames.
pub struct WireStream {
    inner: TcpStream,
}

impl WireStream {
    /// Connect to a peer (blocking), optionally bounded by a timeout.
    ///
    /// When the address string resolves to multiple socket addresses, each is
    /// tried in order and the last failure is reported.
    pub fn connect(addr: impl AsRef<str>, timeout: Option<Duration>) -> Result<Self> {
        let addr = addr.as_ref();
        let resolved: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect();

        if resolved.is_empty() {
            return Err(TransportError::NoAddresses {
                addr: addr.to_string(),
            });
        }

        let mut last_err: Option<std::io::Error> = None;
        for candidate in &resolved {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(candidate, timeout),
                None => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, peer = %candidate, "connected");
                    return Ok(Self { inner: stream });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(TransportError::Connect {
            addr: addr.to_string(),
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("no connection attempt made")),
        })
    }

    /// Wrap an already-connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { inner: stream })
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self { inner: cloned })
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Local address of this end of the stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }

    /// Shut down both directions of the stream.
    ///
    /// Any thread blocked in a read on a clone of this stream observes EOF.
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already gone is fine; shutdown is used for teardown.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Read for WireStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for WireStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireStream")
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
