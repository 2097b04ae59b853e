//! The connection: owner of the transport and the single reader thread.
//!
//! Exactly one thread per connection reads frames. It routes each frame to
//! a channel, completes continuations, or handles connection control
//! inline, and never runs application code. Everything user-visible that
//! happens as a consequence of an inbound frame happens on a channel's
//! dispatcher thread instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use mqwire_frame::{
    ContentHeader, Frame, FrameConfig, FrameError, FrameReader, FrameType, FrameWriter, Method,
    Properties, CONTROL_CHANNEL, DEFAULT_MAX_FRAME, MIN_MAX_FRAME, REPLY_SUCCESS,
};
use mqwire_transport::WireStream;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelInner};
use crate::continuation::{continuation, Continuation, RpcOutcome};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::handler::{CloseConnectionOnFault, ExceptionHandler};
use crate::shutdown::ShutdownCause;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Peer address, `host:port`.
    pub addr: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub locale: String,
    /// Requested channel-number ceiling; 0 defers to the server.
    pub channel_max: u16,
    /// Requested maximum frame size; 0 defers to the server.
    pub frame_max: u32,
    /// Requested heartbeat interval in seconds; 0 asks for none.
    pub heartbeat: u16,
    pub connect_timeout: Option<Duration>,
    /// Wait bound for negotiation reads and for close handshakes.
    pub rpc_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:7712".to_string(),
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            locale: "en_US".to_string(),
            channel_max: 2047,
            frame_max: DEFAULT_MAX_FRAME as u32,
            heartbeat: 60,
            connect_timeout: Some(Duration::from_secs(10)),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

/// Limits agreed during tuning.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds; 0 means disabled.
    pub heartbeat: u16,
}

pub(crate) struct ConnectionInner {
    socket: WireStream,
    writer: Mutex<FrameWriter<WireStream>>,
    channels: Mutex<HashMap<u16, Arc<ChannelInner>>>,
    state: Mutex<ConnectionState>,
    cause: OnceLock<ShutdownCause>,
    control_rpc: Mutex<Vec<Continuation>>,
    tuning: Tuning,
    rpc_timeout: Duration,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl ConnectionInner {
    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Send one method frame. All writers share one lock, so frames from
    /// different threads never interleave mid-frame.
    pub(crate) fn send_method(&self, channel: u16, method: &Method) -> Result<()> {
        let mut writer = self.writer.lock().expect("poisoned lock");
        writer.send_method(channel, method)?;
        *self.last_tx.lock().expect("poisoned lock") = Instant::now();
        Ok(())
    }

    /// Publish a full content sequence under a single writer acquisition,
    /// so the method, header, and body frames of one message are never
    /// interleaved with another publisher's.
    pub(crate) fn send_publish(
        &self,
        channel: u16,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: &[u8],
    ) -> Result<()> {
        let method = Method::BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        let header = ContentHeader::basic(body.len() as u64, properties);

        let mut writer = self.writer.lock().expect("poisoned lock");
        writer.send_method(channel, &method)?;
        writer.send_content(channel, &header, body)?;
        *self.last_tx.lock().expect("poisoned lock") = Instant::now();
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<()> {
        let mut writer = self.writer.lock().expect("poisoned lock");
        writer.send_heartbeat()?;
        *self.last_tx.lock().expect("poisoned lock") = Instant::now();
        Ok(())
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        self.channels.lock().expect("poisoned lock").remove(&id);
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.cause.get() {
            Some(cause) => Err(Error::ShutDown(cause.clone())),
            None => Ok(()),
        }
    }

    /// Allocate the lowest free channel number and its dispatcher.
    fn allocate_channel(self: &Arc<Self>) -> Result<(u16, Arc<ChannelInner>)> {
        let mut channels = self.channels.lock().expect("poisoned lock");
        let limit = if self.tuning.channel_max == 0 {
            u16::MAX
        } else {
            self.tuning.channel_max
        };
        let id = (1..=limit)
            .find(|n| !channels.contains_key(n))
            .ok_or_else(|| {
                Error::ChannelAllocation(format!("no free channel numbers (max {limit})"))
            })?;

        let dispatcher =
            Dispatcher::spawn(id, Arc::downgrade(self), self.exception_handler.clone())
                .map_err(|err| Error::Transport(err.into()))?;
        let inner = Arc::new(ChannelInner::new(id, dispatcher));
        channels.insert(id, inner.clone());
        Ok((id, inner))
    }

    /// Route one inbound frame. An `Err` means the connection can no
    /// longer be trusted and must shut down.
    fn route_frame(&self, frame: Frame) -> Result<()> {
        if frame.channel == CONTROL_CHANNEL {
            return self.handle_control_frame(frame);
        }

        let channel = self
            .channels
            .lock()
            .expect("poisoned lock")
            .get(&frame.channel)
            .cloned();
        match channel {
            Some(channel) => channel.handle_frame(frame, self),
            None => Err(Error::ProtocolViolation(format!(
                "frame for unknown channel {}",
                frame.channel
            ))),
        }
    }

    fn handle_control_frame(&self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Heartbeat => Ok(()),
            FrameType::Method => match Method::decode(&frame.payload)? {
                Method::ConnectionClose {
                    reply_code,
                    reply_text,
                    ..
                } => {
                    debug!(reply_code, %reply_text, "peer closed the connection");
                    let _ = self.send_method(CONTROL_CHANNEL, &Method::ConnectionCloseOk);
                    self.shutdown(ShutdownCause::peer_initiated(reply_code, reply_text));
                    Ok(())
                }
                Method::ConnectionCloseOk => {
                    let cont = self.control_rpc.lock().expect("poisoned lock").pop();
                    match cont {
                        Some(cont) => cont.resolve(RpcOutcome::Reply(Method::ConnectionCloseOk)),
                        None => warn!("close-ok with no close in flight"),
                    }
                    Ok(())
                }
                other => Err(Error::ProtocolViolation(format!(
                    "unexpected {} on the control channel",
                    other.name()
                ))),
            },
            FrameType::Header | FrameType::Body => Err(Error::ProtocolViolation(
                "content frame on the control channel".to_string(),
            )),
        }
    }

    /// Connection-scope shutdown: record the first cause, cascade to every
    /// channel, fail every blocked caller, unblock the reader.
    pub(crate) fn shutdown(&self, cause: ShutdownCause) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closing;
            }
        }

        let channels: Vec<Arc<ChannelInner>> = self
            .channels
            .lock()
            .expect("poisoned lock")
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.shutdown(cause.clone());
        }

        let blocked: Vec<Continuation> = self
            .control_rpc
            .lock()
            .expect("poisoned lock")
            .drain(..)
            .collect();
        for cont in blocked {
            cont.resolve(RpcOutcome::ShutDown(cause.clone()));
        }

        // Unblocks the reader thread if it is parked in a read.
        let _ = self.socket.shutdown();

        *self.state.lock().expect("poisoned lock") = ConnectionState::Closed;
        info!(%cause, "connection shut down");
    }
}

/// A client connection: one socket, one reader thread, many channels.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect, negotiate, and start the receive loop.
    pub fn open(config: ConnectionConfig) -> Result<Connection> {
        Self::open_with_handler(config, Arc::new(CloseConnectionOnFault))
    }

    /// Like [`open`](Self::open) with an explicit consumer-fault policy.
    pub fn open_with_handler(
        config: ConnectionConfig,
        handler: Arc<dyn ExceptionHandler>,
    ) -> Result<Connection> {
        let stream = WireStream::connect(&config.addr, config.connect_timeout)?;
        let reader_stream = stream.try_clone()?;
        let socket = stream.try_clone()?;

        let frame_config = FrameConfig {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: Some(config.rpc_timeout),
            write_timeout: None,
        };
        let mut reader = FrameReader::with_config_stream(reader_stream, frame_config.clone())?;
        let mut writer = FrameWriter::with_config_stream(stream, frame_config)?;

        writer.send_preamble()?;
        let tuning = negotiate(&mut reader, &mut writer, &config)?;

        // Wake at heartbeat granularity; without heartbeats the reader can
        // park in the read indefinitely.
        let read_timeout = if tuning.heartbeat > 0 {
            Some(Duration::from_secs(u64::from(tuning.heartbeat).div_ceil(2)))
        } else {
            None
        };
        reader.set_read_timeout(read_timeout)?;

        let now = Instant::now();
        let inner = Arc::new(ConnectionInner {
            socket,
            writer: Mutex::new(writer),
            channels: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Open),
            cause: OnceLock::new(),
            control_rpc: Mutex::new(Vec::new()),
            tuning,
            rpc_timeout: config.rpc_timeout,
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
            exception_handler: handler,
        });

        let loop_inner = inner.clone();
        let _ = thread::Builder::new()
            .name("mqwire-recv".to_string())
            .spawn(move || receive_loop(loop_inner, reader))
            .map_err(|err| Error::Transport(err.into()))?;

        info!(
            addr = %config.addr,
            channel_max = tuning.channel_max,
            frame_max = tuning.frame_max,
            heartbeat = tuning.heartbeat,
            "connection open"
        );
        Ok(Connection { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Connection {
        Connection { inner }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("poisoned lock")
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The terminal cause, once the connection is shut down.
    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.inner.cause.get().cloned()
    }

    /// Limits agreed during tuning.
    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }

    /// Open a new channel on the lowest free channel number.
    pub fn open_channel(&self) -> Result<Channel> {
        self.inner.ensure_usable()?;
        let (id, inner) = self.inner.allocate_channel()?;
        let channel = Channel {
            id,
            inner: inner.clone(),
            connection: self.inner.clone(),
        };

        match channel.call_timeout(Method::ChannelOpen, self.inner.rpc_timeout) {
            Ok(Method::ChannelOpenOk) => {
                inner.mark_open();
                debug!(channel = id, "channel open");
                Ok(channel)
            }
            Ok(other) => {
                self.inner.remove_channel(id);
                inner.shutdown(ShutdownCause::connection_error(format!(
                    "unexpected {} to channel.open",
                    other.name()
                )));
                Err(Error::ChannelAllocation(format!(
                    "unexpected {} to channel.open",
                    other.name()
                )))
            }
            Err(err) => {
                self.inner.remove_channel(id);
                inner.shutdown(
                    ShutdownCause::connection_error("channel open failed").with_source(&err),
                );
                Err(Error::ChannelAllocation(format!(
                    "peer refused channel {id}: {err}"
                )))
            }
        }
    }

    /// Close cleanly: send connection.close, await close-ok bounded by the
    /// configured timeout, then run the shutdown cascade. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.close_with_cause(ShutdownCause::app_initiated(REPLY_SUCCESS, "goodbye"))
    }

    /// Close with an explicit reply code and text.
    pub fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        self.close_with_cause(ShutdownCause::app_initiated(reply_code, reply_text))
    }

    /// Close with a prepared cause. Used by exception handlers to record
    /// the triggering fault in the terminal cause.
    pub fn close_with_cause(&self, cause: ShutdownCause) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("poisoned lock");
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                _ => *state = ConnectionState::Closing,
            }
        }

        let (cont, waiter) = continuation();
        self.inner
            .control_rpc
            .lock()
            .expect("poisoned lock")
            .push(cont);

        let close = Method::ConnectionClose {
            reply_code: cause.reply_code,
            reply_text: cause.reply_text.clone(),
            class_id: 0,
            method_id: 0,
        };
        let handshake = match self.inner.send_method(CONTROL_CHANNEL, &close) {
            Ok(()) => waiter.wait_timeout(self.inner.rpc_timeout).map(|_| ()),
            Err(err) => Err(err),
        };

        self.inner.shutdown(cause);

        match handshake {
            Ok(()) | Err(Error::ShutDown(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("tuning", &self.inner.tuning)
            .finish()
    }
}

/// Negotiate limits with the peer: start/start-ok, tune/tune-ok, open.
fn negotiate(
    reader: &mut FrameReader<WireStream>,
    writer: &mut FrameWriter<WireStream>,
    config: &ConnectionConfig,
) -> Result<Tuning> {
    match expect_control_method(reader)? {
        Method::ConnectionStart {
            version_major: 1,
            version_minor: 0,
            mechanisms,
            ..
        } => {
            if !mechanisms.split(|b| *b == b' ').any(|m| m == b"PLAIN") {
                return Err(Error::Negotiation(
                    "server offers no PLAIN authentication".to_string(),
                ));
            }
        }
        Method::ConnectionStart {
            version_major,
            version_minor,
            ..
        } => {
            return Err(Error::Negotiation(format!(
                "protocol version mismatch (server {version_major}.{version_minor})"
            )));
        }
        other => {
            return Err(Error::Negotiation(format!(
                "expected connection.start, got {}",
                other.name()
            )));
        }
    }

    let mut response = Vec::with_capacity(config.username.len() + config.password.len() + 2);
    response.push(0);
    response.extend_from_slice(config.username.as_bytes());
    response.push(0);
    response.extend_from_slice(config.password.as_bytes());
    writer.send_method(
        CONTROL_CHANNEL,
        &Method::ConnectionStartOk {
            mechanism: "PLAIN".to_string(),
            response,
            locale: config.locale.clone(),
        },
    )?;

    let tuning = match expect_control_method(reader)? {
        Method::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        } => Tuning {
            channel_max: negotiated_limit(u32::from(config.channel_max), u32::from(channel_max))
                as u16,
            frame_max: negotiated_limit(config.frame_max, frame_max)
                .max(MIN_MAX_FRAME as u32),
            heartbeat: negotiated_limit(u32::from(config.heartbeat), u32::from(heartbeat)) as u16,
        },
        other => {
            return Err(Error::Negotiation(format!(
                "expected connection.tune, got {}",
                other.name()
            )));
        }
    };

    writer.send_method(
        CONTROL_CHANNEL,
        &Method::ConnectionTuneOk {
            channel_max: tuning.channel_max,
            frame_max: tuning.frame_max,
            heartbeat: tuning.heartbeat,
        },
    )?;
    reader.set_max_frame_size(tuning.frame_max as usize);
    writer.set_max_frame_size(tuning.frame_max as usize);

    writer.send_method(
        CONTROL_CHANNEL,
        &Method::ConnectionOpen {
            virtual_host: config.virtual_host.clone(),
        },
    )?;
    match expect_control_method(reader)? {
        Method::ConnectionOpenOk => Ok(tuning),
        other => Err(Error::Negotiation(format!(
            "expected connection.open-ok, got {}",
            other.name()
        ))),
    }
}

/// Both limits set: the stricter wins. Either zero (no preference / no
/// limit): the other wins.
fn negotiated_limit(client: u32, server: u32) -> u32 {
    if client == 0 || server == 0 {
        client.max(server)
    } else {
        client.min(server)
    }
}

/// Read the next control-channel method during negotiation. A close from
/// the peer here is a rejection, not a routine shutdown.
fn expect_control_method(reader: &mut FrameReader<WireStream>) -> Result<Method> {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                return Err(Error::Negotiation(
                    "server closed the connection during negotiation".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if frame.frame_type == FrameType::Heartbeat {
            continue;
        }
        if frame.channel != CONTROL_CHANNEL || frame.frame_type != FrameType::Method {
            return Err(Error::Negotiation(format!(
                "unexpected frame during negotiation (type {:?}, channel {})",
                frame.frame_type, frame.channel
            )));
        }

        match Method::decode(&frame.payload)? {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            } => {
                return Err(Error::Negotiation(format!(
                    "server rejected connection: {reply_code} {reply_text}"
                )));
            }
            method => return Ok(method),
        }
    }
}

/// The receive loop. Runs on the dedicated reader thread for the life of
/// the connection; the sole reader of the socket.
fn receive_loop(inner: Arc<ConnectionInner>, mut reader: FrameReader<WireStream>) {
    let heartbeat = Duration::from_secs(u64::from(inner.tuning.heartbeat));

    loop {
        match reader.read_frame() {
            Ok(frame) => {
                *inner.last_rx.lock().expect("poisoned lock") = Instant::now();
                if let Err(err) = inner.route_frame(frame) {
                    warn!(%err, "frame routing failed; shutting down");
                    inner.shutdown(
                        ShutdownCause::connection_error("protocol violation").with_source(&err),
                    );
                    break;
                }
                if inner.cause.get().is_some() {
                    break;
                }
            }
            Err(FrameError::Io(err))
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if heartbeat.is_zero() {
                    continue;
                }
                let idle = inner.last_rx.lock().expect("poisoned lock").elapsed();
                if idle > heartbeat * 2 {
                    inner.shutdown(
                        ShutdownCause::connection_error("heartbeat timeout")
                            .with_source(format_args!("no frame for {}s", idle.as_secs())),
                    );
                    break;
                }
                let quiet = inner.last_tx.lock().expect("poisoned lock").elapsed();
                if quiet >= heartbeat {
                    trace!("sending heartbeat");
                    if let Err(err) = inner.send_heartbeat() {
                        inner.shutdown(
                            ShutdownCause::connection_error("heartbeat send failed")
                                .with_source(&err),
                        );
                        break;
                    }
                }
            }
            Err(err) => {
                // During an orderly close the socket shutdown lands here;
                // the cause is already recorded and wins.
                if inner.cause.get().is_none() {
                    let text = match &err {
                        FrameError::ConnectionClosed => "connection closed by peer",
                        FrameError::Io(_) => "transport failure",
                        _ => "framing failure",
                    };
                    inner.shutdown(ShutdownCause::connection_error(text).with_source(&err));
                }
                break;
            }
        }
    }
    debug!("receive loop terminated");
}
