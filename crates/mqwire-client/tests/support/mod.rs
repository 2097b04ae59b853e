//! Scripted in-process peer for integration tests.
//!
//! Binds a TCP listener on an ephemeral port, accepts one connection,
//! performs the server side of negotiation, then hands the framed pair to
//! a test script. Assertions inside the script surface through `join`.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mqwire_client::ConnectionConfig;
use mqwire_frame::{
    ContentHeader, FrameConfig, FrameReader, FrameType, FrameWriter, Method, Properties,
    CONTROL_CHANNEL, PROTOCOL_PREAMBLE,
};
use mqwire_transport::WireStream;

/// How long the scripted peer waits for any expected frame.
const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy)]
pub struct ServerOptions {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: 128 * 1024,
            heartbeat: 0,
        }
    }
}

pub struct TestServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Accept one client, negotiate, then run `script`.
    pub fn spawn<F>(script: F) -> TestServer
    where
        F: FnOnce(&mut ServerPeer) + Send + 'static,
    {
        Self::spawn_with(ServerOptions::default(), script)
    }

    pub fn spawn_with<F>(options: ServerOptions, script: F) -> TestServer
    where
        F: FnOnce(&mut ServerPeer) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("server should accept");
            let stream = WireStream::from_tcp(stream).expect("stream should wrap");
            let mut peer = ServerPeer::negotiate(stream, options);
            script(&mut peer);
        });

        TestServer { addr, handle }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Client config pointed at this server, tuned for fast tests.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: 0,
            rpc_timeout: Duration::from_secs(5),
            ..ConnectionConfig::new(self.addr())
        }
    }

    /// Wait for the script to finish; propagates its assertions.
    pub fn join(self) {
        self.handle.join().expect("server script should not panic");
    }
}

pub struct ServerPeer {
    reader: FrameReader<WireStream>,
    writer: FrameWriter<WireStream>,
}

impl ServerPeer {
    fn negotiate(stream: WireStream, options: ServerOptions) -> ServerPeer {
        let mut read_half = stream.try_clone().expect("stream should clone");

        let mut preamble = [0u8; PROTOCOL_PREAMBLE.len()];
        read_half
            .read_exact(&mut preamble)
            .expect("client should send the preamble");
        assert_eq!(preamble, PROTOCOL_PREAMBLE, "bad protocol preamble");

        let frame_config = FrameConfig {
            read_timeout: Some(SERVER_READ_TIMEOUT),
            ..FrameConfig::default()
        };
        let reader = FrameReader::with_config_stream(read_half, frame_config.clone())
            .expect("reader should build");
        let writer =
            FrameWriter::with_config_stream(stream, frame_config).expect("writer should build");

        let mut peer = ServerPeer { reader, writer };

        peer.send(
            CONTROL_CHANNEL,
            &Method::ConnectionStart {
                version_major: 1,
                version_minor: 0,
                mechanisms: b"PLAIN".to_vec(),
                locales: b"en_US".to_vec(),
            },
        );
        let start_ok = peer.expect_method_on(CONTROL_CHANNEL);
        assert!(
            matches!(start_ok, Method::ConnectionStartOk { ref mechanism, .. } if mechanism == "PLAIN"),
            "expected start-ok, got {start_ok:?}"
        );

        peer.send(
            CONTROL_CHANNEL,
            &Method::ConnectionTune {
                channel_max: options.channel_max,
                frame_max: options.frame_max,
                heartbeat: options.heartbeat,
            },
        );
        let tune_ok = peer.expect_method_on(CONTROL_CHANNEL);
        assert!(
            matches!(tune_ok, Method::ConnectionTuneOk { .. }),
            "expected tune-ok, got {tune_ok:?}"
        );

        let open = peer.expect_method_on(CONTROL_CHANNEL);
        assert!(
            matches!(open, Method::ConnectionOpen { .. }),
            "expected connection.open, got {open:?}"
        );
        peer.send(CONTROL_CHANNEL, &Method::ConnectionOpenOk);

        peer
    }

    pub fn send(&mut self, channel: u16, method: &Method) {
        self.writer
            .send_method(channel, method)
            .expect("server send should succeed");
    }

    /// Next method frame, skipping heartbeats.
    pub fn expect_method(&mut self) -> (u16, Method) {
        loop {
            let frame = self.reader.read_frame().expect("expected a frame");
            match frame.frame_type {
                FrameType::Heartbeat => continue,
                FrameType::Method => {
                    let method =
                        Method::decode(&frame.payload).expect("method should decode");
                    return (frame.channel, method);
                }
                other => panic!("expected a method frame, got {other:?}"),
            }
        }
    }

    pub fn expect_method_on(&mut self, channel: u16) -> Method {
        let (got_channel, method) = self.expect_method();
        assert_eq!(got_channel, channel, "method arrived on the wrong channel");
        method
    }

    /// Serve one channel.open, returning the channel number.
    pub fn handle_channel_open(&mut self) -> u16 {
        let (channel, method) = self.expect_method();
        assert_eq!(method, Method::ChannelOpen);
        self.send(channel, &Method::ChannelOpenOk);
        channel
    }

    /// Serve one basic.consume, assigning `ctag-<queue>` when the client
    /// did not pick a tag. Returns the tag.
    pub fn handle_consume(&mut self) -> (u16, String) {
        let (channel, method) = self.expect_method();
        let Method::BasicConsume {
            queue,
            consumer_tag,
            ..
        } = method
        else {
            panic!("expected basic.consume, got {method:?}");
        };
        let tag = if consumer_tag.is_empty() {
            format!("ctag-{queue}")
        } else {
            consumer_tag
        };
        self.send(
            channel,
            &Method::BasicConsumeOk {
                consumer_tag: tag.clone(),
            },
        );
        (channel, tag)
    }

    /// Deliver one single-body-frame message to a consumer.
    pub fn send_delivery(&mut self, channel: u16, consumer_tag: &str, delivery_tag: u64, body: &[u8]) {
        self.send(
            channel,
            &Method::BasicDeliver {
                consumer_tag: consumer_tag.to_string(),
                delivery_tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: "q".to_string(),
            },
        );
        let header = ContentHeader::basic(body.len() as u64, Properties::default());
        self.writer
            .send_content(channel, &header, body)
            .expect("delivery content should send");
    }

    /// Read one complete publish: method + header + body frames until the
    /// announced size is reached.
    pub fn expect_publish(&mut self) -> (u16, String, String, Properties, Vec<u8>) {
        let (channel, method) = self.expect_method();
        let Method::BasicPublish {
            exchange,
            routing_key,
        } = method
        else {
            panic!("expected basic.publish, got {method:?}");
        };

        let header_frame = self.reader.read_frame().expect("expected a content header");
        assert_eq!(header_frame.frame_type, FrameType::Header);
        assert_eq!(header_frame.channel, channel);
        let header =
            ContentHeader::decode(&header_frame.payload).expect("header should decode");

        let mut body = Vec::with_capacity(header.body_size as usize);
        while (body.len() as u64) < header.body_size {
            let frame = self.reader.read_frame().expect("expected a body frame");
            assert_eq!(frame.frame_type, FrameType::Body);
            assert_eq!(frame.channel, channel);
            body.extend_from_slice(&frame.payload);
        }
        assert_eq!(body.len() as u64, header.body_size);

        (channel, exchange, routing_key, header.properties, body)
    }

    /// Serve the peer side of a clean connection close. Returns the
    /// client's reply code and text.
    pub fn handle_connection_close(&mut self) -> (u16, String) {
        let method = self.expect_method_on(CONTROL_CHANNEL);
        let Method::ConnectionClose {
            reply_code,
            reply_text,
            ..
        } = method
        else {
            panic!("expected connection.close, got {method:?}");
        };
        self.send(CONTROL_CHANNEL, &Method::ConnectionCloseOk);
        (reply_code, reply_text)
    }

    /// Serve one channel.close on the given channel.
    pub fn handle_channel_close(&mut self, channel: u16) {
        let method = self.expect_method_on(channel);
        assert!(
            matches!(method, Method::ChannelClose { .. }),
            "expected channel.close, got {method:?}"
        );
        self.send(channel, &Method::ChannelCloseOk);
    }

    /// Initiate a close from the server side.
    pub fn send_connection_close(&mut self, reply_code: u16, reply_text: &str) {
        self.send(
            CONTROL_CHANNEL,
            &Method::ConnectionClose {
                reply_code,
                reply_text: reply_text.to_string(),
                class_id: 0,
                method_id: 0,
            },
        );
        let reply = self.expect_method_on(CONTROL_CHANNEL);
        assert_eq!(reply, Method::ConnectionCloseOk);
    }

    /// Send a raw frame, for protocol-violation scripts.
    pub fn send_raw(&mut self, frame_type: FrameType, channel: u16, payload: &[u8]) {
        self.writer
            .send(&mqwire_frame::Frame::new(frame_type, channel, payload.to_vec()))
            .expect("raw frame should send");
    }
}

/// Everything a consumer can observe, funneled into one stream.
#[derive(Debug)]
pub enum ConsumerEvent {
    ConsumeOk(String),
    CancelOk(String),
    Cancelled(String),
    RecoverOk,
    Delivery(mqwire_client::Delivery),
    Shutdown(String, mqwire_client::ShutdownCause),
}

pub struct CollectingConsumer {
    tx: crossbeam_channel::Sender<ConsumerEvent>,
}

impl mqwire_client::Consumer for CollectingConsumer {
    fn on_consume_ok(&self, tag: &str) {
        let _ = self.tx.send(ConsumerEvent::ConsumeOk(tag.to_string()));
    }

    fn on_cancel_ok(&self, tag: &str) {
        let _ = self.tx.send(ConsumerEvent::CancelOk(tag.to_string()));
    }

    fn on_cancel(&self, tag: &str) {
        let _ = self.tx.send(ConsumerEvent::Cancelled(tag.to_string()));
    }

    fn on_recover_ok(&self) {
        let _ = self.tx.send(ConsumerEvent::RecoverOk);
    }

    fn on_delivery(&self, delivery: mqwire_client::Delivery) {
        let _ = self.tx.send(ConsumerEvent::Delivery(delivery));
    }

    fn on_shutdown(&self, tag: &str, cause: &mqwire_client::ShutdownCause) {
        let _ = self
            .tx
            .send(ConsumerEvent::Shutdown(tag.to_string(), cause.clone()));
    }
}

pub fn collecting_consumer() -> (
    std::sync::Arc<CollectingConsumer>,
    crossbeam_channel::Receiver<ConsumerEvent>,
) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (std::sync::Arc::new(CollectingConsumer { tx }), rx)
}

/// Poll until `predicate` holds, or fail after a few seconds.
pub fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..300 {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}
