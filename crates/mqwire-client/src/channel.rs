//! A multiplexed virtual session over one connection.
//!
//! The channel owns three pieces of state the reader thread feeds:
//! the continuation FIFO for synchronous calls, the consumer registry, and
//! the in-progress delivery reassembly. Frames for one channel are only
//! ever handled by the connection's single reader thread, so none of this
//! state sees concurrent frame processing; the locks exist for the
//! application threads that call in from the other side.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mqwire_frame::{ContentHeader, Frame, FrameType, Method, Properties, REPLY_SUCCESS};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionInner;
use crate::consumer::{Consumer, Delivery, Envelope};
use crate::continuation::{continuation, Continuation, ContinuationWaiter, RpcOutcome};
use crate::dispatcher::{DispatchTask, Dispatcher};
use crate::error::{Error, Result};
use crate::shutdown::ShutdownCause;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Options for a consume call.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Requested consumer tag; empty lets the server assign one.
    pub consumer_tag: String,
    /// Deliveries do not need acknowledgement.
    pub no_ack: bool,
}

struct ConsumerEntry {
    consumer: Arc<dyn Consumer>,
    no_ack: bool,
}

struct PendingConsumer {
    consumer: Arc<dyn Consumer>,
    no_ack: bool,
}

/// A delivery in flight: the announcing method, then a header, then body
/// bytes until the announced size is reached. At most one per channel.
struct PartialDelivery {
    consumer_tag: String,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub(crate) struct ChannelInner {
    id: u16,
    state: Mutex<ChannelState>,
    cause: OnceLock<ShutdownCause>,
    rpc: Mutex<VecDeque<Continuation>>,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    pending_consumers: Mutex<VecDeque<PendingConsumer>>,
    reassembly: Mutex<Option<PartialDelivery>>,
    unacked: Mutex<BTreeSet<u64>>,
    dispatcher: Dispatcher,
}

impl ChannelInner {
    pub(crate) fn new(id: u16, dispatcher: Dispatcher) -> Self {
        Self {
            id,
            state: Mutex::new(ChannelState::Opening),
            cause: OnceLock::new(),
            rpc: Mutex::new(VecDeque::new()),
            consumers: Mutex::new(HashMap::new()),
            pending_consumers: Mutex::new(VecDeque::new()),
            reassembly: Mutex::new(None),
            unacked: Mutex::new(BTreeSet::new()),
            dispatcher,
        }
    }

    pub(crate) fn mark_open(&self) {
        *self.state.lock().expect("poisoned lock") = ChannelState::Open;
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock().expect("poisoned lock")
    }

    pub(crate) fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.cause.get().cloned()
    }

    /// Handle one frame from the reader thread. An `Err` means the framing
    /// state is no longer trustworthy and the caller must escalate to a
    /// connection-scope shutdown.
    pub(crate) fn handle_frame(&self, frame: Frame, conn: &ConnectionInner) -> Result<()> {
        trace!(channel = self.id, frame_type = ?frame.frame_type, "frame");
        match frame.frame_type {
            FrameType::Method => {
                let method = Method::decode(&frame.payload)?;
                self.handle_method(method, conn)
            }
            FrameType::Header => self.handle_header(&frame.payload),
            FrameType::Body => self.handle_body(frame.payload),
            // The codec pins heartbeats to channel 0.
            FrameType::Heartbeat => Err(Error::ProtocolViolation(format!(
                "heartbeat on channel {}",
                self.id
            ))),
        }
    }

    fn handle_method(&self, method: Method, conn: &ConnectionInner) -> Result<()> {
        if self.reassembly.lock().expect("poisoned lock").is_some() {
            return Err(Error::ProtocolViolation(format!(
                "{} interrupted content reassembly on channel {}",
                method.name(),
                self.id
            )));
        }

        match method {
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                *self.reassembly.lock().expect("poisoned lock") = Some(PartialDelivery {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                    header: None,
                    body: BytesMut::new(),
                });
                Ok(())
            }

            Method::BasicConsumeOk { consumer_tag } => {
                let pending = self
                    .pending_consumers
                    .lock()
                    .expect("poisoned lock")
                    .pop_front();
                let Some(pending) = pending else {
                    return Err(Error::ProtocolViolation(format!(
                        "consume-ok without a pending consume call on channel {}",
                        self.id
                    )));
                };
                self.consumers.lock().expect("poisoned lock").insert(
                    consumer_tag.clone(),
                    ConsumerEntry {
                        consumer: pending.consumer.clone(),
                        no_ack: pending.no_ack,
                    },
                );
                debug!(channel = self.id, tag = %consumer_tag, "consumer registered");
                self.dispatcher.enqueue(DispatchTask::ConsumeOk {
                    consumer: pending.consumer,
                    tag: consumer_tag.clone(),
                });
                self.resolve_reply(Method::BasicConsumeOk { consumer_tag })
            }

            Method::BasicCancelOk { consumer_tag } => {
                let entry = self
                    .consumers
                    .lock()
                    .expect("poisoned lock")
                    .remove(&consumer_tag);
                if let Some(entry) = entry {
                    self.dispatcher.enqueue(DispatchTask::CancelOk {
                        consumer: entry.consumer,
                        tag: consumer_tag.clone(),
                    });
                }
                self.resolve_reply(Method::BasicCancelOk { consumer_tag })
            }

            // Server-initiated cancel, e.g. the queue was deleted.
            Method::BasicCancel { consumer_tag } => {
                let entry = self
                    .consumers
                    .lock()
                    .expect("poisoned lock")
                    .remove(&consumer_tag);
                match entry {
                    Some(entry) => self.dispatcher.enqueue(DispatchTask::Cancel {
                        consumer: entry.consumer,
                        tag: consumer_tag,
                    }),
                    None => warn!(
                        channel = self.id,
                        tag = %consumer_tag,
                        "server cancelled an unknown consumer"
                    ),
                }
                Ok(())
            }

            Method::BasicRecoverOk => {
                // Everything unacknowledged up to here will be redelivered.
                self.unacked.lock().expect("poisoned lock").clear();
                let consumers: Vec<(String, Arc<dyn Consumer>)> = self
                    .consumers
                    .lock()
                    .expect("poisoned lock")
                    .iter()
                    .map(|(tag, entry)| (tag.clone(), entry.consumer.clone()))
                    .collect();
                self.dispatcher
                    .enqueue(DispatchTask::RecoverOk { consumers });
                self.resolve_reply(Method::BasicRecoverOk)
            }

            Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => {
                let _ = conn.send_method(self.id, &Method::ChannelCloseOk);
                conn.remove_channel(self.id);
                self.shutdown(ShutdownCause::peer_initiated(reply_code, reply_text));
                Ok(())
            }

            Method::ChannelOpenOk | Method::ChannelCloseOk | Method::BasicQosOk => {
                self.resolve_reply(method)
            }

            other => Err(Error::ProtocolViolation(format!(
                "unexpected {} on channel {}",
                other.name(),
                self.id
            ))),
        }
    }

    fn handle_header(&self, payload: &[u8]) -> Result<()> {
        let header = ContentHeader::decode(payload)?;
        let mut slot = self.reassembly.lock().expect("poisoned lock");
        let Some(partial) = slot.as_mut() else {
            return Err(Error::ProtocolViolation(format!(
                "content header without a pending deliver on channel {}",
                self.id
            )));
        };
        if partial.header.is_some() {
            return Err(Error::ProtocolViolation(format!(
                "second content header in one delivery on channel {}",
                self.id
            )));
        }
        let body_size = header.body_size;
        partial.header = Some(header);
        if body_size == 0 {
            let complete = slot.take();
            drop(slot);
            if let Some(complete) = complete {
                self.finish_delivery(complete);
            }
        }
        Ok(())
    }

    fn handle_body(&self, payload: Bytes) -> Result<()> {
        let mut slot = self.reassembly.lock().expect("poisoned lock");
        let Some(partial) = slot.as_mut() else {
            return Err(Error::ProtocolViolation(format!(
                "content body without a pending deliver on channel {}",
                self.id
            )));
        };
        let Some(header) = &partial.header else {
            return Err(Error::ProtocolViolation(format!(
                "content body before content header on channel {}",
                self.id
            )));
        };

        let expected = header.body_size as usize;
        if partial.body.len() + payload.len() > expected {
            return Err(Error::ProtocolViolation(format!(
                "content body overrun on channel {} ({} bytes, {} announced)",
                self.id,
                partial.body.len() + payload.len(),
                expected
            )));
        }

        partial.body.extend_from_slice(&payload);
        if partial.body.len() == expected {
            let complete = slot.take();
            drop(slot);
            if let Some(complete) = complete {
                self.finish_delivery(complete);
            }
        }
        Ok(())
    }

    fn finish_delivery(&self, partial: PartialDelivery) {
        let properties = partial
            .header
            .map(|header| header.properties)
            .unwrap_or_default();

        let consumers = self.consumers.lock().expect("poisoned lock");
        let Some(entry) = consumers.get(&partial.consumer_tag) else {
            // Cancelled between the server queuing and us reassembling.
            debug!(
                channel = self.id,
                tag = %partial.consumer_tag,
                "dropping delivery for unregistered consumer"
            );
            return;
        };

        if !entry.no_ack {
            self.unacked
                .lock()
                .expect("poisoned lock")
                .insert(partial.delivery_tag);
        }

        self.dispatcher.enqueue(DispatchTask::Delivery {
            consumer: entry.consumer.clone(),
            delivery: Delivery {
                consumer_tag: partial.consumer_tag,
                envelope: Envelope {
                    delivery_tag: partial.delivery_tag,
                    redelivered: partial.redelivered,
                    exchange: partial.exchange,
                    routing_key: partial.routing_key,
                },
                properties,
                body: partial.body.freeze(),
            },
        });
    }

    /// Pop the oldest continuation and resolve it with the reply. Replies
    /// with no pending call mean the peer and we disagree about the RPC
    /// stream; not recoverable.
    fn resolve_reply(&self, method: Method) -> Result<()> {
        let front = self.rpc.lock().expect("poisoned lock").pop_front();
        match front {
            Some(cont) => {
                cont.resolve(RpcOutcome::Reply(method));
                Ok(())
            }
            None => Err(Error::ProtocolViolation(format!(
                "{} with no pending call on channel {}",
                method.name(),
                self.id
            ))),
        }
    }

    /// Enqueue a continuation and send the request while holding the FIFO
    /// lock, so concurrent callers' replies stay matched in issue order.
    fn send_rpc(
        &self,
        conn: &ConnectionInner,
        method: &Method,
        pending_consumer: Option<PendingConsumer>,
    ) -> Result<ContinuationWaiter> {
        let (cont, waiter) = continuation();
        let mut fifo = self.rpc.lock().expect("poisoned lock");
        if let Some(cause) = self.cause.get() {
            return Err(Error::ShutDown(cause.clone()));
        }

        let registered_pending = pending_consumer.is_some();
        if let Some(pending) = pending_consumer {
            self.pending_consumers
                .lock()
                .expect("poisoned lock")
                .push_back(pending);
        }
        fifo.push_back(cont);

        if let Err(err) = conn.send_method(self.id, method) {
            fifo.pop_back();
            if registered_pending {
                self.pending_consumers
                    .lock()
                    .expect("poisoned lock")
                    .pop_back();
            }
            return Err(err);
        }

        Ok(waiter)
    }

    /// Channel-scoped shutdown: resolve every blocked caller, then make the
    /// shutdown notification the dispatcher's final task. First cause wins.
    pub(crate) fn shutdown(&self, cause: ShutdownCause) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }
        *self.state.lock().expect("poisoned lock") = ChannelState::Closing;

        let blocked: Vec<Continuation> = self
            .rpc
            .lock()
            .expect("poisoned lock")
            .drain(..)
            .collect();
        for cont in blocked {
            cont.resolve(RpcOutcome::ShutDown(cause.clone()));
        }

        self.pending_consumers
            .lock()
            .expect("poisoned lock")
            .clear();
        *self.reassembly.lock().expect("poisoned lock") = None;

        let consumers: Vec<(String, Arc<dyn Consumer>)> = self
            .consumers
            .lock()
            .expect("poisoned lock")
            .drain()
            .map(|(tag, entry)| (tag, entry.consumer))
            .collect();
        self.dispatcher.enqueue(DispatchTask::ShutDown {
            cause: cause.clone(),
            consumers,
        });

        *self.state.lock().expect("poisoned lock") = ChannelState::Closed;
        debug!(channel = self.id, %cause, "channel shut down");
    }
}

/// A multiplexed virtual session, independently closable.
///
/// Cheap to clone; clones refer to the same channel. Synchronous calls
/// from different threads on one channel are serialized at the
/// continuation-queue level; calls on different channels proceed
/// independently.
#[derive(Clone)]
pub struct Channel {
    pub(crate) id: u16,
    pub(crate) inner: Arc<ChannelInner>,
    pub(crate) connection: Arc<ConnectionInner>,
}

impl Channel {
    /// The channel number.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == ChannelState::Open
    }

    /// The terminal cause, once the channel is shut down.
    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.inner.shutdown_cause()
    }

    /// Issue a synchronous call: send the method and block until the reply
    /// for it arrives, or until shutdown fails every waiter.
    pub fn call(&self, method: Method) -> Result<Method> {
        let waiter = self.inner.send_rpc(&self.connection, &method, None)?;
        waiter.wait()
    }

    /// Like [`call`](Self::call) with a bounded wait. On timeout the
    /// request is not retracted; its eventual reply is consumed and
    /// discarded so later calls stay matched to their replies.
    pub fn call_timeout(&self, method: Method, timeout: Duration) -> Result<Method> {
        let waiter = self.inner.send_rpc(&self.connection, &method, None)?;
        waiter.wait_timeout(timeout)
    }

    /// Fire-and-forget send.
    pub fn cast(&self, method: Method) -> Result<()> {
        if let Some(cause) = self.inner.cause.get() {
            return Err(Error::ShutDown(cause.clone()));
        }
        self.connection.send_method(self.id, &method)
    }

    /// Request a limit on unacknowledged outstanding deliveries. The peer
    /// enforces the window; the client tracks acknowledgement state.
    pub fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.qos_with(0, prefetch_count, false)
    }

    pub fn qos_with(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        let reply = self.call(Method::BasicQos {
            prefetch_size,
            prefetch_count,
            global,
        })?;
        expect_reply(reply, "basic.qos-ok", |m| matches!(m, Method::BasicQosOk))
    }

    /// Register a consumer. Returns the final consumer tag (server-assigned
    /// when `options.consumer_tag` is empty). The consumer's callbacks run
    /// on this channel's dispatcher thread, starting with
    /// [`on_consume_ok`](Consumer::on_consume_ok).
    pub fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String> {
        let method = Method::BasicConsume {
            queue: queue.to_string(),
            consumer_tag: options.consumer_tag.clone(),
            no_ack: options.no_ack,
        };
        let pending = PendingConsumer {
            consumer,
            no_ack: options.no_ack,
        };
        let waiter = self
            .inner
            .send_rpc(&self.connection, &method, Some(pending))?;
        match waiter.wait()? {
            Method::BasicConsumeOk { consumer_tag } => Ok(consumer_tag),
            other => Err(unexpected_reply("basic.consume-ok", other)),
        }
    }

    /// Cancel a consumer. Deliveries already queued for dispatch before the
    /// cancellation still complete; nothing is delivered after cancel-ok.
    pub fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let reply = self.call(Method::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
        })?;
        expect_reply(reply, "basic.cancel-ok", |m| {
            matches!(m, Method::BasicCancelOk { .. })
        })
    }

    /// Publish a message: method frame, content header, then body frames
    /// split to the negotiated frame limit, written without interleaving.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: &[u8],
    ) -> Result<()> {
        if let Some(cause) = self.inner.cause.get() {
            return Err(Error::ShutDown(cause.clone()));
        }
        self.connection
            .send_publish(self.id, exchange, routing_key, properties, body)
    }

    /// Acknowledge one delivery, or everything up to and including
    /// `delivery_tag` when `multiple` is set.
    pub fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.cast(Method::BasicAck {
            delivery_tag,
            multiple,
        })?;
        let mut unacked = self.inner.unacked.lock().expect("poisoned lock");
        if multiple {
            *unacked = unacked.split_off(&(delivery_tag + 1));
        } else {
            unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    /// Ask the peer to redeliver unacknowledged deliveries. Consumers are
    /// notified via [`on_recover_ok`](Consumer::on_recover_ok).
    pub fn recover(&self, requeue: bool) -> Result<()> {
        let reply = self.call(Method::BasicRecover { requeue })?;
        expect_reply(reply, "basic.recover-ok", |m| {
            matches!(m, Method::BasicRecoverOk)
        })
    }

    /// Delivery tags seen but not yet acknowledged on this channel.
    pub fn unacked(&self) -> Vec<u64> {
        self.inner
            .unacked
            .lock()
            .expect("poisoned lock")
            .iter()
            .copied()
            .collect()
    }

    /// Close this channel with the full close/close-ok handshake. Other
    /// channels and the connection are unaffected. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("poisoned lock");
            match *state {
                ChannelState::Closing | ChannelState::Closed => return Ok(()),
                _ => *state = ChannelState::Closing,
            }
        }

        let close = Method::ChannelClose {
            reply_code: REPLY_SUCCESS,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        };
        let reply = match self.inner.send_rpc(&self.connection, &close, None) {
            Ok(waiter) => waiter.wait_timeout(self.connection.rpc_timeout()),
            Err(err) => Err(err),
        };

        self.connection.remove_channel(self.id);
        self.inner
            .shutdown(ShutdownCause::app_initiated(REPLY_SUCCESS, "channel closed"));

        match reply {
            Ok(_) | Err(Error::ShutDown(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn expect_reply(reply: Method, expected: &'static str, matches: fn(&Method) -> bool) -> Result<()> {
    if matches(&reply) {
        Ok(())
    } else {
        Err(unexpected_reply(expected, reply))
    }
}

fn unexpected_reply(expected: &'static str, got: Method) -> Error {
    Error::ProtocolViolation(format!("expected {expected}, got {}", got.name()))
}
