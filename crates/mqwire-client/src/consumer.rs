//! The application-facing consumer callback boundary.

use bytes::Bytes;
use mqwire_frame::Properties;

use crate::shutdown::ShutdownCause;

/// Packaging data for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Server-assigned, channel-scoped sequence number for acknowledgement.
    pub delivery_tag: u64,
    /// True if this message may have been delivered before.
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A fully reassembled inbound message, ready for consumer dispatch.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub envelope: Envelope,
    pub properties: Properties,
    pub body: Bytes,
}

/// Callback set for a subscription on a channel.
///
/// Every method has a no-op default, so implementations override only what
/// they need. All callbacks are invoked from the owning channel's
/// dispatcher thread, never concurrently with each other for the same
/// channel, and never from the connection's reader thread, so a callback
/// is free to call back into the channel (ack, publish, even cancel).
///
/// A panic raised by a callback is caught on the dispatcher thread and
/// routed to the connection's [`ExceptionHandler`](crate::ExceptionHandler);
/// the default handler closes the whole connection.
pub trait Consumer: Send + Sync {
    /// The subscription was registered; `consumer_tag` is final (it may
    /// have been assigned by the server).
    fn on_consume_ok(&self, consumer_tag: &str) {
        let _ = consumer_tag;
    }

    /// The subscription ended in response to a cancel call.
    fn on_cancel_ok(&self, consumer_tag: &str) {
        let _ = consumer_tag;
    }

    /// The server cancelled the subscription (e.g. the queue was deleted).
    fn on_cancel(&self, consumer_tag: &str) {
        let _ = consumer_tag;
    }

    /// The channel or the underlying connection shut down. Always the last
    /// notification a consumer receives.
    fn on_shutdown(&self, consumer_tag: &str, cause: &ShutdownCause) {
        let _ = (consumer_tag, cause);
    }

    /// A recover call completed; unacknowledged deliveries received before
    /// this notification will be redelivered.
    fn on_recover_ok(&self) {}

    /// A message arrived for this subscription.
    fn on_delivery(&self, delivery: Delivery) {
        let _ = delivery;
    }
}
