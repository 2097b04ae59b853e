//! Pluggable policy for consumer callback faults.

use mqwire_frame::REPLY_INTERNAL_ERROR;
use tracing::{error, warn};

use crate::connection::Connection;
use crate::shutdown::ShutdownCause;

/// A fault raised by application callback code during dispatch.
#[derive(Debug, Clone)]
pub struct ConsumerFault {
    /// The channel whose dispatcher caught the fault.
    pub channel_id: u16,
    /// The offending consumer's tag.
    pub consumer_tag: String,
    /// The dispatch operation that was running ("delivery", "cancel", …).
    pub operation: &'static str,
    /// The panic payload, rendered as text.
    pub message: String,
}

impl std::fmt::Display for ConsumerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "consumer {} crashed during {} on channel {}: {}",
            self.consumer_tag, self.operation, self.channel_id, self.message
        )
    }
}

/// Strategy invoked when a consumer callback faults.
///
/// There is no caller to propagate the fault to (the dispatcher caught it
/// on its own thread), so the handler decides what the fault means for the
/// connection.
pub trait ExceptionHandler: Send + Sync {
    fn on_consumer_fault(&self, connection: &Connection, fault: ConsumerFault);
}

/// Default policy: a misbehaving consumer tears the whole connection down
/// cleanly, rather than silently corrupting delivery ordering or leaking
/// channel state. Performs the full two-way close handshake with an
/// internal-error cause naming the offending consumer.
pub struct CloseConnectionOnFault;

impl ExceptionHandler for CloseConnectionOnFault {
    fn on_consumer_fault(&self, connection: &Connection, fault: ConsumerFault) {
        error!(
            channel = fault.channel_id,
            consumer_tag = %fault.consumer_tag,
            operation = fault.operation,
            "consumer callback fault; closing connection"
        );
        let cause = ShutdownCause::app_initiated(
            REPLY_INTERNAL_ERROR,
            format!("internal error in consumer {}", fault.consumer_tag),
        )
        .with_source(&fault);
        if let Err(err) = connection.close_with_cause(cause) {
            // Teardown still happened; only the handshake was unclean.
            warn!(%err, "close after consumer fault did not complete cleanly");
        }
    }
}

/// Log-and-continue policy for applications that prefer to keep the
/// connection alive across consumer bugs.
pub struct LogConsumerFault;

impl ExceptionHandler for LogConsumerFault {
    fn on_consumer_fault(&self, _connection: &Connection, fault: ConsumerFault) {
        error!(
            channel = fault.channel_id,
            consumer_tag = %fault.consumer_tag,
            operation = fault.operation,
            message = %fault.message,
            "consumer callback fault (ignored)"
        );
    }
}
