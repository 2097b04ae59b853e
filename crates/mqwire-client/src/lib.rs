//! Connection and channel management for the mqwire protocol.
//!
//! This is the concurrency core of mqwire. One socket carries many
//! logically independent channels; one dedicated reader thread per
//! connection fans every inbound frame out to the right place (a blocked
//! synchronous caller, a channel's control handling, or a per-channel
//! consumer dispatcher) and never runs application code itself.
//!
//! # Threading model
//!
//! - One reader thread per [`Connection`] owns the socket's read half.
//! - One dispatcher thread per [`Channel`] runs consumer callbacks in
//!   strict arrival order.
//! - Application threads calling [`Channel::call`] block on a one-shot
//!   continuation until the reader resolves it.
//!
//! A consumer callback that panics is caught on its dispatcher thread and
//! routed to the connection's [`ExceptionHandler`]; the default policy
//! closes the whole connection cleanly rather than limping on with
//! possibly-corrupt channel state.

pub mod channel;
pub mod connection;
pub mod consumer;
mod continuation;
mod dispatcher;
pub mod error;
pub mod handler;
pub mod shutdown;

pub use channel::{Channel, ChannelState, ConsumeOptions};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Tuning};
pub use consumer::{Consumer, Delivery, Envelope};
pub use error::{Error, Result};
pub use handler::{CloseConnectionOnFault, ConsumerFault, ExceptionHandler, LogConsumerFault};
pub use shutdown::{CauseKind, ShutdownCause};

// The protocol vocabulary callers need alongside the client API.
pub use mqwire_frame::{Method, Properties};
